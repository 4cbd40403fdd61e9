use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// A row/table permission bitmask.
///
/// Three groups of seven bits: guest, owner-user and group. Each group
/// carries peek, read, create, update, delete, execute and refer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub u64);

const GUEST_SHIFT: u32 = 0;
const USER_SHIFT: u32 = 7;
const GROUP_SHIFT: u32 = 14;

impl Permission {
    pub const NONE: Permission = Permission(0);

    pub const PEEK: u64 = 1 << 0;
    pub const READ: u64 = 1 << 1;
    pub const CREATE: u64 = 1 << 2;
    pub const UPDATE: u64 = 1 << 3;
    pub const DELETE: u64 = 1 << 4;
    pub const EXECUTE: u64 = 1 << 5;
    pub const REFER: u64 = 1 << 6;

    /// Every bit in a group.
    pub const CRUD_ALL: u64 = Self::PEEK
        | Self::READ
        | Self::CREATE
        | Self::UPDATE
        | Self::DELETE
        | Self::EXECUTE
        | Self::REFER;

    /// Permission applied to a freshly recorded table.
    pub const DEFAULT: Permission = Permission(
        (Self::PEEK << GUEST_SHIFT) | (Self::CRUD_ALL << USER_SHIFT) | (Self::CRUD_ALL << GROUP_SHIFT),
    );

    /// Everything, for everyone.
    pub const ALLOW_ALL: Permission = Permission(
        (Self::CRUD_ALL << GUEST_SHIFT)
            | (Self::CRUD_ALL << USER_SHIFT)
            | (Self::CRUD_ALL << GROUP_SHIFT),
    );

    /// Audit and translation tables: guests may write, groups may read.
    pub const COMPANION: Permission = Permission(
        ((Self::CREATE | Self::READ) << GUEST_SHIFT) | (Self::READ << GROUP_SHIFT),
    );

    pub const fn guest(bits: u64) -> Permission {
        Permission((bits & Self::CRUD_ALL) << GUEST_SHIFT)
    }

    pub const fn user(bits: u64) -> Permission {
        Permission((bits & Self::CRUD_ALL) << USER_SHIFT)
    }

    pub const fn group(bits: u64) -> Permission {
        Permission((bits & Self::CRUD_ALL) << GROUP_SHIFT)
    }

    pub fn contains(&self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permission(self.0 | rhs.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
