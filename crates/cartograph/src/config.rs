//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Names and policies the engine needs to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Principal user table; `belongs_to` it is treated specially.
    pub user_table: String,
    /// Privilege-group table; `has_many` toward it gets no state companion.
    pub group_table: String,
    /// State-machine descriptor table referenced by `_state` companions.
    pub state_machine_table: String,
    /// Table holding the world records.
    pub world_table: String,
    /// Give every table an owner (`belongs_to` user) and groups (`has_many` group).
    pub implicit_ownership: bool,
    pub bootstrap: BootstrapPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_table: "user_account".to_string(),
            group_table: "usergroup".to_string(),
            state_machine_table: "smd".to_string(),
            world_table: "world".to_string(),
            implicit_ownership: false,
            bootstrap: BootstrapPolicy::default(),
        }
    }
}

/// What to do while the system has no administrator yet.
///
/// While the user table holds fewer than `widen_when_fewer_than` rows, the
/// system is considered to have no admin. Tables first recorded during that
/// window get a fully open permission when `enabled` is set. Records that
/// already exist are never widened, so tightening them later sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapPolicy {
    pub enabled: bool,
    pub widen_when_fewer_than: u64,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            widen_when_fewer_than: 2,
        }
    }
}

impl BootstrapPolicy {
    pub fn system_has_no_admin(&self, user_count: u64) -> bool {
        user_count < self.widen_when_fewer_than
    }

    pub fn should_widen(&self, user_count: u64) -> bool {
        self.enabled && self.system_has_no_admin(user_count)
    }
}
