//! Configuration file handling.
//!
//! Looks for `.config/cartograph.toml` in the current directory or any parent
//! directory. `DATABASE_URL` overrides the configured database.

use camino::{Utf8Path, Utf8PathBuf};
use cartograph::{Declarations, EngineConfig};
use serde::Deserialize;

const CONFIG_FILE: &str = ".config/cartograph.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `postgres://`, `mysql://` or `sqlite://` URL.
    pub database_url: Option<String>,
    /// JSON file with the declared tables and relations, relative to the
    /// project root (the directory holding `.config/`).
    pub declarations: Option<Utf8PathBuf>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// A loaded configuration and where it came from.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub root: Utf8PathBuf,
}

impl Loaded {
    /// Read the declarations file, or start from nothing if none is configured.
    pub fn declarations(&self) -> Result<Declarations, ConfigError> {
        let Some(path) = &self.config.declarations else {
            return Ok(Declarations::default());
        };
        let path = self.root.join(path);
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e.to_string()))?;
        Declarations::from_json(&content).map_err(|e| ConfigError::Declarations(path, e.to_string()))
    }

    pub fn database_url(&self, flag: Option<&str>) -> Result<String, ConfigError> {
        flag.map(str::to_string)
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .or_else(|| self.config.database_url.clone())
            .ok_or(ConfigError::NoDatabase)
    }
}

/// Load configuration, searching up from the current directory.
///
/// A missing file is not an error: defaults apply and the current
/// directory is the project root.
pub fn load() -> Result<Loaded, ConfigError> {
    let cwd = std::env::current_dir()
        .map_err(|e| ConfigError::Io(Utf8PathBuf::from("."), e.to_string()))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| ConfigError::NonUtf8(p.display().to_string()))?;
    load_from(&cwd)
}

pub fn load_from(start: &Utf8Path) -> Result<Loaded, ConfigError> {
    let Some(path) = find_config_file(start) else {
        return Ok(Loaded {
            config: Config::default(),
            root: start.to_path_buf(),
        });
    };
    let content =
        std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e.to_string()))?;
    let config = Config::parse(&content)?;

    // .config/cartograph.toml -> project root
    let root = path
        .parent()
        .and_then(Utf8Path::parent)
        .unwrap_or(start)
        .to_path_buf();
    Ok(Loaded { config, root })
}

fn find_config_file(start: &Utf8Path) -> Option<Utf8PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.exists())
}

#[derive(Debug)]
pub enum ConfigError {
    Io(Utf8PathBuf, String),
    Parse(String),
    Declarations(Utf8PathBuf, String),
    NonUtf8(String),
    /// No `--database-url`, no `DATABASE_URL`, nothing in the file.
    NoDatabase,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Failed to read {}: {}", path, e),
            ConfigError::Parse(e) => write!(f, "Failed to parse {}: {}", CONFIG_FILE, e),
            ConfigError::Declarations(path, e) => {
                write!(f, "Invalid declarations in {}: {}", path, e)
            }
            ConfigError::NonUtf8(path) => write!(f, "Path is not UTF-8: {}", path),
            ConfigError::NoDatabase => write!(
                f,
                "No database configured: pass --database-url, set DATABASE_URL, or add database_url to {}",
                CONFIG_FILE
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
