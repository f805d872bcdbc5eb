//! # Configuration
//!
//! Store settings with a clear override hierarchy:
//! defaults → config file → env vars.
//!
//! The conventional location is `~/.target-store/config.toml`; hosts pass
//! whichever path they use to [`load_config`]. Nothing here writes files.
//!
//! ```toml
//! [store]
//! name = "player"       # TARGET_STORE_NAME
//! auto_flush = true     # TARGET_STORE_AUTO_FLUSH
//!
//! [logging]
//! level = "info"        # TARGET_STORE_LOG_LEVEL
//! file = "store.log"    # omit to log to stderr
//! ```

use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// Config Structs (all fields Option<T> for sparse TOML)
// ============================================================================

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreFileConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreSection {
    pub name: Option<String>,
    pub auto_flush: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_NAME: &str = "store";
pub const DEFAULT_AUTO_FLUSH: bool = true;
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

pub const ENV_NAME: &str = "TARGET_STORE_NAME";
pub const ENV_AUTO_FLUSH: &str = "TARGET_STORE_AUTO_FLUSH";
pub const ENV_LOG_LEVEL: &str = "TARGET_STORE_LOG_LEVEL";

// ============================================================================
// Resolved Config (concrete values, no Options)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub name: String,
    pub auto_flush: bool,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            auto_flush: DEFAULT_AUTO_FLUSH,
            log_level: DEFAULT_LOG_LEVEL,
            log_file: None,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Returns the path to `~/.target-store/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".target-store").join("config.toml"))
}

/// Loads config from an explicit path. A missing file is an error here.
pub fn load_config(path: &Path) -> Result<StoreFileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: StoreFileConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
    info!("Loaded config from {}", path.display());
    debug!("Config: {:?}", config);
    Ok(config)
}

// ============================================================================
// Resolution
// ============================================================================

/// Collapses defaults → config file → process environment.
pub fn resolve(config: &StoreFileConfig) -> ResolvedConfig {
    resolve_with(config, |key| std::env::var(key).ok())
}

/// Same as [`resolve`] with an explicit environment lookup.
pub fn resolve_with(config: &StoreFileConfig, env: impl Fn(&str) -> Option<String>) -> ResolvedConfig {
    let name = env(ENV_NAME)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| config.store.name.clone())
        .unwrap_or_else(|| DEFAULT_NAME.to_string());

    let auto_flush = env(ENV_AUTO_FLUSH)
        .and_then(|raw| parse_bool(&raw).or_else(|| ignored(ENV_AUTO_FLUSH, &raw)))
        .or(config.store.auto_flush)
        .unwrap_or(DEFAULT_AUTO_FLUSH);

    let log_level = env(ENV_LOG_LEVEL)
        .and_then(|raw| parse_level(&raw).or_else(|| ignored(ENV_LOG_LEVEL, &raw)))
        .or_else(|| {
            config.logging.level.as_deref().and_then(|raw| {
                parse_level(raw).or_else(|| ignored("logging.level", raw))
            })
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);

    ResolvedConfig {
        name,
        auto_flush,
        log_level,
        log_file: config.logging.file.clone(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_level(raw: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(raw.trim()).ok()
}

fn ignored<T>(setting: &str, raw: &str) -> Option<T> {
    warn!("Ignoring invalid value {:?} for {}", raw, setting);
    None
}
