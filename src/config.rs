use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::TapeFlowError;

// =============================================================================
// Constants
// =============================================================================

/// Minimum number of worker threads per pool
pub const MIN_WORKER_THREADS: usize = 1;

/// Maximum number of worker threads per pool
pub const MAX_WORKER_THREADS: usize = 64;

/// Default size of the buffer used when streaming file data off tape
pub const DEFAULT_READ_BUFFER_SIZE: usize = 512 * 1024;

// =============================================================================
// Global Configuration State
// =============================================================================

pub static CONFIG: OnceCell<Config> = OnceCell::new();

// =============================================================================
// Core Types
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub intake: IntakeConfig,
    pub recall: RecallConfig,
    pub inventory: InventoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Directory holding the queue database; defaults to the data dir.
    pub db_dir: Option<PathBuf>,
    pub in_memory: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Maximum concurrency of the AddJob pool.
    pub threads: usize,
    pub queue_depth: usize,
    /// Filesystems re-attached at startup if already HSM-managed.
    pub filesystems: Vec<PathBuf>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        IntakeConfig {
            threads: 16,
            queue_depth: 100,
            filesystems: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecallConfig {
    pub threads: usize,
    pub queue_depth: usize,
    pub read_buffer_size: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        RecallConfig {
            threads: 4,
            queue_depth: 100,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryConfig {
    pub drives: Vec<String>,
    pub cartridges: Vec<String>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            drives: vec!["D00".to_string()],
            cartridges: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads `config.toml` from the project config directory; a missing file
    /// yields the defaults, a malformed one is an error.
    pub fn load(project_dirs: &ProjectDirs) -> Result<Config, TapeFlowError> {
        let config_path = project_dirs.config_dir().join("config.toml");

        let config = if config_path.is_file() {
            let raw = fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&raw).map_err(|err| {
                TapeFlowError::Config(format!("'{}': {}", config_path.display(), err))
            })?
        } else {
            Config::default()
        };

        Ok(config.clamped())
    }

    /// The process-wide configuration; defaults if none was installed.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::default)
    }

    fn clamped(mut self) -> Config {
        self.intake.threads = self
            .intake
            .threads
            .clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS);
        self.recall.threads = self
            .recall
            .threads
            .clamp(MIN_WORKER_THREADS, MAX_WORKER_THREADS);
        self
    }
}
