use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Top-level config (taskcron.toml + TASKCRON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskcronConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for the tick loop and its dispatch workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two ticks of the engine loop.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on dispatches running at the same time.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// An execution attempt still running after this many seconds is a
    /// `Timeout` failure.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Rows fetched per page when streaming tasks out of the store.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            worker_count: DEFAULT_WORKER_COUNT,
            dispatch_timeout_secs: DEFAULT_DISPATCH_TIMEOUT_SECS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Where the file-backed execution sink drops its marker objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_dispatch_timeout_secs() -> u64 {
    DEFAULT_DISPATCH_TIMEOUT_SECS
}
fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
fn default_db_path() -> String {
    format!("{}/taskcron.db", home_dir())
}
fn default_artifact_dir() -> String {
    format!("{}/artifacts", home_dir())
}

fn home_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskcron", home)
}

impl TaskcronConfig {
    /// Load config from a TOML file with TASKCRON_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.taskcron/taskcron.toml
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TASKCRON_SCHEDULER__WORKER_COUNT=8`. A missing file is not an error;
    /// every section has defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TaskcronConfig = Figment::from(Serialized::defaults(TaskcronConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKCRON_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_count == 0 {
            return Err(CoreError::Config(
                "scheduler.worker_count must be at least 1".to_string(),
            ));
        }
        if self.scheduler.page_size == 0 {
            return Err(CoreError::Config(
                "scheduler.page_size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the database parent directory and the artifact directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&self.sink.artifact_dir)?;
        Ok(())
    }
}

fn default_config_path() -> String {
    format!("{}/taskcron.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = TaskcronConfig::load(Some("does-not-exist.toml")).expect("load");
            assert_eq!(config.gateway.port, DEFAULT_PORT);
            assert_eq!(config.scheduler.worker_count, DEFAULT_WORKER_COUNT);
            assert_eq!(config.scheduler.page_size, DEFAULT_PAGE_SIZE);
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "taskcron.toml",
                r#"
                [scheduler]
                worker_count = 2
                dispatch_timeout_secs = 5

                [database]
                path = "/tmp/tc.db"
                "#,
            )?;
            jail.set_env("TASKCRON_SCHEDULER__WORKER_COUNT", "8");

            let config = TaskcronConfig::load(Some("taskcron.toml")).expect("load");
            assert_eq!(config.scheduler.worker_count, 8);
            assert_eq!(config.scheduler.dispatch_timeout_secs, 5);
            assert_eq!(config.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
            assert_eq!(config.database.path, "/tmp/tc.db");
            Ok(())
        });
    }

    #[test]
    fn zero_workers_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("taskcron.toml", "[scheduler]\nworker_count = 0\n")?;
            let err = TaskcronConfig::load(Some("taskcron.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
