use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Upper bounds for every blocking wait on an external process.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// One-shot utilities: initdb, psql, pg_dump, pg_controldata, pgbench -i
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// pg_basebackup
    #[serde(default = "default_backup_timeout_ms")]
    pub backup_timeout_ms: u64,

    /// Graceful shutdown window before SIGKILL
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Overall bound on liveness polling after spawn
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Client handshake timeout for regular connections
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            backup_timeout_ms: default_backup_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tool_timeout_ms", self.tool_timeout_ms),
            ("backup_timeout_ms", self.backup_timeout_ms),
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("timeouts.{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn tool(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn backup(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_tool_timeout_ms() -> u64 {
    120_000
}
fn default_backup_timeout_ms() -> u64 {
    300_000
}
fn default_stop_timeout_ms() -> u64 {
    30_000
}
fn default_startup_timeout_ms() -> u64 {
    60_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
