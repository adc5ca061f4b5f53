use std::collections::BTreeMap;

use nix::sys::signal::Signal;
use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Settings shared by every server instance of a harness.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the servers listen on and clients connect to
    #[serde(default = "default_host")]
    pub host: String,

    /// Database superuser created by `initdb`; current OS user when unset
    #[serde(default)]
    pub username: Option<String>,

    /// Signal used for a graceful stop before escalating to SIGKILL
    #[serde(default)]
    pub shutdown_mode: ShutdownMode,

    /// Method written into every `pg_hba.conf` rule
    #[serde(default = "default_auth_method")]
    pub auth_method: String,

    /// Built-in server settings; node overrides are layered on top
    #[serde(default = "default_settings")]
    pub default_settings: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            username: None,
            shutdown_mode: ShutdownMode::default(),
            auth_method: default_auth_method(),
            default_settings: default_settings(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(invalid("server.host cannot be empty"));
        }
        if self.auth_method.is_empty() {
            return Err(invalid("server.auth_method cannot be empty"));
        }
        if let Some(name) = &self.username {
            if name.is_empty() {
                return Err(invalid("server.username cannot be empty"));
            }
        }
        Ok(())
    }

    /// Configured superuser, or the OS user running the tests.
    pub fn username(&self) -> String {
        if let Some(name) = &self.username {
            return name.clone();
        }
        current_os_user()
    }
}

/// PostgreSQL shutdown modes, mapped onto the postmaster's signals.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Wait for clients to disconnect
    Smart,
    /// Abort open transactions, then checkpoint
    #[default]
    Fast,
    /// Abort without a clean checkpoint; recovery runs on next start
    Immediate,
}

impl ShutdownMode {
    pub fn signal(&self) -> Signal {
        match self {
            ShutdownMode::Smart => Signal::SIGTERM,
            ShutdownMode::Fast => Signal::SIGINT,
            ShutdownMode::Immediate => Signal::SIGQUIT,
        }
    }
}

pub(crate) fn current_os_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "postgres".to_string())
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_auth_method() -> String {
    "trust".to_string()
}
fn default_settings() -> BTreeMap<String, String> {
    [
        ("fsync", "off"),
        ("full_page_writes", "off"),
        ("log_statement", "all"),
        ("log_line_prefix", "%m [%p] %q%a "),
        ("max_connections", "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
