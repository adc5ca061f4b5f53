//! Renders server configuration into an instance's data directory.
//!
//! `postgresql.conf` is fully owned by the harness: the file produced by
//! `initdb` is moved aside once as `postgresql.base.conf` and pulled back in
//! through an `include`, so rendering again with the same inputs yields
//! byte-identical files.


use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::warn;

use crate::errors::path_error;
use crate::Result;

pub const CONFIG_FILE: &str = "postgresql.conf";
pub const BASE_CONFIG_FILE: &str = "postgresql.base.conf";
pub const HBA_FILE: &str = "pg_hba.conf";
pub const STANDBY_SIGNAL_FILE: &str = "standby.signal";
pub const RECOVERY_FILE: &str = "recovery.conf";

/// Tied to the allocated port and probed by liveness checks; never overridable.
pub const MANAGED_SETTINGS: [&str; 3] = ["port", "listen_addresses", "unix_socket_directories"];

const HEADER: &str = "# Generated by pg-testbed. Manual edits are lost on the next render.\n";

/// Connection details of the server a replica streams from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Replica's own name, reported in `pg_stat_replication`
    pub application_name: String,
}

impl Upstream {
    /// libpq connection string for `primary_conninfo`.
    pub fn conninfo(&self) -> String {
        format!(
            "application_name={} host={} port={} user={}",
            conninfo_value(&self.application_name),
            conninfo_value(&self.host),
            self.port,
            conninfo_value(&self.username)
        )
    }
}

/// How a replica declares standby mode to its server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyMarker {
    /// 12 and later: `standby.signal` plus `primary_conninfo` in the settings file
    SignalFile,
    /// Before 12: `recovery.conf` with `standby_mode = 'on'`
    RecoveryConf,
}

/// Everything that goes into the rendered files.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub listen_address: String,
    /// `None` disables unix-domain sockets
    pub socket_dir: Option<PathBuf>,
    pub defaults: BTreeMap<String, String>,
    /// Wins over every source except [`MANAGED_SETTINGS`]
    pub overrides: BTreeMap<String, String>,
    pub allow_streaming: bool,
    pub auth_method: String,
    pub replica: Option<(Upstream, StandbyMarker)>,
}

impl ServerSettings {
    /// Merged `name -> value` map in the order sources are layered. The
    /// allocated port and the listen settings always come last.
    pub fn resolved(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            settings.insert(k.to_string(), v);
        };

        set("log_destination", "stderr".to_string());
        set("logging_collector", "off".to_string());

        for (k, v) in &self.defaults {
            set(k, v.clone());
        }

        if self.allow_streaming {
            set("wal_level", "replica".to_string());
            set("max_wal_senders", "10".to_string());
            set("max_replication_slots", "10".to_string());
            set("hot_standby", "on".to_string());
        }

        if let Some((upstream, marker)) = &self.replica {
            set("hot_standby", "on".to_string());
            if *marker == StandbyMarker::SignalFile {
                set("primary_conninfo", upstream.conninfo());
            }
        }

        for (k, v) in &self.overrides {
            if MANAGED_SETTINGS.contains(&k.as_str()) {
                warn!("ignoring override {} = {}: managed by the harness", k, v);
                continue;
            }
            set(k, v.clone());
        }

        set("port", self.port.to_string());
        set("listen_addresses", self.listen_address.clone());
        set(
            "unix_socket_directories",
            self.socket_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        );

        settings
    }
}

/// Writes `postgresql.conf`, `pg_hba.conf` and the replica markers.
pub fn render(
    data_dir: &Path,
    settings: &ServerSettings,
) -> Result<()> {
    preserve_base_config(data_dir)?;

    let mut conf = String::from(HEADER);
    let _ = writeln!(conf, "include '{}'", BASE_CONFIG_FILE);
    for (name, value) in settings.resolved() {
        let _ = writeln!(conf, "{} = {}", name, quote(&value));
    }
    write(&data_dir.join(CONFIG_FILE), &conf)?;

    write(&data_dir.join(HBA_FILE), &hba_rules(settings))?;

    write_standby_markers(data_dir, settings.replica.as_ref())?;

    debug!("rendered configuration into {:?}", data_dir);
    Ok(())
}

/// Appends one raw line to a file in the data directory.
pub fn append(
    data_dir: &Path,
    file: &str,
    line: &str,
) -> Result<()> {
    use std::io::Write;

    let path = data_dir.join(file);
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| path_error(&path, e))?;
    writeln!(f, "{}", line).map_err(|e| path_error(&path, e))
}

/// Parses `name = value` lines of a settings file, later lines winning.
/// Includes are not followed.
pub fn read_settings(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path).map_err(|e| path_error(path, e))?;
    let mut settings = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("include") {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            settings.insert(name.trim().to_string(), unquote(value.trim()));
        }
    }
    Ok(settings)
}

/// Value as written to a settings file: bare when PostgreSQL accepts it
/// unquoted (numbers, identifiers, numbers with units), quoted otherwise.
pub fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && (value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || value.parse::<f64>().is_ok());
    if bare {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn preserve_base_config(data_dir: &Path) -> Result<()> {
    let base = data_dir.join(BASE_CONFIG_FILE);
    if base.exists() {
        return Ok(());
    }
    let conf = data_dir.join(CONFIG_FILE);
    if conf.exists() {
        std::fs::rename(&conf, &base).map_err(|e| path_error(&conf, e))
    } else {
        write(&base, "")
    }
}

fn hba_rules(settings: &ServerSettings) -> String {
    let method = &settings.auth_method;
    let mut loopback: Vec<String> = vec!["127.0.0.1/32".to_string(), "::1/128".to_string()];
    if let Ok(ip) = settings.listen_address.parse::<IpAddr>() {
        if !ip.is_loopback() && !ip.is_unspecified() {
            let mask = if ip.is_ipv4() { 32 } else { 128 };
            loopback.push(format!("{ip}/{mask}"));
        }
    }

    let mut hba = String::from(HEADER);
    let _ = writeln!(hba, "{}", HbaRule::local("all", method));
    for address in &loopback {
        let _ = writeln!(hba, "{}", HbaRule::host("all", address, method));
    }
    if settings.allow_streaming {
        let _ = writeln!(hba, "{}", HbaRule::local("replication", method));
        for address in &loopback {
            let _ = writeln!(hba, "{}", HbaRule::host("replication", address, method));
        }
    }
    hba
}

struct HbaRule<'a> {
    kind: &'static str,
    database: &'a str,
    address: &'a str,
    method: &'a str,
}

impl<'a> HbaRule<'a> {
    fn local(
        database: &'a str,
        method: &'a str,
    ) -> Self {
        Self {
            kind: "local",
            database,
            address: "",
            method,
        }
    }

    fn host(
        database: &'a str,
        address: &'a str,
        method: &'a str,
    ) -> Self {
        Self {
            kind: "host",
            database,
            address,
            method,
        }
    }
}

impl fmt::Display for HbaRule<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "{:<8}{:<16}{:<8}{:<24}{}",
            self.kind, self.database, "all", self.address, self.method
        )
    }
}

fn write_standby_markers(
    data_dir: &Path,
    replica: Option<&(Upstream, StandbyMarker)>,
) -> Result<()> {
    let signal = data_dir.join(STANDBY_SIGNAL_FILE);
    let recovery = data_dir.join(RECOVERY_FILE);

    match replica {
        Some((_, StandbyMarker::SignalFile)) => {
            remove_if_exists(&recovery)?;
            write(&signal, "")
        }
        Some((upstream, StandbyMarker::RecoveryConf)) => {
            remove_if_exists(&signal)?;
            let body = format!(
                "{HEADER}primary_conninfo = {}\nstandby_mode = 'on'\n",
                quote(&upstream.conninfo())
            );
            write(&recovery, &body)
        }
        None => {
            remove_if_exists(&signal)?;
            remove_if_exists(&recovery)
        }
    }
}

fn write(
    path: &Path,
    contents: &str,
) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| path_error(path, e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(path_error(path, e)),
    }
}
