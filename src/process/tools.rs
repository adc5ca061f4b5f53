use std::cmp::Ordering;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::debug;
use tracing::warn;

use super::run;
use super::ToolCommand;
use crate::Error;
use crate::Result;
use crate::SystemError;
use crate::ToolFailure;
use crate::ToolsConfig;

/// External PostgreSQL programs driven by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Initdb,
    Postgres,
    PgBasebackup,
    Pgbench,
    Psql,
    PgDump,
    PgControldata,
    PgConfig,
}

impl Tool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Initdb => "initdb",
            Tool::Postgres => "postgres",
            Tool::PgBasebackup => "pg_basebackup",
            Tool::Pgbench => "pgbench",
            Tool::Psql => "psql",
            Tool::PgDump => "pg_dump",
            Tool::PgControldata => "pg_controldata",
            Tool::PgConfig => "pg_config",
        }
    }
}

/// Locates binaries following the configured search order and caches
/// what `pg_config` and `postgres --version` report.
#[derive(Debug)]
pub struct ToolResolver {
    bin_dir: Option<PathBuf>,
    cache_pg_config: bool,
    pg_config_bindir: OnceCell<Option<PathBuf>>,
    version: OnceCell<ServerVersion>,
    tool_timeout: Duration,
}

impl ToolResolver {
    pub fn new(
        config: &ToolsConfig,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            bin_dir: config.bin_dir.clone(),
            cache_pg_config: config.cache_pg_config,
            pg_config_bindir: OnceCell::new(),
            version: OnceCell::new(),
            tool_timeout,
        }
    }

    /// Full path of `tool`, or its bare name when nothing better is known
    /// (the OS then searches `PATH` at spawn time).
    pub async fn resolve(
        &self,
        tool: Tool,
    ) -> PathBuf {
        let name = tool.binary_name();

        if let Some(dir) = &self.bin_dir {
            return dir.join(name);
        }

        if let Some(dir) = env::var_os("PG_BIN") {
            return PathBuf::from(dir).join(name);
        }

        if tool != Tool::PgConfig {
            if let Some(dir) = self.pg_config_bindir().await {
                return dir.join(name);
            }
        }

        find_in_path(name).unwrap_or_else(|| PathBuf::from(name))
    }

    pub async fn command(
        &self,
        tool: Tool,
    ) -> ToolCommand {
        ToolCommand::new(self.resolve(tool).await)
    }

    /// Version reported by `postgres --version`, fetched once.
    pub async fn server_version(&self) -> Result<ServerVersion> {
        self.version
            .get_or_try_init(|| async {
                let cmd = self.command(Tool::Postgres).await.arg("--version");
                let output = run(&cmd, self.tool_timeout).await?;
                if !output.success() {
                    return Err(Error::Tool(ToolFailure {
                        program: cmd.program_name(),
                        output,
                    }));
                }
                let version = ServerVersion::from_version_output(&output.stdout)?;
                debug!("server version {}", version);
                Ok(version)
            })
            .await
            .cloned()
    }

    async fn pg_config_bindir(&self) -> Option<PathBuf> {
        if self.cache_pg_config {
            self.pg_config_bindir.get_or_init(|| self.query_pg_config()).await.clone()
        } else {
            self.query_pg_config().await
        }
    }

    async fn query_pg_config(&self) -> Option<PathBuf> {
        let pg_config = match env::var_os("PG_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => find_in_path(Tool::PgConfig.binary_name())?,
        };

        let cmd = ToolCommand::new(pg_config).arg("--bindir");
        match run(&cmd, self.tool_timeout).await {
            Ok(output) if output.success() => {
                let dir = output.stdout.trim();
                (!dir.is_empty()).then(|| PathBuf::from(dir))
            }
            Ok(output) => {
                warn!("pg_config --bindir failed: {}", output.stderr_tail(3));
                None
            }
            Err(e) => {
                warn!("pg_config --bindir failed: {}", e);
                None
            }
        }
    }
}

/// First executable file named `name` on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Loosely parsed server version: numeric components compared in order,
/// so `10.0 > 10 > 9.6.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    parts: Vec<u32>,
}

impl ServerVersion {
    pub fn new(parts: Vec<u32>) -> Self {
        Self { parts }
    }

    /// Parses `postgres (PostgreSQL) 16.2 (Debian 16.2-1.pgdg120+1)`.
    pub fn from_version_output(output: &str) -> Result<Self> {
        output
            .split_whitespace()
            .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
            .ok_or_else(|| {
                SystemError::UnexpectedOutput(format!("no version number in {:?}", output.trim())).into()
            })
            .and_then(|token| token.parse())
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    pub fn at_least(
        &self,
        other: &[u32],
    ) -> bool {
        self.parts.as_slice() >= other
    }

    /// Standby mode is declared by `standby.signal` instead of `recovery.conf`.
    pub fn uses_standby_signal(&self) -> bool {
        self.at_least(&[12])
    }

    /// WAL functions were renamed from `xlog` to `wal` in 10.
    pub fn uses_wal_naming(&self) -> bool {
        self.at_least(&[10])
    }
}

impl FromStr for ServerVersion {
    type Err = Error;

    /// Accepts `9.6.5`, `10.0`, `16beta1`, `17rc1`: parsing stops at the
    /// first non-numeric suffix.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for component in s.trim().split('.') {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(
                digits
                    .parse()
                    .map_err(|_| SystemError::UnexpectedOutput(format!("bad version component in {s:?}")))?,
            );
            if digits.len() != component.len() {
                break;
            }
        }
        if parts.is_empty() {
            return Err(SystemError::UnexpectedOutput(format!("bad version string {s:?}")).into());
        }
        Ok(Self { parts })
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let joined: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        write!(f, "{}", joined.join("."))
    }
}
