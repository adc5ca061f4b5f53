//! `/bin/sh` stand-ins for the PostgreSQL binaries, so the lifecycle can be
//! exercised without a server installation.
//!
//! Every script appends its arguments to `<bin>/<tool>.calls` before doing
//! anything else.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use crate::Harness;
use crate::HarnessConfig;
use crate::MockClientBackend;
use crate::Tool;

const PRELUDE: &str = r##"#!/bin/sh
echo "$*" >> "$0.calls"
"##;

pub const INITDB: &str = r##"
data=""
while [ $# -gt 0 ]; do
    case "$1" in
        -D) data="$2"; shift 2 ;;
        *) shift ;;
    esac
done
[ -n "$data" ] || { echo "initdb: error: no data directory specified" >&2; exit 1; }
mkdir -p "$data" || exit 1
echo "16" > "$data/PG_VERSION"
echo "# initdb defaults" > "$data/postgresql.conf"
echo "local all all peer" > "$data/pg_hba.conf"
echo "Success. You can now start the database server."
"##;

pub const INITDB_FAILING: &str = r##"
echo "initdb: error: invalid locale settings" >&2
exit 1
"##;

pub const POSTGRES: &str = r##"
if [ "$1" = "--version" ]; then
    echo "postgres (PostgreSQL) 16.2"
    exit 0
fi
echo "LOG:  database system is ready to accept connections"
exec sleep 300
"##;

/// Ignores every shutdown signal; only SIGKILL gets rid of it.
pub const POSTGRES_UNSTOPPABLE: &str = r##"
if [ "$1" = "--version" ]; then
    echo "postgres (PostgreSQL) 16.2"
    exit 0
fi
trap '' INT TERM QUIT
echo "LOG:  database system is ready to accept connections"
exec sleep 300
"##;

pub const POSTGRES_CRASHING: &str = r##"
if [ "$1" = "--version" ]; then
    echo "postgres (PostgreSQL) 16.2"
    exit 0
fi
echo "FATAL:  could not create lock file \"postmaster.pid\"" >&2
exit 1
"##;

pub const POSTGRES_11: &str = r##"
if [ "$1" = "--version" ]; then
    echo "postgres (PostgreSQL) 11.22"
    exit 0
fi
echo "LOG:  database system is ready to accept connections"
exec sleep 300
"##;

pub const PG_BASEBACKUP: &str = r##"
dest=""
while [ $# -gt 0 ]; do
    case "$1" in
        -D) dest="$2"; shift 2 ;;
        *) shift ;;
    esac
done
mkdir -p "$dest" || exit 1
echo "16" > "$dest/PG_VERSION"
echo "# copied from primary" > "$dest/postgresql.conf"
echo "local all all trust" > "$dest/pg_hba.conf"
mkdir -p "$dest/base/1"
echo "heap" > "$dest/base/1/1259"
"##;

pub const PG_BASEBACKUP_FAILING: &str = r##"
echo "pg_basebackup: error: connection to server failed: Connection refused" >&2
exit 1
"##;

pub const PGBENCH: &str = r##"
for a in "$@"; do
    case "$a" in
        -i) echo "done in 0.05 s (drop tables 0.00 s, create tables 0.01 s)." >&2; exit 0 ;;
        --fail) echo "pgbench: error: connection to server failed" >&2; exit 2 ;;
    esac
done
echo "number of transactions actually processed: 10/10"
echo "tps = 512.000000 (without initial connection time)"
"##;

pub const PGBENCH_FAILING: &str = r##"
echo "pgbench: error: could not connect to server" >&2
exit 1
"##;

/// Echoes `-c` queries; anything containing `error` fails like
/// `ON_ERROR_STOP` would.
pub const PSQL: &str = r##"
query=""
file=""
while [ $# -gt 0 ]; do
    case "$1" in
        -c) query="$2"; shift 2 ;;
        -f) file="$2"; shift 2 ;;
        *) shift ;;
    esac
done
if [ -n "$file" ]; then
    cat "$file" > /dev/null || exit 2
    exit 0
fi
case "$query" in
    *error*) echo "ERROR:  syntax error at or near \"error\"" >&2; exit 3 ;;
esac
echo "$query"
"##;

pub const PG_DUMP: &str = r##"
db=""
file=""
while [ $# -gt 0 ]; do
    case "$1" in
        -d) db="$2"; shift 2 ;;
        -f) file="$2"; shift 2 ;;
        *) shift ;;
    esac
done
echo "-- PostgreSQL database dump of $db" > "$file"
"##;

pub const PG_CONTROLDATA: &str = r##"
echo "pg_control version number:            1300"
echo "Database cluster state:               shut down"
echo "Latest checkpoint location:           0/1700A28"
"##;

/// Logged by the fake servers once their signal handling is in place.
pub const READY_LINE: &str = "database system is ready to accept connections";

/// Waits until `log` holds `starts` ready lines, one per server start.
///
/// The mocked handshake succeeds as soon as the script is spawned, before the
/// shell has installed its traps or recorded its call.
pub async fn wait_until_ready(
    log: &Path,
    starts: usize,
) {
    for _ in 0..100 {
        let ready = fs::read_to_string(log)
            .map(|content| content.matches(READY_LINE).count())
            .unwrap_or_default();
        if ready >= starts {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{starts} ready lines never appeared in {log:?}");
}

/// Directory of fake binaries plus a scratch base directory for leases.
pub struct FakeToolbox {
    bin: TempDir,
    base: TempDir,
}

impl FakeToolbox {
    /// Every tool installed with its well-behaved script.
    pub fn new() -> Self {
        let toolbox = Self {
            bin: TempDir::new().expect("create fake bin dir"),
            base: TempDir::new().expect("create fake base dir"),
        };
        toolbox.install(Tool::Initdb, INITDB);
        toolbox.install(Tool::Postgres, POSTGRES);
        toolbox.install(Tool::PgBasebackup, PG_BASEBACKUP);
        toolbox.install(Tool::Pgbench, PGBENCH);
        toolbox.install(Tool::Psql, PSQL);
        toolbox.install(Tool::PgDump, PG_DUMP);
        toolbox.install(Tool::PgControldata, PG_CONTROLDATA);
        toolbox
    }

    pub fn bin_dir(&self) -> &Path {
        self.bin.path()
    }

    pub fn base_dir(&self) -> &Path {
        self.base.path()
    }

    pub fn install(
        &self,
        tool: Tool,
        body: &str,
    ) {
        let path = self.bin.path().join(tool.binary_name());
        fs::write(&path, format!("{PRELUDE}{body}")).expect("write fake tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
    }

    fn calls_file(
        &self,
        tool: Tool,
    ) -> PathBuf {
        self.bin.path().join(format!("{}.calls", tool.binary_name()))
    }

    /// Argument lines of every invocation of `tool` so far.
    pub fn calls(
        &self,
        tool: Tool,
    ) -> Vec<String> {
        fs::read_to_string(self.calls_file(tool))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Fast timeouts and a liveness policy that gives up quickly.
    pub fn config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.allocator.base_dir = Some(self.base.path().to_path_buf());
        config.tools.bin_dir = Some(self.bin.path().to_path_buf());
        config.server.username = Some("tester".to_string());
        config.timeouts.tool_timeout_ms = 5_000;
        config.timeouts.backup_timeout_ms = 5_000;
        config.timeouts.stop_timeout_ms = 1_000;
        config.timeouts.startup_timeout_ms = 2_000;
        config.timeouts.connect_timeout_ms = 500;
        config.retry.liveness.max_retries = 20;
        config.retry.liveness.timeout_ms = 200;
        config.retry.liveness.base_delay_ms = 10;
        config.retry.liveness.max_delay_ms = 50;
        config
    }

    pub fn harness(
        &self,
        backend: MockClientBackend,
    ) -> Harness<MockClientBackend> {
        Harness::with_backend(self.config(), backend).expect("valid test config")
    }
}

impl Default for FakeToolbox {
    fn default() -> Self {
        Self::new()
    }
}
