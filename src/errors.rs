//! Orchestration Error Hierarchy
//!
//! Errors are grouped by the component that raises them: resource allocation,
//! external tool invocations, lifecycle state violations and client sessions.
//! Every failure of an external process carries its captured [`ProcessOutput`]
//! so a test can be diagnosed without re-running it.

use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;

use crate::NodeState;
use crate::ProcessOutput;
use crate::TxState;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No free port or directory could be reserved
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// `initdb` (or the cached template copy) failed
    #[error("Failed to initialize node: {0}")]
    Init(ToolFailure),

    /// Server process could not be brought up
    #[error(transparent)]
    Start(#[from] StartError),

    /// Server process could not be stopped at all
    #[error(transparent)]
    Stop(#[from] StopError),

    /// Physical backup failures
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Load generator preparation failures
    #[error("Benchmark failed: {0}")]
    Benchmark(ToolFailure),

    /// Any other external utility (psql, pg_dump, pg_controldata, pg_config)
    #[error("External tool failed: {0}")]
    Tool(ToolFailure),

    /// One-shot invocation exceeded its deadline and was killed. `output`
    /// holds whatever the process wrote before that.
    #[error("{program} timed out after {elapsed:?}: {}", .output.stderr_tail(5))]
    Timeout {
        program: String,
        elapsed: Duration,
        output: ProcessOutput,
    },

    /// Liveness was never observed on the allocated port. The server log tail
    /// stands in for stderr.
    #[error("Server on port {port} not accepting connections after {attempts} attempts ({elapsed:?})")]
    StartupTimeout {
        port: u16,
        attempts: usize,
        elapsed: Duration,
        output: ProcessOutput,
    },

    /// Operation is not valid for the current lifecycle state
    #[error(transparent)]
    InvalidState(#[from] StateError),

    /// Client transport failures
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Unexpected result shape while polling a query
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Replica synchronisation failures
    #[error(transparent)]
    Catchup(#[from] CatchupError),

    /// Harness configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Infrastructure-level failures (filesystem, process spawning)
    #[error(transparent)]
    System(#[from] SystemError),
}

impl Error {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    /// Captured output of the external process behind this error, if any.
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            Error::Init(f) | Error::Benchmark(f) | Error::Tool(f) => Some(&f.output),
            Error::Start(StartError::ProcessExited { output, .. }) => Some(output),
            Error::Timeout { output, .. } | Error::StartupTimeout { output, .. } => Some(output),
            Error::Backup(BackupError::Tool(f)) => Some(&f.output),
            _ => None,
        }
    }
}

/// A finished external process that did not exit successfully.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{program} exited with {}: {}", .output.status_label(), .output.stderr_tail(5))]
pub struct ToolFailure {
    pub program: String,
    pub output: ProcessOutput,
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("No free port in range {start}..={end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("Failed to create directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The server exited before it ever accepted a connection
    #[error("Server on port {port} exited during startup with {}", .output.status_label())]
    ProcessExited { port: u16, output: ProcessOutput },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// Neither the graceful signal nor the kill could stop the process
    #[error("Unable to stop server process {pid}: {reason}")]
    Unstoppable { pid: u32, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup source {node} must be running (state: {state})")]
    SourceNotRunning { node: String, state: NodeState },

    #[error("Backup tool failed: {0}")]
    Tool(ToolFailure),

    /// The snapshot directory was already handed over to a node
    #[error("Backup is exhausted")]
    Exhausted,

    #[error("Failed to copy backup files from {from:?}: {source}")]
    Copy {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Cannot {operation} node {node} in state {state}")]
    Node {
        node: String,
        operation: &'static str,
        state: NodeState,
    },

    #[error("Cannot {operation} with transaction state {state:?}")]
    Transaction { operation: &'static str, state: TxState },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Node {node} is not running (state: {state})")]
    NodeNotRunning { node: String, state: NodeState },

    #[error("Handshake with {host}:{port} failed: {reason}")]
    Handshake { host: String, port: u16, reason: String },

    /// Server-side failure; `code` is the SQLSTATE when the server sent one
    #[error("Query failed{}: {message}", sqlstate_suffix(.code))]
    Query { code: Option<String>, message: String },

    #[error("Unknown isolation level: {0}")]
    InvalidIsolationLevel(String),

    #[error("Connection is closed")]
    Closed,
}

fn sqlstate_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl ConnectionError {
    /// SQLSTATE class 42: syntax error or access rule violation.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, ConnectionError::Query { code: Some(code), .. } if code.starts_with("42"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query returned no result set: {0}")]
    NoResultSet(String),

    #[error("Query returned no rows: {0}")]
    NoRows(String),

    #[error("Query returned no columns: {0}")]
    NoColumns(String),

    #[error("Query {query} did not return {expected} after {attempts} attempts")]
    PollExhausted {
        query: String,
        expected: String,
        attempts: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("Node {0} has no upstream to catch up with")]
    NoUpstream(String),

    #[error("Failed to read WAL position from {node}: {reason}")]
    Position { node: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("I/O error at {path:?}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Signal {signal} to pid {pid} failed: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Unexpected tool output: {0}")]
    UnexpectedOutput(String),
}

// ============== Conversion Implementations ============== //
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(SystemError::Io(e))
    }
}

impl From<tokio_postgres::Error> for ConnectionError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => ConnectionError::Query {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
            },
            None if e.is_closed() => ConnectionError::Closed,
            None => ConnectionError::Query {
                code: None,
                message: e.to_string(),
            },
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Error::Connection(e.into())
    }
}

pub(crate) fn path_error(
    path: impl Into<PathBuf>,
    source: std::io::Error,
) -> Error {
    Error::System(SystemError::Path {
        path: path.into(),
        source,
    })
}
