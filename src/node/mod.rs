//! Server instances and their lifecycle.
//!
//! A [`Node`] owns a [`crate::Lease`] (port and private directory) and drives
//! its server through `initialize -> start -> stop -> destroy` with external
//! tools. Every operation is checked against the transition table in
//! [`NodeState::next`] before anything is spawned.

mod builder;
mod node;
mod state;
pub use builder::*;
pub use node::*;
pub use state::*;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::Value;

/// Per-node settings, persisted into the data directory on initialize.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Server settings layered over the harness defaults
    pub overrides: BTreeMap<String, String>,
    /// WAL senders and `replication` auth rules for physical backups/replicas
    pub allow_streaming: bool,
    /// Listen on a unix-domain socket in the system temp dir as well
    pub unix_sockets: bool,
    /// Extra `initdb` arguments; disables the cached initdb template
    pub initdb_params: Vec<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            allow_streaming: false,
            unix_sockets: true,
            initdb_params: Vec::new(),
        }
    }
}

/// Controls [`Node::poll_query_until`].
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// First cell of the first row to wait for; `None` waits for a statement
    /// without a result set
    pub expected: Option<Value>,
    /// 0 polls until a result matches or an error occurs
    pub max_attempts: usize,
    pub sleep: Duration,
    /// Surface SQLSTATE class 42 errors instead of polling through them
    pub raise_programming_error: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            expected: Some(Value::Bool(true)),
            max_attempts: 0,
            sleep: Duration::from_secs(1),
            raise_programming_error: true,
        }
    }
}
