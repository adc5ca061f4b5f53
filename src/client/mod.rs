//! Client capability used to talk to a running server.
//!
//! [`ClientBackend`] opens [`Session`]s; everything above (liveness probes,
//! [`crate::Connection`], node queries) is generic over it. The production
//! implementation is [`PgBackend`], backed by `tokio-postgres`.

mod postgres;
mod value;
pub use postgres::*;
pub use value::*;
#[cfg(test)]
mod value_test;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub application_name: Option<String>,
    pub connect_timeout: Duration,
}

/// Column names plus decoded rows of one statement.
///
/// Statements without a result set (DDL, DML without `RETURNING`) have
/// neither columns nor rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn has_result_set(&self) -> bool {
        !self.columns.is_empty() || !self.rows.is_empty()
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }
}

#[cfg_attr(test, automock(type Session = MockSession;))]
#[async_trait]
pub trait ClientBackend: Send + Sync + 'static {
    type Session: Session;

    /// Performs the client handshake. Failures map to
    /// [`crate::ConnectionError::Handshake`].
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Self::Session>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + 'static {
    /// Runs one statement with bound parameters.
    async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult>;

    /// Runs one or more statements without parameters or results.
    async fn batch_execute(
        &mut self,
        sql: &str,
    ) -> Result<()>;

    /// Ends the session. Further calls fail with [`crate::ConnectionError::Closed`].
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
