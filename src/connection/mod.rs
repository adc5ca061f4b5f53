//! Client sessions with explicit transaction state.
//!
//! A [`Connection`] runs statements in autocommit mode until [`Connection::begin`]
//! opens a transaction. Dropping a connection with a transaction still open
//! rolls it back before the transport is closed.


use std::fmt;
use std::str::FromStr;

use tracing::debug;
use tracing::warn;

use crate::ClientBackend;
use crate::ConnectionError;
use crate::Node;
use crate::PgSession;
use crate::QueryResult;
use crate::Result;
use crate::Row;
use crate::Session;
use crate::StateError;
use crate::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Autocommit; no transaction was opened yet
    None,
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = ConnectionError;

    /// Case-insensitive; spaces, `_` and `-` separate words
    /// (`"Read Committed"`, `"repeatable_read"`, `"SERIALIZABLE"`).
    fn from_str(s: &str) -> std::result::Result<Self, ConnectionError> {
        let normalized: Vec<String> = s
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        match normalized.join(" ").as_str() {
            "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(ConnectionError::InvalidIsolationLevel(s.to_string())),
        }
    }
}

/// A session bound to one node and database.
pub struct Connection<S: Session = PgSession> {
    session: Option<S>,
    node_name: String,
    dbname: String,
    tx_state: TxState,
    isolation: Option<IsolationLevel>,
}

impl<S: Session> Connection<S> {
    /// Fails with [`ConnectionError::NodeNotRunning`] unless `node` is running.
    pub async fn open<B>(
        node: &Node<B>,
        dbname: &str,
    ) -> Result<Self>
    where
        B: ClientBackend<Session = S>,
    {
        node.connect(dbname).await
    }

    pub(crate) fn new(
        session: S,
        node_name: &str,
        dbname: &str,
    ) -> Self {
        Self {
            session: Some(session),
            node_name: node_name.to_string(),
            dbname: dbname.to_string(),
            tx_state: TxState::None,
            isolation: None,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    /// Isolation level of the active transaction.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        match self.tx_state {
            TxState::Active => self.isolation,
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.as_ref().map(|s| s.is_closed()).unwrap_or(true)
    }

    fn session(&mut self) -> Result<&mut S> {
        self.session.as_mut().ok_or_else(|| ConnectionError::Closed.into())
    }

    pub async fn begin(
        &mut self,
        level: IsolationLevel,
    ) -> Result<()> {
        if self.tx_state == TxState::Active {
            return Err(StateError::Transaction {
                operation: "begin",
                state: self.tx_state,
            }
            .into());
        }

        let sql = format!("BEGIN ISOLATION LEVEL {}", level.as_sql());
        self.session()?.batch_execute(&sql).await?;
        debug!("[{}] transaction started ({})", self.node_name, level);

        self.tx_state = TxState::Active;
        self.isolation = Some(level);
        Ok(())
    }

    /// [`Connection::begin`] with a level given by name.
    pub async fn begin_named(
        &mut self,
        level: &str,
    ) -> Result<()> {
        let level: IsolationLevel = level.parse()?;
        self.begin(level).await
    }

    /// Runs one statement; inside a transaction when one is active,
    /// autocommit otherwise.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        Ok(self.query(sql, params).await?.rows)
    }

    /// [`Connection::execute`] keeping column names.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult> {
        self.session()?.query(sql, params).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT", TxState::Committed).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK", TxState::RolledBack).await
    }

    async fn finish(
        &mut self,
        statement: &'static str,
        next: TxState,
    ) -> Result<()> {
        if self.tx_state != TxState::Active {
            return Err(StateError::Transaction {
                operation: if next == TxState::Committed { "commit" } else { "rollback" },
                state: self.tx_state,
            }
            .into());
        }

        self.session()?.batch_execute(statement).await?;
        self.tx_state = next;
        self.isolation = None;
        Ok(())
    }

    /// Rolls back an active transaction, then closes the transport.
    /// A failed rollback is returned after the transport is closed.
    pub async fn close(mut self) -> Result<()> {
        let rollback = if self.tx_state == TxState::Active {
            self.rollback().await
        } else {
            Ok(())
        };
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        rollback
    }
}

impl<S: Session> Drop for Connection<S> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if self.tx_state != TxState::Active {
            session.close();
            return;
        }

        self.tx_state = TxState::RolledBack;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let node = self.node_name.clone();
                handle.spawn(async move {
                    if let Err(e) = session.batch_execute("ROLLBACK").await {
                        warn!("[{}] rollback on drop failed: {}", node, e);
                    }
                    session.close();
                });
            }
            Err(_) => {
                // the server aborts the transaction when the session ends
                debug!("[{}] no runtime for rollback on drop, closing", self.node_name);
                session.close();
            }
        }
    }
}

impl<S: Session> fmt::Debug for Connection<S> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node_name)
            .field("dbname", &self.dbname)
            .field("tx_state", &self.tx_state)
            .field("isolation", &self.isolation)
            .finish()
    }
}
