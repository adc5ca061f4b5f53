use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::ConnectionError;
use crate::MockClientBackend;
use crate::MockSession;
use crate::QueryResult;
use crate::Result;
use crate::Value;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

/// Session that only expects to be closed.
pub fn idle_session() -> MockSession {
    let mut session = MockSession::new();
    session.expect_close().return_const(());
    session.expect_is_closed().return_const(false);
    session
}

/// Every handshake succeeds.
pub fn live_backend() -> MockClientBackend {
    let mut backend = MockClientBackend::new();
    backend.expect_connect().returning(|_| Ok(idle_session()));
    backend
}

/// Every handshake is refused.
pub fn refusing_backend() -> MockClientBackend {
    let mut backend = MockClientBackend::new();
    backend.expect_connect().returning(|target| {
        Err(ConnectionError::Handshake {
            host: target.host.clone(),
            port: target.port,
            reason: "Connection refused".to_string(),
        }
        .into())
    });
    backend
}

/// Handshakes succeed; the n-th query (0-based, across sessions) gets
/// `answer(n)`.
pub fn scripted_backend<F>(answer: F) -> (MockClientBackend, Arc<AtomicUsize>)
where
    F: Fn(usize) -> Result<QueryResult> + Send + Sync + 'static,
{
    let answer = Arc::new(answer);
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();

    let mut backend = MockClientBackend::new();
    backend.expect_connect().returning(move |_| {
        let answer = answer.clone();
        let counter = counter.clone();
        let mut session = idle_session();
        session.expect_query().returning(move |_, _| answer(counter.fetch_add(1, Ordering::SeqCst)));
        Ok(session)
    });
    (backend, queries)
}

/// One-column, one-row result.
pub fn scalar(value: Value) -> QueryResult {
    QueryResult {
        columns: vec!["?column?".to_string()],
        rows: vec![vec![value]],
    }
}
