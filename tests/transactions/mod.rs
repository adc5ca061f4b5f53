use std::time::Duration;

use pg_testbed::Connection;
use pg_testbed::IsolationLevel;
use pg_testbed::PollOptions;
use pg_testbed::TxState;
use pg_testbed::Value;
use serial_test::serial;

use crate::commons::count;
use crate::commons::harness;
use crate::commons::started_node;
use crate::commons::DB;

#[tokio::test]
#[serial]
async fn test_dropped_transaction_is_rolled_back() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "tx-drop", false).await;
    node.safe_psql(DB, "create table t(v int)").await.unwrap();

    {
        let mut conn = node.connect(DB).await.unwrap();
        conn.begin(IsolationLevel::Serializable).await.unwrap();
        conn.execute("insert into t values ($1)", &[Value::Int(1)]).await.unwrap();
        assert_eq!(conn.tx_state(), TxState::Active);
    }

    // the session is gone once nothing but us is connected
    node.poll_query_until(
        DB,
        "select count(*) = 1 from pg_stat_activity where datname = current_database()",
        PollOptions {
            max_attempts: 50,
            sleep: Duration::from_millis(100),
            ..PollOptions::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(count(&node, DB, "t").await, 0);

    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_commit_and_rollback() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "tx-commit", false).await;
    node.safe_psql(DB, "create table t(v int)").await.unwrap();

    let mut conn = Connection::open(&node, DB).await.unwrap();
    conn.begin_named("repeatable read").await.unwrap();
    let level = conn
        .query("select current_setting('transaction_isolation')", &[])
        .await
        .unwrap();
    assert_eq!(level.scalar(), Some(&Value::Text("repeatable read".to_string())));
    conn.execute("insert into t values (1), (2)", &[]).await.unwrap();
    conn.commit().await.unwrap();
    assert_eq!(conn.tx_state(), TxState::Committed);

    conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
    conn.execute("delete from t", &[]).await.unwrap();
    conn.rollback().await.unwrap();
    assert!(conn.commit().await.unwrap_err().is_invalid_state());
    conn.close().await.unwrap();

    assert_eq!(count(&node, DB, "t").await, 2);
    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_typed_parameters_and_results() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "types", false).await;

    let rows = node
        .execute(
            DB,
            "select $1::int8 + 1, $2::text || '!', $3::bool, null::int4, 1.50::numeric",
            &[Value::Int(41), Value::from("hi"), Value::Bool(false)],
        )
        .await
        .unwrap();

    assert_eq!(
        rows,
        vec![vec![
            Value::Int(42),
            Value::Text("hi!".to_string()),
            Value::Bool(false),
            Value::Null,
            Value::Numeric("1.50".to_string()),
        ]]
    );
    node.destroy().await;
}
