use std::time::Duration;

use pg_testbed::net::is_port_free;
use pg_testbed::net::is_server_ready;
use pg_testbed::BenchmarkOptions;
use pg_testbed::BenchmarkRunner;
use pg_testbed::NodeState;
use pg_testbed::PollOptions;
use pg_testbed::Value;
use serial_test::serial;

use crate::commons::count;
use crate::commons::harness;
use crate::commons::started_node;
use crate::commons::DB;
use crate::enable_logger;

#[tokio::test]
#[serial]
async fn test_select_one_then_stop() {
    enable_logger();
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = harness.node().build().unwrap();

    node.initialize().await.unwrap();
    node.start().await.unwrap();
    assert!(is_server_ready(node.host(), node.port()).await);

    let rows = node.execute(DB, "select 1", &[]).await.unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1)]]);

    node.stop().await.unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    assert!(is_port_free(node.host(), node.port()));

    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_second_start_is_rejected() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "twice", false).await;
    let pid = node.pid();

    assert!(node.start().await.unwrap_err().is_invalid_state());
    assert_eq!(node.pid(), pid);
    assert_eq!(node.state(), NodeState::Running);

    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_destroy_leaves_nothing_behind() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "doomed", false).await;
    let base = node.base_dir().to_path_buf();

    node.destroy().await;
    node.destroy().await;

    assert!(!base.exists());
    assert!(harness.allocator().reserved_ports().is_empty());
}

#[tokio::test]
#[serial]
async fn test_restart_and_reload_settings() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "settings", false).await;

    node.set_setting("work_mem", "12MB").unwrap();
    node.reload().await.unwrap();
    node.poll_query_until(
        DB,
        "select current_setting('work_mem') = '12MB'",
        PollOptions {
            max_attempts: 50,
            sleep: Duration::from_millis(100),
            ..PollOptions::default()
        },
    )
    .await
    .unwrap();

    node.set_setting("max_connections", "42").unwrap();
    node.restart().await.unwrap();
    let out = node.safe_psql(DB, "show max_connections").await.unwrap();
    assert_eq!(out.trim(), "42");

    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_dump_restore_round_trip() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "dumper", false).await;
    node.safe_psql(DB, "create table items(id int); insert into items select generate_series(1, 25)")
        .await
        .unwrap();

    let dump = node.dump(DB).await.unwrap();
    node.safe_psql(DB, "create database copy").await.unwrap();
    node.restore("copy", dump.path()).await.unwrap();

    assert_eq!(count(&node, "copy", "items").await, 25);
    let failed = node.psql(DB, "select * from missing_table").await.unwrap();
    assert!(!failed.success());
    assert!(failed.stderr.contains("missing_table"));

    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_control_data_of_stopped_node() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "control", false).await;
    node.stop().await.unwrap();

    let data = node.control_data().await.unwrap();

    assert_eq!(data.get("Database cluster state").map(String::as_str), Some("shut down"));
    node.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_pgbench_prepare_and_run() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut node = started_node(&harness, "bench", false).await;
    let runner = BenchmarkRunner::default();

    runner.prepare(&node, 1).await.unwrap();
    let output = runner
        .run(&node, BenchmarkOptions::new().clients(2).transactions(20))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(output.success(), "{}", output.stderr);
    assert!(output.stdout.contains("tps"));
    assert_eq!(count(&node, DB, "pgbench_branches").await, 1);
    node.destroy().await;
}
