use std::time::Duration;

use pg_testbed::BackupOptions;
use pg_testbed::NodeState;
use pg_testbed::PollOptions;
use pg_testbed::ReplicaOptions;
use pg_testbed::WalMethod;
use serial_test::serial;

use crate::commons::count;
use crate::commons::harness;
use crate::commons::started_node;
use crate::commons::DB;

#[tokio::test]
#[serial]
async fn test_streaming_replica_catches_up() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut primary = started_node(&harness, "primary", true).await;
    primary
        .safe_psql(DB, "create table t(v int); insert into t select generate_series(1, 10)")
        .await
        .unwrap();

    let mut replica = primary.replicate("replica").await.unwrap();
    assert_eq!(replica.state(), NodeState::Initialized);
    assert_eq!(replica.upstream().map(|u| u.port), Some(primary.port()));
    replica.start().await.unwrap();

    primary.safe_psql(DB, "insert into t values (11)").await.unwrap();
    replica.catchup().await.unwrap();
    assert_eq!(count(&replica, DB, "t").await, 11);

    primary
        .poll_query_until(
            DB,
            "select count(*) = 1 from pg_stat_replication where application_name = 'replica'",
            PollOptions {
                max_attempts: 50,
                sleep: Duration::from_millis(100),
                ..PollOptions::default()
            },
        )
        .await
        .unwrap();

    replica.destroy().await;
    primary.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_backup_spawns_independent_primaries() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut source = started_node(&harness, "source", true).await;
    source
        .safe_psql(DB, "create table t(v int); insert into t values (1), (2), (3)")
        .await
        .unwrap();

    let mut backup = source
        .backup(BackupOptions {
            wal_method: WalMethod::Stream,
            ..BackupOptions::default()
        })
        .await
        .unwrap();
    let mut copy = backup.spawn_primary("copy", false).await.unwrap();
    let mut moved = backup.spawn_primary("moved", true).await.unwrap();
    assert!(!backup.is_available());

    copy.start().await.unwrap();
    moved.start().await.unwrap();
    copy.safe_psql(DB, "insert into t values (4)").await.unwrap();

    assert_eq!(count(&copy, DB, "t").await, 4);
    assert_eq!(count(&moved, DB, "t").await, 3);
    assert_eq!(count(&source, DB, "t").await, 3);

    copy.destroy().await;
    moved.destroy().await;
    source.destroy().await;
}

#[tokio::test]
#[serial]
async fn test_replica_from_reusable_backup_auto_starts() {
    let Some(harness) = harness().await else {
        return;
    };
    let mut primary = started_node(&harness, "primary", true).await;
    let mut backup = primary.backup(BackupOptions::default()).await.unwrap();

    let mut replica = backup
        .spawn_replica(
            "standby",
            ReplicaOptions {
                destroy: false,
                auto_start: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(replica.state(), NodeState::Running);
    assert!(backup.is_available());
    let in_recovery = replica.safe_psql(DB, "select pg_is_in_recovery()").await.unwrap();
    assert_eq!(in_recovery.trim(), "t");

    backup.cleanup();
    replica.destroy().await;
    primary.destroy().await;
}
