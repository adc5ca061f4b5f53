use serial_test::serial;

use super::*;
use crate::test_utils::*;
use crate::MockClientBackend;
use crate::Node;

async fn running_node(toolbox: &FakeToolbox) -> Node<MockClientBackend> {
    let mut node = toolbox.harness(live_backend()).node().build().unwrap();
    node.initialize().await.unwrap();
    node.start().await.unwrap();
    node
}

#[test]
fn test_options_builder() {
    let options = BenchmarkOptions::new().clients(4).threads(2).transactions(100).arg("-n");

    let args: Vec<_> = options.get_args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
    assert_eq!(args, ["-c", "4", "-j", "2", "-t", "100", "-n"]);
}

#[tokio::test]
#[serial]
async fn test_prepare_initializes_tables() {
    enable_logger();
    let toolbox = FakeToolbox::new();
    let node = running_node(&toolbox).await;

    let output = BenchmarkRunner::default().prepare(&node, 2).await.unwrap();

    assert!(output.success());
    let call = toolbox.calls(Tool::Pgbench).pop().unwrap();
    assert_eq!(call, format!("-i -s 2 -p {} -h 127.0.0.1 -U tester postgres", node.port()));
}

#[tokio::test]
#[serial]
async fn test_prepare_failure_is_benchmark_error() {
    let toolbox = FakeToolbox::new();
    let node = running_node(&toolbox).await;
    toolbox.install(Tool::Pgbench, PGBENCH_FAILING);

    let err = BenchmarkRunner::new("bench").prepare(&node, 1).await.unwrap_err();

    assert!(matches!(err, Error::Benchmark(_)), "{:?}", err);
    assert!(err.output().unwrap().stderr.contains("could not connect"));
}

#[tokio::test]
#[serial]
async fn test_run_and_wait() {
    let toolbox = FakeToolbox::new();
    let node = running_node(&toolbox).await;

    let process = BenchmarkRunner::new("bench")
        .run(&node, BenchmarkOptions::new().transactions(10))
        .await
        .unwrap();
    assert!(process.pid() > 0);
    assert_eq!(process.port(), node.port());
    assert_eq!(process.node_name(), node.name());

    let output = process.wait().await.unwrap();

    assert!(output.success());
    assert!(output.stdout.contains("tps = 512"));
    let log = std::fs::read_to_string(node.tools_log()).unwrap();
    assert!(log.contains("pgbench -t 10"));
}

#[tokio::test]
#[serial]
async fn test_run_failure_is_returned_verbatim() {
    let toolbox = FakeToolbox::new();
    let node = running_node(&toolbox).await;

    let output = BenchmarkRunner::default()
        .run(&node, BenchmarkOptions::new().arg("--fail"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(output.exit_code, Some(2));
    assert!(output.stderr.contains("connection to server failed"));
}

#[tokio::test]
#[serial]
async fn test_benchmark_requires_running_node() {
    let toolbox = FakeToolbox::new();
    let mut node = toolbox.harness(live_backend()).node().build().unwrap();
    node.initialize().await.unwrap();

    let runner = BenchmarkRunner::default();
    assert!(runner.prepare(&node, 1).await.unwrap_err().is_invalid_state());
    assert!(runner.run(&node, BenchmarkOptions::new()).await.unwrap_err().is_invalid_state());
    assert!(toolbox.calls(Tool::Pgbench).is_empty());
}

#[tokio::test]
#[serial]
async fn test_unwritable_tool_log_keeps_output() {
    let toolbox = FakeToolbox::new();
    let node = running_node(&toolbox).await;
    std::fs::remove_file(node.tools_log()).unwrap();
    std::fs::create_dir(node.tools_log()).unwrap();

    let output = BenchmarkRunner::default()
        .run(&node, BenchmarkOptions::new().transactions(10))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(output.success());
    assert!(output.stdout.contains("tps = 512"));
}
