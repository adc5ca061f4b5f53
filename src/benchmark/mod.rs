//! `pgbench` against a running node: one-shot schema preparation and
//! non-blocking benchmark runs.

#[cfg(test)]
mod benchmark_test;

use std::ffi::OsString;
use std::process::Stdio;

use tokio::process::Child;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::file_io::append_into_file;
use crate::run_checked;
use crate::ClientBackend;
use crate::Error;
use crate::Node;
use crate::Operation;
use crate::ProcessOutput;
use crate::Result;
use crate::StateError;
use crate::SystemError;
use crate::Tool;
use crate::ToolCommand;

/// Extra `pgbench` arguments, passed through untouched.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkOptions {
    args: Vec<OsString>,
}

impl BenchmarkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(
        mut self,
        arg: impl Into<OsString>,
    ) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(
        mut self,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `-c`
    pub fn clients(
        self,
        clients: u32,
    ) -> Self {
        self.arg("-c").arg(clients.to_string())
    }

    /// `-j`
    pub fn threads(
        self,
        threads: u32,
    ) -> Self {
        self.arg("-j").arg(threads.to_string())
    }

    /// `-t`
    pub fn transactions(
        self,
        transactions: u64,
    ) -> Self {
        self.arg("-t").arg(transactions.to_string())
    }

    /// `-T`
    pub fn duration_secs(
        self,
        seconds: u64,
    ) -> Self {
        self.arg("-T").arg(seconds.to_string())
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkRunner {
    dbname: String,
}

impl Default for BenchmarkRunner {
    fn default() -> Self {
        Self::new("postgres")
    }
}

impl BenchmarkRunner {
    pub fn new(dbname: impl Into<String>) -> Self {
        Self { dbname: dbname.into() }
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// `pgbench -i -s <scale>`; a non-zero exit is [`Error::Benchmark`].
    pub async fn prepare<B: ClientBackend>(
        &self,
        node: &Node<B>,
        scale: u32,
    ) -> Result<ProcessOutput> {
        check_running(node)?;
        let cmd = self.command(node, vec!["-i".into(), "-s".into(), scale.to_string().into()]).await;
        let output = run_checked(&cmd, node.harness().config().timeouts.tool(), Error::Benchmark).await?;
        info!("[{}] pgbench tables prepared at scale {}", node.name(), scale);
        Ok(output)
    }

    /// Spawns `pgbench` without waiting for it.
    pub async fn run<B: ClientBackend>(
        &self,
        node: &Node<B>,
        options: BenchmarkOptions,
    ) -> Result<BenchmarkProcess> {
        check_running(node)?;
        let cmd = self.command(node, options.args).await;

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| SystemError::Spawn {
            program: cmd.program_name(),
            source,
        })?;

        let pid = child.id().unwrap_or_default();
        info!("[{}] pgbench running with pid {}", node.name(), pid);
        Ok(BenchmarkProcess {
            child,
            pid,
            node_name: node.name().to_string(),
            port: node.port(),
            cmd,
        })
    }

    async fn command<B: ClientBackend>(
        &self,
        node: &Node<B>,
        args: Vec<OsString>,
    ) -> ToolCommand {
        node.harness()
            .tools()
            .command(Tool::Pgbench)
            .await
            .args(args)
            .arg("-p")
            .arg(node.port().to_string())
            .arg("-h")
            .arg(node.host())
            .arg("-U")
            .arg(node.harness().username())
            .arg(&self.dbname)
            .log_to(node.tools_log())
    }
}

fn check_running<B: ClientBackend>(node: &Node<B>) -> Result<()> {
    match node.state().next(Operation::Query) {
        Some(_) => Ok(()),
        None => Err(StateError::Node {
            node: node.name().to_string(),
            operation: "benchmark",
            state: node.state(),
        }
        .into()),
    }
}

/// Handle to a running `pgbench`. Killed when dropped before `wait`.
#[derive(Debug)]
pub struct BenchmarkProcess {
    child: Child,
    pid: u32,
    node_name: String,
    port: u16,
    cmd: ToolCommand,
}

impl BenchmarkProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for exit; a non-zero status is returned, not raised.
    pub async fn wait(self) -> Result<ProcessOutput> {
        let output: ProcessOutput = self.child.wait_with_output().await?.into();
        debug!("[{}] pgbench finished with {}", self.node_name, output.status_label());

        if let Some(log) = self.cmd.log_file() {
            let entry = format!(
                "$ {}\n# {}\n{}{}\n",
                self.cmd,
                output.status_label(),
                output.stdout,
                output.stderr
            );
            if let Err(e) = append_into_file(log, entry.as_bytes()).await {
                warn!("[{}] failed to write tool log {:?}: {:?}", self.node_name, log, e);
            }
        }
        Ok(output)
    }
}
