use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ProcessOutput;
use super::ToolCommand;
use crate::file_io::append_into_file;
use crate::file_io::file_tail;
use crate::file_io::open_file_for_append;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::ShutdownMode;
use crate::StartError;
use crate::StopError;
use crate::SystemError;
use crate::ToolFailure;

/// Lines of the server log attached to startup failures.
const LOG_TAIL_LINES: usize = 20;

/// How long captured pipes may stay open after the tool itself is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs a one-shot tool to completion and captures its output.
///
/// A non-zero exit is not an error here; see [`run_checked`]. When `limit`
/// elapses the child is killed and [`Error::Timeout`] is returned with the
/// output collected up to that point.
pub async fn run(
    cmd: &ToolCommand,
    limit: Duration,
) -> Result<ProcessOutput> {
    debug!("run: {}", cmd);
    let started = Instant::now();

    let mut command = cmd.to_command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| SystemError::Spawn {
        program: cmd.program_name(),
        source,
    })?;
    let stdout = StreamCollector::spawn(child.stdout.take());
    let stderr = StreamCollector::spawn(child.stderr.take());

    let timed_out = match timeout(limit, child.wait()).await {
        Ok(status) => {
            status?;
            false
        }
        Err(_) => {
            warn!("{} killed after {:?}", cmd.program_name(), limit);
            if let Err(e) = child.kill().await {
                warn!("failed to kill {}: {}", cmd.program_name(), e);
            }
            true
        }
    };

    let stdout = stdout.finish().await;
    let stderr = stderr.finish().await;
    let output = match child.try_wait()? {
        Some(status) => ProcessOutput::from_status(status, stdout, stderr),
        None => ProcessOutput {
            stdout,
            stderr,
            ..ProcessOutput::default()
        },
    };

    debug!(
        "{} finished with {} in {:?}",
        cmd.program_name(),
        output.status_label(),
        started.elapsed()
    );

    if let Some(log) = cmd.log_file() {
        let entry = format!(
            "$ {}\n# {}{}\n{}{}\n",
            cmd,
            output.status_label(),
            if timed_out { " (timed out)" } else { "" },
            output.stdout,
            output.stderr
        );
        if let Err(e) = append_into_file(log, entry.as_bytes()).await {
            warn!("failed to write tool log {:?}: {:?}", log, e);
        }
    }

    if timed_out {
        return Err(Error::Timeout {
            program: cmd.program_name(),
            elapsed: started.elapsed(),
            output,
        });
    }
    Ok(output)
}

/// Reads a child pipe in the background so a killed process still reports
/// what it wrote.
struct StreamCollector {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl StreamCollector {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let reader = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, reader }
    }

    /// Waits briefly for EOF; a grandchild may keep the pipe open.
    async fn finish(mut self) -> String {
        if timeout(DRAIN_GRACE, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
        let bytes = self.buf.lock();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// [`run`], mapping a non-zero exit to the caller's error kind.
pub async fn run_checked<F>(
    cmd: &ToolCommand,
    limit: Duration,
    on_failure: F,
) -> Result<ProcessOutput>
where
    F: FnOnce(ToolFailure) -> Error,
{
    let output = run(cmd, limit).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(on_failure(ToolFailure {
            program: cmd.program_name(),
            output,
        }))
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process honoured the shutdown signal within the timeout
    Graceful { exit_code: Option<i32> },
    /// Timeout elapsed and SIGKILL was used
    Forced,
    /// Process had already exited before the stop request
    AlreadyExited { exit_code: Option<i32> },
}

/// Long-running server process spawned by [`ServerProcess::spawn`].
///
/// Not killed on drop: the postmaster needs its own shutdown signal to take
/// its backends down. See [`ServerProcess::abandon`].
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: u32,
    log_file: PathBuf,
    started_at: Instant,
}

impl ServerProcess {
    /// Spawns without waiting; stdout and stderr are appended to `log_file`.
    pub fn spawn(
        cmd: &ToolCommand,
        log_file: &Path,
    ) -> Result<Self> {
        debug!("spawn: {}", cmd);
        let stdout = open_file_for_append(log_file.to_path_buf())?;
        let stderr = stdout.try_clone()?;

        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = command.spawn().map_err(|source| StartError::Spawn {
            program: cmd.program_name(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!("{} started with pid {}", cmd.program_name(), pid);

        Ok(Self {
            child,
            pid,
            log_file: log_file.to_path_buf(),
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Returns the exit details when the process is gone, the log tail
    /// standing in for stderr.
    pub fn try_exit(&mut self) -> Result<Option<ProcessOutput>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(ProcessOutput::from_status(status, String::new(), self.log_tail()))),
            None => Ok(None),
        }
    }

    /// Server log tail as the output of a process that has not exited.
    pub fn running_output(&self) -> ProcessOutput {
        ProcessOutput {
            stderr: self.log_tail(),
            ..ProcessOutput::default()
        }
    }

    fn log_tail(&self) -> String {
        file_tail(&self.log_file, LOG_TAIL_LINES)
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }

    pub fn signal(
        &self,
        signal: Signal,
    ) -> Result<()> {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(()),
            // already gone, nothing to deliver
            Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SystemError::Signal {
                pid: self.pid,
                signal: signal.as_str(),
                source,
            }
            .into()),
        }
    }

    /// Asks the server to re-read its configuration files.
    pub fn reload(&self) -> Result<()> {
        self.signal(Signal::SIGHUP)
    }

    /// Graceful signal first, SIGKILL once `grace` elapses.
    pub async fn stop(
        &mut self,
        mode: ShutdownMode,
        grace: Duration,
    ) -> Result<StopOutcome> {
        if let Some(status) = self.child.try_wait()? {
            info!("pid {} had already exited with {:?}", self.pid, status);
            return Ok(StopOutcome::AlreadyExited {
                exit_code: status.code(),
            });
        }

        if let Err(e) = self.signal(mode.signal()) {
            warn!("graceful stop of pid {} failed: {}", self.pid, e);
        } else {
            match timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!("pid {} stopped ({:?} shutdown)", self.pid, mode);
                    return Ok(StopOutcome::Graceful {
                        exit_code: status.code(),
                    });
                }
                Ok(Err(e)) => warn!("waiting for pid {} failed: {}", self.pid, e),
                Err(_) => warn!(
                    "pid {} ignored {:?} shutdown for {:?}, escalating to SIGKILL",
                    self.pid, mode, grace
                ),
            }
        }

        self.child.kill().await.map_err(|e| StopError::Unstoppable {
            pid: self.pid,
            reason: e.to_string(),
        })?;
        Ok(StopOutcome::Forced)
    }

    /// Last-resort cleanup when the owner goes away without stopping:
    /// immediate shutdown, no wait. The runtime reaps the exit status.
    pub fn abandon(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.signal(Signal::SIGQUIT) {
                warn!("failed to signal abandoned pid {}: {}", self.pid, e);
            }
        }
    }
}

/// Polls `probe` until it succeeds, the process exits, the retry budget is
/// spent or `deadline` elapses. Returns the number of attempts made.
pub async fn wait_for_liveness<F, Fut>(
    process: &mut ServerProcess,
    port: u16,
    policy: &BackoffPolicy,
    deadline: Duration,
    mut probe: F,
) -> Result<usize>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let mut delays = policy.delays();
    let mut attempts = 0;

    loop {
        if let Some(output) = process.try_exit()? {
            return Err(StartError::ProcessExited { port, output }.into());
        }

        attempts += 1;
        match timeout(policy.timeout(), probe()).await {
            Ok(Ok(())) => {
                debug!("port {} live after {} attempts ({:?})", port, attempts, started.elapsed());
                return Ok(attempts);
            }
            Ok(Err(e)) => debug!("liveness attempt {} on port {}: {}", attempts, port, e),
            Err(_) => debug!("liveness attempt {} on port {} timed out", attempts, port),
        }

        let Some(delay) = delays.next() else {
            break;
        };
        if started.elapsed() + delay > deadline {
            break;
        }
        sleep(delay).await;
    }

    if let Some(output) = process.try_exit()? {
        return Err(StartError::ProcessExited { port, output }.into());
    }

    warn!("port {} never became live after {} attempts", port, attempts);
    Err(Error::StartupTimeout {
        port,
        attempts,
        elapsed: started.elapsed(),
        output: process.running_output(),
    })
}
