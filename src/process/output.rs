use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::process::Output;

/// Exit status and captured streams of a finished external process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn from_status(
        status: ExitStatus,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            exit_code: status.code(),
            signal: status.signal(),
            stdout,
            stderr,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_label(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(sig)) => format!("signal {sig}"),
            (None, None) => "unknown status".to_string(),
        }
    }

    /// Last `n` non-empty stderr lines joined on one line.
    pub fn stderr_tail(
        &self,
        n: usize,
    ) -> String {
        let lines: Vec<&str> = self.stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join(" | ")
    }
}

impl From<Output> for ProcessOutput {
    fn from(output: Output) -> Self {
        Self::from_status(
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )
    }
}
