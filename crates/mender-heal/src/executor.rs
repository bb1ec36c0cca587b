//! Shell command execution for builds, tests, and git operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use mender_types::{MenderError, Result};

/// Captured outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// stdout followed by stderr, the form diagnostics are parsed from.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Convert a non-zero exit into [`MenderError::CommandFailed`].
    pub fn into_checked(self, command: &str) -> Result<Self> {
        if self.timed_out {
            return Err(MenderError::CommandTimeout {
                timeout_ms: self.duration_ms,
            });
        }
        if self.exit_code != 0 {
            return Err(MenderError::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            });
        }
        Ok(self)
    }
}

/// Runs shell commands inside a workspace.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command`; `None` uses the executor's default timeout.
    ///
    /// A non-zero exit is reported in the result, not as an error. Errors mean
    /// the command could not be started at all.
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecResult>;

    fn working_dir(&self) -> &Path;
}

/// [`CommandExecutor`] running `bash -c` on the local machine.
pub struct LocalExecutor {
    working_dir: PathBuf,
    default_timeout: Duration,
    env: HashMap<String, String>,
}

impl LocalExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            default_timeout: Duration::from_secs(600),
            env: HashMap::new(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Extra environment variables for every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How long pipes are still read after the command exits. A background
/// process that inherited them (a build daemon, say) may never close them.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A pipe being read into a shared buffer, so a cut-off read keeps what arrived.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Drain {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    /// Wait up to `grace` for end of stream, then return what was read.
    async fn finish(self, grace: Duration) -> String {
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::debug!("Pipe still open after exit, keeping partial output");
            task.abort();
        }
        let buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let text = String::from_utf8_lossy(&buf).into_owned();
        text
    }

    fn abort(&self) {
        self.task.abort();
    }
}

async fn collect(drain: Option<Drain>) -> String {
    match drain {
        Some(drain) => drain.finish(DRAIN_GRACE).await,
        None => String::new(),
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecResult> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        tracing::debug!(command, timeout_ms = %timeout.as_millis(), "exec");

        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // own process group so a timeout can take the whole tree down
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn()?;

        // Drain both pipes while waiting so a chatty build cannot fill them and block.
        let stdout = child.stdout.take().map(Drain::spawn);
        let stderr = child.stderr.take().map(Drain::spawn);

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
                Ok(ExecResult {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                    timed_out: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        unsafe { libc::kill(-(pid as i32), libc::SIGTERM); }
                    }
                    tokio::select! {
                        _ = child.wait() => {}
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {
                            let _ = child.kill().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
                for drain in [stdout, stderr].iter().flatten() {
                    drain.abort();
                }

                tracing::warn!(command, timeout_ms = %timeout.as_millis(), "Command timed out");
                Ok(ExecResult {
                    stdout: String::new(),
                    stderr: format!("Command timed out after {}ms", timeout.as_millis()),
                    exit_code: -1,
                    timed_out: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

/// Quote `s` for safe interpolation into a `bash -c` command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn exec_echo() {
        let dir = TempDir::new().unwrap();
        let exec = LocalExecutor::new(dir.path());

        let result = exec.exec("echo hello && echo oops >&2", None).await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.success());
        assert_eq!(result.combined_output(), "hello\n\noops\n");
    }

    #[tokio::test]
    async fn exec_runs_in_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let exec = LocalExecutor::new(dir.path()).with_env("MENDER_GREETING", "hi");

        let result = exec.exec("ls && echo $MENDER_GREETING", None).await.unwrap();
        assert!(result.stdout.contains("marker.txt"));
        assert!(result.stdout.contains("hi"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let exec = LocalExecutor::new(dir.path());

        let result = exec.exec("echo bad >&2; exit 3", None).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());

        let err = result.into_checked("make").unwrap_err();
        assert_eq!(err.to_string(), "Command `make` exited with 3: bad");
    }

    #[tokio::test]
    async fn exec_timeout() {
        let dir = TempDir::new().unwrap();
        let exec = LocalExecutor::new(dir.path());

        let result = exec
            .exec("sleep 60", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(result.duration_ms >= 100);
        assert!(matches!(
            result.into_checked("sleep 60"),
            Err(MenderError::CommandTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn background_process_holding_pipes_does_not_block() {
        let dir = TempDir::new().unwrap();
        let exec = LocalExecutor::new(dir.path());
        let start = std::time::Instant::now();

        let result = exec
            .exec("sleep 8 & echo started", Some(Duration::from_secs(30)))
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "started");
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("fix: it's done"), r"'fix: it'\''s done'");
    }
}
