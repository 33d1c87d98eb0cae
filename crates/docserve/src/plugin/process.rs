use std::future::Future;
use std::process::ExitStatus;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{watch, Notify};

use super::channel::ExitInfo;

/// Owns a spawned worker process and publishes its exit.
///
/// The child is moved into a watcher task that waits for it to exit or for a
/// kill request. Dropping the monitor kills the process.
pub struct ProcessMonitor {
    pid: Option<u32>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessMonitor {
    pub fn start(mut child: Child) -> Self {
        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_stdout(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let kill = Arc::new(Notify::new());
        let kill_signal = kill.clone();
        let (exit_tx, exit) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    if let Err(error) = child.start_kill() {
                        tracing::debug!("failed to kill plugin worker: {}", error);
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => exit_info(status),
                Err(error) => {
                    tracing::warn!("failed to wait for plugin worker: {}", error);
                    ExitInfo::default()
                }
            };
            tracing::debug!(?pid, code = ?info.code, signal = ?info.signal, "plugin worker exited");
            let _ = exit_tx.send(Some(info));
        });

        Self { pid, kill, exit }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already been reaped.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Resolves once the process has exited.
    pub fn exited(&self) -> impl Future<Output = ExitInfo> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            match exit.wait_for(Option::is_some).await {
                Ok(status) => {
                    let info = *status;
                    info.unwrap_or_default()
                }
                Err(_) => ExitInfo::default(),
            }
        }
    }

    /// Requests a forced kill. Idempotent.
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.kill();
        }
    }
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!("plugin-worker stderr: {}", line);
    }
}

async fn forward_stdout<R: AsyncRead + Unpin>(stdout: R) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::warn!("plugin-worker stdout: {}", line);
    }
}
