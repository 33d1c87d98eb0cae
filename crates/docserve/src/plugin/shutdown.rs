use std::time::Duration;

use super::channel::ExitInfo;
use super::protocol::{new_correlation_id, WorkerRequest};
use super::supervisor::HostHandle;

/// Time allowed for the OS to reap a worker after a kill or disconnect.
const REAP_WINDOW: Duration = Duration::from_secs(1);

/// How a worker shutdown settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No live worker was attached.
    NotRunning,
    /// The worker exited within the grace period.
    Exited(ExitInfo),
    /// The channel closed within the grace period.
    Disconnected,
    /// The grace period elapsed and the worker was killed.
    Killed(Option<ExitInfo>),
}

/// Stops the worker held in `slot` and empties the slot.
///
/// Sends `shutdown` without waiting for the ack, then waits for whichever
/// comes first: process exit, channel close, or the end of `grace`. On grace
/// expiry the worker is killed.
pub async fn shutdown_host(slot: &mut Option<HostHandle>, grace: Duration) -> ShutdownOutcome {
    let Some(handle) = slot.take() else {
        return ShutdownOutcome::NotRunning;
    };
    if handle.has_exited() {
        tracing::debug!("plugin worker already exited");
        return ShutdownOutcome::NotRunning;
    }

    let channel = handle.channel().clone();
    let process = handle.process();
    if !channel.send(&WorkerRequest::Shutdown {
        id: new_correlation_id(),
    }) {
        tracing::debug!("shutdown request could not be delivered");
    }

    let outcome = tokio::select! {
        info = process.exited() => ShutdownOutcome::Exited(info),
        _ = channel.wait_closed() => ShutdownOutcome::Disconnected,
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("plugin worker ignored shutdown for {}ms, killing", grace.as_millis());
            process.kill();
            let info = tokio::time::timeout(REAP_WINDOW, process.exited()).await.ok();
            ShutdownOutcome::Killed(info)
        }
    };

    if outcome == ShutdownOutcome::Disconnected
        && tokio::time::timeout(REAP_WINDOW, process.exited()).await.is_err()
    {
        tracing::debug!("plugin worker still running after disconnect, killing");
        process.kill();
    }

    tracing::info!(?outcome, "plugin host stopped");
    outcome
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugin::channel::MessageChannel;
    use crate::plugin::process::ProcessMonitor;
    use crate::plugin::supervisor::LoadReport;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::process::Command;

    fn handle(script: &str) -> (HostHandle, DuplexStream) {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let process = ProcessMonitor::start(child);
        let (supervisor_end, worker_end) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(supervisor_end);
        let channel = Arc::new(MessageChannel::spawn(reader, writer));
        let handle = HostHandle::from_parts(
            channel,
            process,
            Vec::new(),
            LoadReport::default(),
            Duration::from_secs(1),
        );
        (handle, worker_end)
    }

    #[tokio::test]
    async fn empty_slot_is_a_no_op() {
        let mut slot = None;
        assert_eq!(
            shutdown_host(&mut slot, Duration::from_millis(10)).await,
            ShutdownOutcome::NotRunning
        );
        assert!(slot.is_none());
    }

    #[tokio::test]
    async fn unresponsive_worker_is_killed_after_grace() {
        let (handle, _worker_end) = handle("sleep 30");
        let mut slot = Some(handle);
        let started = Instant::now();

        let outcome = shutdown_host(&mut slot, Duration::from_millis(100)).await;

        assert!(matches!(outcome, ShutdownOutcome::Killed(Some(ExitInfo { signal: Some(9), .. }))));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(slot.is_none());
    }

    #[tokio::test]
    async fn worker_exit_settles_before_grace() {
        let (handle, _worker_end) = handle("sleep 0.2");
        let mut slot = Some(handle);
        let started = Instant::now();

        let outcome = shutdown_host(&mut slot, Duration::from_secs(10)).await;

        assert_eq!(
            outcome,
            ShutdownOutcome::Exited(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn disconnect_settles_and_sends_shutdown() {
        let (handle, worker_end) = handle("sleep 30");
        let mut slot = Some(handle);

        let worker = tokio::spawn(async move {
            let mut lines = BufReader::new(worker_end).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            drop(lines);
            line
        });

        let started = Instant::now();
        let outcome = shutdown_host(&mut slot, Duration::from_secs(10)).await;

        assert_eq!(outcome, ShutdownOutcome::Disconnected);
        assert!(started.elapsed() < Duration::from_secs(5));
        let request: serde_json::Value = serde_json::from_str(&worker.await.unwrap()).unwrap();
        assert_eq!(request["t"], "shutdown");
    }

    #[tokio::test]
    async fn shutdown_runs_once_per_handle() {
        let (handle, _worker_end) = handle("sleep 0.1");
        let mut slot = Some(handle);
        let first = shutdown_host(&mut slot, Duration::from_secs(5)).await;
        let second = shutdown_host(&mut slot, Duration::from_secs(5)).await;
        assert!(matches!(first, ShutdownOutcome::Exited(_)));
        assert_eq!(second, ShutdownOutcome::NotRunning);
    }
}
