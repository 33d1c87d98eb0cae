//! Supervisor side of the worker message channel.
//!
//! Requests are written as newline-delimited JSON by a writer task; incoming
//! lines are parsed by a reader task and fanned out to every registered
//! listener. A listener lives exactly as long as its [`Subscription`].
//! Process exit and channel EOF close the channel for all current and future
//! listeners.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::protocol::WorkerRequest;

/// How the worker process ended, when known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out waiting for worker response after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("worker exited before response ({0})")]
    Exited(ExitInfo),
    #[error("worker exited before response (channel disconnected)")]
    Disconnected,
    #[error("worker channel rejected the request")]
    SendFailed,
}

#[derive(Debug, Clone)]
enum ChannelEvent {
    Message(Arc<Value>),
    Exit(ExitInfo),
    Disconnect,
}

#[derive(Default)]
struct ListenerSet {
    next_key: u64,
    listeners: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
    closed: Option<ChannelEvent>,
}

#[derive(Default)]
struct Listeners {
    inner: Mutex<ListenerSet>,
}

impl Listeners {
    fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut set = self.inner.lock();
        if let Some(closed) = &set.closed {
            let _ = tx.send(closed.clone());
            return Subscription {
                key: None,
                rx,
                listeners: Arc::clone(self),
            };
        }
        let key = set.next_key;
        set.next_key += 1;
        set.listeners.insert(key, tx);
        Subscription {
            key: Some(key),
            rx,
            listeners: Arc::clone(self),
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        let mut set = self.inner.lock();
        match event {
            ChannelEvent::Message(_) => {
                if set.closed.is_some() {
                    return;
                }
                set.listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
            }
            ChannelEvent::Exit(_) | ChannelEvent::Disconnect => {
                if set.closed.is_some() {
                    // An exit status arriving after EOF refines the closed state
                    // for later subscribers; current listeners were already told.
                    let refines = matches!(set.closed, Some(ChannelEvent::Disconnect))
                        && matches!(event, ChannelEvent::Exit(_));
                    if refines {
                        set.closed = Some(event);
                    }
                    return;
                }
                set.closed = Some(event.clone());
                for (_, tx) in set.listeners.drain() {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    fn remove(&self, key: u64) {
        self.inner.lock().listeners.remove(&key);
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

/// Registration of one listener. Deregisters on drop.
struct Subscription {
    key: Option<u64>,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    listeners: Arc<Listeners>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.listeners.remove(key);
        }
    }
}

/// Bidirectional message channel to one worker.
pub struct MessageChannel {
    outbound: mpsc::UnboundedSender<String>,
    listeners: Arc<Listeners>,
}

impl MessageChannel {
    /// Starts the reader and writer tasks over an established transport.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let listeners = Arc::new(Listeners::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, Arc::clone(&listeners)));

        Self {
            outbound,
            listeners,
        }
    }

    /// Queues a request for the worker. Returns `false` when the channel is
    /// closed or the writer is gone; never errors.
    pub fn send(&self, request: &WorkerRequest) -> bool {
        if self.listeners.is_closed() {
            return false;
        }
        let mut line = match serde_json::to_string(request) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!("failed to serialize worker request: {}", error);
                return false;
            }
        };
        line.push('\n');
        self.outbound.send(line).is_ok()
    }

    /// Waits for the first message accepted by `matcher`.
    ///
    /// The listener is registered when this is called, not when the returned
    /// future is first polled, so a request sent afterwards cannot race its
    /// response. Resolves once: with the match, with a timeout, or with the
    /// worker's exit or disconnect.
    pub fn await_response<T, M>(
        &self,
        matcher: M,
        timeout: Duration,
    ) -> impl Future<Output = Result<T, ChannelError>> + Send + 'static
    where
        M: Fn(&Value) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut subscription = self.listeners.subscribe();
        async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;
                    event = subscription.rx.recv() => match event {
                        Some(ChannelEvent::Message(message)) => {
                            if let Some(matched) = matcher(&message) {
                                return Ok(matched);
                            }
                        }
                        Some(ChannelEvent::Exit(info)) => return Err(ChannelError::Exited(info)),
                        Some(ChannelEvent::Disconnect) | None => {
                            return Err(ChannelError::Disconnected)
                        }
                    },
                    _ = &mut deadline => return Err(ChannelError::Timeout(timeout)),
                }
            }
        }
    }

    /// Subscribes, sends `request`, then awaits the matching response.
    pub async fn request<T, M>(
        &self,
        request: &WorkerRequest,
        matcher: M,
        timeout: Duration,
    ) -> Result<T, ChannelError>
    where
        M: Fn(&Value) -> Option<T> + Send + 'static,
        T: Send + 'static,
    {
        let pending = self.await_response(matcher, timeout);
        if !self.send(request) {
            if self.listeners.is_closed() {
                return pending.await;
            }
            return Err(ChannelError::SendFailed);
        }
        pending.await
    }

    /// Records that the worker process has exited.
    pub fn notify_exit(&self, info: ExitInfo) {
        self.listeners.dispatch(ChannelEvent::Exit(info));
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.is_closed()
    }

    /// Resolves when the worker exits (`Some`) or the channel hits EOF (`None`).
    pub fn wait_closed(&self) -> impl Future<Output = Option<ExitInfo>> + Send + 'static {
        let mut subscription = self.listeners.subscribe();
        async move {
            loop {
                match subscription.rx.recv().await {
                    Some(ChannelEvent::Message(_)) => continue,
                    Some(ChannelEvent::Exit(info)) => return Some(info),
                    Some(ChannelEvent::Disconnect) | None => return None,
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound.recv().await {
        if let Err(error) = writer.write_all(line.as_bytes()).await {
            tracing::warn!("failed to write to worker channel: {}", error);
            break;
        }
        if let Err(error) = writer.flush().await {
            tracing::warn!("failed to flush worker channel: {}", error);
            break;
        }
    }
}

async fn read_loop<R>(reader: R, listeners: Arc<Listeners>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) if message.is_object() => {
                        listeners.dispatch(ChannelEvent::Message(Arc::new(message)));
                    }
                    Ok(_) => tracing::warn!("worker sent a non-object message: {}", line),
                    Err(error) => {
                        tracing::warn!("worker channel parse error: {} line={}", error, line)
                    }
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!("worker channel read error: {}", error);
                break;
            }
        }
    }
    listeners.dispatch(ChannelEvent::Disconnect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::protocol::matchers;
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn channel_pair() -> (MessageChannel, DuplexStream) {
        let (supervisor_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(supervisor_end);
        (MessageChannel::spawn(reader, writer), worker_end)
    }

    async fn write_line(stream: &mut DuplexStream, value: Value) {
        let mut line = serde_json::to_string(&value).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn send_writes_one_json_line() {
        let (channel, worker_end) = channel_pair();
        assert!(channel.send(&WorkerRequest::Hello { id: "h1".to_string() }));

        let mut lines = BufReader::new(worker_end).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"t": "hello", "id": "h1"}));
    }

    #[tokio::test]
    async fn resolves_with_first_matching_message() {
        let (channel, mut worker_end) = channel_pair();
        let pending = channel.await_response(matchers::load_ack("x"), Duration::from_secs(2));

        write_line(&mut worker_end, json!({"t": "load:ack", "id": "x", "warnings": []})).await;
        write_line(&mut worker_end, json!({"t": "load:ack", "id": "y", "warnings": [], "errors": []})).await;
        worker_end.write_all(b"not json\n").await.unwrap();
        write_line(
            &mut worker_end,
            json!({"t": "load:ack", "id": "x", "warnings": ["w2"], "errors": []}),
        )
        .await;

        let ack = pending.await.unwrap();
        assert_eq!(ack.id, "x");
        assert_eq!(ack.warnings, vec!["w2".to_string()]);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_waiters() {
        let (channel, mut worker_end) = channel_pair();
        let first = channel.await_response(matchers::invoke_result("1"), Duration::from_secs(2));
        let second = channel.await_response(matchers::invoke_result("2"), Duration::from_secs(2));

        write_line(&mut worker_end, json!({"t": "invoke:result", "id": "2", "ok": true, "result": "b"})).await;
        write_line(&mut worker_end, json!({"t": "invoke:result", "id": "1", "ok": true, "result": "a"})).await;

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().result, Some(json!("a")));
        assert_eq!(second.unwrap().result, Some(json!("b")));
    }

    #[tokio::test]
    async fn times_out_within_margin() {
        let (channel, _worker_end) = channel_pair();
        let started = Instant::now();
        let result = channel
            .await_response(matchers::hello_ack(), Duration::from_millis(100))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result, Err(ChannelError::Timeout(Duration::from_millis(100))));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn exit_rejects_regardless_of_remaining_budget() {
        let (channel, _worker_end) = channel_pair();
        let pending = channel.await_response(matchers::hello_ack(), Duration::from_secs(30));
        let info = ExitInfo {
            code: Some(3),
            signal: None,
        };
        channel.notify_exit(info);

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("rejection should not wait for the timeout");
        assert_eq!(result, Err(ChannelError::Exited(info)));
        assert!(result.unwrap_err().to_string().contains("exited before response"));
    }

    #[tokio::test]
    async fn disconnect_rejects_and_closes_channel() {
        let (channel, worker_end) = channel_pair();
        let pending = channel.await_response(matchers::hello_ack(), Duration::from_secs(30));
        drop(worker_end);

        assert_eq!(pending.await, Err(ChannelError::Disconnected));
        assert!(channel.is_closed());
        assert!(!channel.send(&WorkerRequest::Hello { id: "late".to_string() }));
    }

    #[tokio::test]
    async fn subscribing_after_close_rejects_immediately() {
        let (channel, _worker_end) = channel_pair();
        channel.notify_exit(ExitInfo {
            code: None,
            signal: Some(9),
        });
        let result = channel
            .request(
                &WorkerRequest::Hello { id: "h".to_string() },
                matchers::hello_ack(),
                Duration::from_secs(30),
            )
            .await;
        assert!(matches!(result, Err(ChannelError::Exited(ExitInfo { signal: Some(9), .. }))));
    }

    #[tokio::test]
    async fn dropped_waiters_deregister_listeners() {
        let (channel, _worker_end) = channel_pair();
        let first = channel.await_response(matchers::hello_ack(), Duration::from_secs(5));
        let second = channel.await_response(matchers::hello_ack(), Duration::from_secs(5));
        assert_eq!(channel.listener_count(), 2);
        drop(first);
        drop(second);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn wait_closed_reports_exit_status() {
        let (channel, _worker_end) = channel_pair();
        let closed = channel.wait_closed();
        channel.notify_exit(ExitInfo {
            code: Some(0),
            signal: None,
        });
        assert_eq!(closed.await.and_then(|info| info.code), Some(0));
    }
}
