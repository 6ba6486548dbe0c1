//! Duplex RPC channel over any ordered byte transport.
//!
//! [`IpcChannel`] frames [`Message`]s as JSON lines over an
//! `AsyncRead`/`AsyncWrite` pair -- in production the worker child
//! process's stdio pipes, in tests an in-memory duplex. It implements
//! named-call semantics on top:
//!
//! - [`IpcChannel::call`] sends a uniquely-IDed request and hands back a
//!   [`CallHandle`] that yields zero or more progress payloads and then
//!   settles exactly once.
//! - [`IpcChannel::respond_to`] registers the receiving-side handler for
//!   a name; calls to unregistered names fail fast with an error naming
//!   the operation.
//! - [`IpcChannel::emit`] sends fire-and-forget named events; inbound
//!   ones fan out to [`IpcChannel::subscribe`]rs.
//!
//! Result messages are matched to calls solely by id, so the worker may
//! answer out of order; temporal ordering of operations is enforced by
//! the action queue above this layer, never here. If the transport
//! closes before a result arrives the pending call is abandoned: the
//! handle observes [`IpcError::ChannelClosed`], and layers above pair
//! calls with the explicit death notification.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{CallFailure, IpcError, RemoteError};
use crate::message::Message;
use crate::registry::{Responder, ResponderContext, ResponderRegistry};

/// Capacity of the inbound event fan-out.
const EVENT_CAPACITY: usize = 256;

/// A named event received from the peer (anything that is not part of
/// the call protocol).
#[derive(Debug, Clone)]
pub struct IpcEvent {
    pub name: String,
    pub payload: Vec<Value>,
}

/// The settlement of one call: the decoded error slot plus results.
type Settlement = (Option<CallFailure>, Vec<Value>);

struct PendingCall {
    name: String,
    result_tx: oneshot::Sender<Settlement>,
    progress_tx: mpsc::UnboundedSender<Vec<Value>>,
}

struct ChannelInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    responders: Mutex<ResponderRegistry>,
    out_tx: mpsc::UnboundedSender<Message>,
    events_tx: broadcast::Sender<IpcEvent>,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One end of the controller/worker channel.
///
/// Cheap to clone; all clones share the same transport, pending-call
/// table, and responder registry.
#[derive(Clone)]
pub struct IpcChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel").finish_non_exhaustive()
    }
}

impl IpcChannel {
    /// Wrap a transport. Spawns the reader and writer tasks immediately.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ChannelInner {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            responders: Mutex::new(ResponderRegistry::new()),
            out_tx,
            events_tx,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, out_rx, inner.closed.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&inner)));

        Self { inner }
    }

    /// Build a connected in-memory channel pair (for tests and the mock
    /// worker harness).
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Self::new(ar, aw), Self::new(br, bw))
    }

    /// Open a named call. Allocates a fresh id, registers the pending
    /// call, and sends `[CALL, id, name, ...args]`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> CallHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        lock(&self.inner.pending).insert(
            id,
            PendingCall {
                name: name.to_string(),
                result_tx,
                progress_tx,
            },
        );

        tracing::debug!(id, name, "sending call");
        if self
            .inner
            .out_tx
            .send(Message::call(id, name, args))
            .is_err()
        {
            // Writer gone: drop the pending entry so the handle settles
            // as ChannelClosed instead of hanging.
            lock(&self.inner.pending).remove(&id);
        }

        CallHandle {
            id,
            name: name.to_string(),
            progress_rx,
            result_rx,
        }
    }

    /// Open a call and await its settlement, discarding progress.
    pub async fn call_wait(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, IpcError> {
        self.call(name, args).wait().await
    }

    /// Send a fire-and-forget named event to the peer.
    pub fn emit(&self, name: &str, payload: Vec<Value>) {
        let _ = self.inner.out_tx.send(Message::new(name, payload));
    }

    /// Register the handler for a named operation. At most one handler
    /// per name; a duplicate registration replaces the old handler.
    pub fn respond_to(&self, name: &str, responder: impl Responder) {
        lock(&self.inner.responders).insert(name, Arc::new(responder));
    }

    /// Subscribe to inbound named events.
    pub fn subscribe(&self) -> broadcast::Receiver<IpcEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Wait for the next inbound event with the given name.
    ///
    /// Subscribes at call time; events emitted earlier are not replayed.
    pub async fn wait_event(&self, name: &str) -> Result<IpcEvent, IpcError> {
        let mut rx = self.subscribe();
        loop {
            tokio::select! {
                _ = self.inner.closed.cancelled() => return Err(IpcError::ChannelClosed),
                event = rx.recv() => match event {
                    Ok(event) if event.name == name => return Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(IpcError::ChannelClosed),
                },
            }
        }
    }

    /// Close this end of the channel: stops the reader and writer tasks
    /// (after flushing queued outbound messages) and abandons pending
    /// calls. The peer observes EOF.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether the transport has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the transport closes.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// A token cancelled when the transport closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }
}

/// The caller-side handle for one outstanding call.
///
/// Yields progress payloads in order via [`CallHandle::progress`] (the
/// stream ends when the call settles), then settles exactly once via
/// [`CallHandle::wait`].
pub struct CallHandle {
    id: u64,
    name: String,
    progress_rx: mpsc::UnboundedReceiver<Vec<Value>>,
    result_rx: oneshot::Receiver<Settlement>,
}

impl CallHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The next progress payload, or `None` once the call has settled.
    pub async fn progress(&mut self) -> Option<Vec<Value>> {
        self.progress_rx.recv().await
    }

    /// Await the call's settlement.
    pub async fn wait(self) -> Result<Vec<Value>, IpcError> {
        match self.result_rx.await {
            Ok((None, results)) => Ok(results),
            Ok((Some(failure), _)) => Err(failure.into()),
            Err(_) => Err(IpcError::ChannelClosed),
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let msg = tokio::select! {
            // Queued messages win over the close signal so a responder's
            // final result still reaches the wire before shutdown.
            biased;
            msg = out_rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
            _ = closed.cancelled() => {
                while let Ok(msg) = out_rx.try_recv() {
                    let _ = write_message(&mut writer, &msg).await;
                }
                return;
            }
        };
        if let Err(e) = write_message(&mut writer, &msg).await {
            tracing::warn!(error = %e, "ipc write failed, closing channel");
            closed.cancel();
            return;
        }
    }
}

async fn write_message<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let line = match msg.encode() {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, event = %msg.event, "dropping unencodable message");
            return Ok(());
        }
    };
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop<R>(reader: R, inner: Arc<ChannelInner>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            _ = inner.closed.cancelled() => break,
            next = lines.next_line() => next,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("ipc transport reached EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "ipc read error, stopping reader");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let msg = match Message::decode(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed ipc line");
                continue;
            }
        };
        dispatch(&inner, msg);
    }

    // Peer is gone: abandon every pending call. Dropping the result
    // senders lets awaiting handles observe ChannelClosed.
    inner.closed.cancel();
    lock(&inner.pending).clear();
}

fn dispatch(inner: &Arc<ChannelInner>, msg: Message) {
    if let Some((id, name, args)) = msg.as_call() {
        let ctx = ResponderContext::new(id, inner.out_tx.clone());
        let responder = lock(&inner.responders).get(name);
        let Some(responder) = responder else {
            ctx.reject(RemoteError::from_message(format!(
                "Nothing responds to \"{name}\""
            )));
            return;
        };
        let args = args.to_vec();
        let handler_ctx = ctx.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| responder.handle(args, handler_ctx))) {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "responder panicked".to_string());
            tracing::error!(id, name, detail = %detail, "responder panicked");
            ctx.reject(RemoteError::from_message(detail));
        }
        return;
    }

    if let Some(id) = msg.call_data_id() {
        if let Some(pending) = lock(&inner.pending).get(&id) {
            let _ = pending.progress_tx.send(msg.payload);
        } else {
            tracing::debug!(id, "progress for unknown or settled call");
        }
        return;
    }

    if let Some(id) = msg.call_result_id() {
        let pending = lock(&inner.pending).remove(&id);
        match pending {
            Some(pending) => {
                let failure = msg
                    .payload
                    .first()
                    .and_then(CallFailure::from_wire);
                let results = msg.payload.into_iter().skip(1).collect();
                tracing::debug!(id, name = %pending.name, failed = failure.is_some(), "call settled");
                let _ = pending.result_tx.send((failure, results));
            }
            // Late result for a call whose owner already gave up; the
            // layer that owns the timeout swallows it here.
            None => tracing::debug!(id, "result for unknown call id"),
        }
        return;
    }

    let _ = inner.events_tx.send(IpcEvent {
        name: msg.event,
        payload: msg.payload,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_round_trip_with_registered_responder() {
        let (controller, worker) = IpcChannel::pair();
        worker.respond_to("size", |args: Vec<Value>, ctx: ResponderContext| {
            assert_eq!(args, vec![Value::from(1024), Value::from(768)]);
            ctx.resolve(vec![Value::from("resized")]);
        });

        let results = controller
            .call_wait("size", vec![Value::from(1024), Value::from(768)])
            .await
            .unwrap();
        assert_eq!(results, vec![Value::from("resized")]);
    }

    #[tokio::test]
    async fn unregistered_name_fails_fast_naming_the_operation() {
        let (controller, _worker) = IpcChannel::pair();
        let err = controller.call_wait("no-such-op", vec![]).await.unwrap_err();
        match err {
            IpcError::Remote(remote) => {
                assert!(remote.message.contains("no-such-op"), "{}", remote.message);
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_all_delivered_before_settlement() {
        let (controller, worker) = IpcChannel::pair();
        worker.respond_to("screenshot", |_args: Vec<Value>, ctx: ResponderContext| {
            for i in 0..3 {
                ctx.progress(vec![Value::from(i)]);
            }
            ctx.resolve(vec![Value::from("png-bytes")]);
        });

        let mut handle = controller.call("screenshot", vec![]);
        let mut seen = Vec::new();
        while let Some(chunk) = handle.progress().await {
            seen.push(chunk[0].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        let results = handle.wait().await.unwrap();
        assert_eq!(results[0], "png-bytes");
    }

    #[tokio::test]
    async fn out_of_order_settlement_matches_by_id() {
        let (controller, worker) = IpcChannel::pair();
        // Answer "slow" only after "fast" has been answered.
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let unblock_rx = Arc::new(Mutex::new(Some(unblock_rx)));
        worker.respond_to("slow", move |_args: Vec<Value>, ctx: ResponderContext| {
            let rx = lock(&unblock_rx).take().expect("slow called once");
            tokio::spawn(async move {
                let _ = rx.await;
                ctx.resolve(vec![Value::from("slow-done")]);
            });
        });
        let unblock_tx = Arc::new(Mutex::new(Some(unblock_tx)));
        worker.respond_to("fast", move |_args: Vec<Value>, ctx: ResponderContext| {
            ctx.resolve(vec![Value::from("fast-done")]);
            if let Some(tx) = lock(&unblock_tx).take() {
                let _ = tx.send(());
            }
        });

        let slow = controller.call("slow", vec![]);
        let fast = controller.call("fast", vec![]);
        assert!(slow.id() < fast.id());

        let fast_results = fast.wait().await.unwrap();
        assert_eq!(fast_results[0], "fast-done");
        let slow_results = slow.wait().await.unwrap();
        assert_eq!(slow_results[0], "slow-done");
    }

    #[tokio::test]
    async fn responder_panic_becomes_call_failure() {
        let (controller, worker) = IpcChannel::pair();
        worker.respond_to("explode", |_args: Vec<Value>, _ctx: ResponderContext| {
            panic!("kaboom");
        });

        let err = controller.call_wait("explode", vec![]).await.unwrap_err();
        match err {
            IpcError::Remote(remote) => assert!(remote.message.contains("kaboom")),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let (controller, worker) = IpcChannel::pair();
        let mut rx = controller.subscribe();
        worker.emit("did-finish-load", vec![serde_json::json!({})]);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "did-finish-load");
    }

    #[tokio::test]
    async fn wait_event_filters_by_name() {
        let (controller, worker) = IpcChannel::pair();
        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait_event("ready").await }
        });
        // Give the waiter a moment to subscribe.
        tokio::task::yield_now().await;
        worker.emit("log", vec![Value::from("starting up")]);
        worker.emit("ready", vec![serde_json::json!({"engine": "1.0"})]);

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.name, "ready");
        assert_eq!(event.payload[0]["engine"], "1.0");
    }

    #[tokio::test]
    async fn channel_close_abandons_pending_calls() {
        let (controller, worker) = IpcChannel::pair();
        // No responder registered on purpose -- register one that never
        // completes so the call stays pending.
        worker.respond_to("hang", |_args: Vec<Value>, _ctx: ResponderContext| {});
        let handle = controller.call("hang", vec![]);
        // Give the call a chance to reach the worker, then drop the
        // transport out from under it.
        tokio::task::yield_now().await;
        worker.close();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, IpcError::ChannelClosed));
        controller.closed().await;
        assert!(controller.is_closed());
    }

    #[tokio::test]
    async fn duplicate_registration_replaces_handler() {
        let (controller, worker) = IpcChannel::pair();
        worker.respond_to("useragent", |_args: Vec<Value>, ctx: ResponderContext| {
            ctx.resolve(vec![Value::from("first")]);
        });
        worker.respond_to("useragent", |_args: Vec<Value>, ctx: ResponderContext| {
            ctx.resolve(vec![Value::from("second")]);
        });

        let results = controller.call_wait("useragent", vec![]).await.unwrap();
        assert_eq!(results[0], "second");
    }
}
