//! The mock worker itself: responders, recording, scripted outcomes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use reverie_ipc::{CallFailure, IpcChannel, RemoteError, ResponderContext};
use serde_json::Value;

/// How one scripted `javascript` evaluation settles.
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    Resolve(Value),
    Reject(RemoteError),
    /// Reject with a non-error value (a bare string, a number).
    RejectValue(Value),
    /// Never settle, like a page that never invokes its completion.
    Hang,
}

/// One call the controller made, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub name: String,
    pub args: Vec<Value>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared between the worker's responders and the test's probe.
#[derive(Default)]
pub(crate) struct WorkerState {
    calls: Mutex<Vec<RecordedCall>>,
    evals: Mutex<VecDeque<EvalOutcome>>,
    quit: AtomicBool,
    channel: Mutex<Option<IpcChannel>>,
}

impl WorkerState {
    pub(crate) fn record(&self, name: &str, args: &[Value]) {
        tracing::debug!(name, "mock worker call");
        lock(&self.calls).push(RecordedCall {
            name: name.to_string(),
            args: args.to_vec(),
        });
    }

    pub(crate) fn next_eval(&self) -> EvalOutcome {
        lock(&self.evals)
            .pop_front()
            .unwrap_or(EvalOutcome::Resolve(Value::Null))
    }

    pub(crate) fn push_eval(&self, outcome: EvalOutcome) {
        lock(&self.evals).push_back(outcome);
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub(crate) fn mark_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn was_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub(crate) fn set_channel(&self, channel: IpcChannel) {
        *lock(&self.channel) = Some(channel);
    }

    pub(crate) fn channel(&self) -> Option<IpcChannel> {
        lock(&self.channel).clone()
    }
}

/// Configures a [`MockWorker`] before it is connected.
pub struct MockWorkerBuilder {
    versions: Value,
    evals: VecDeque<EvalOutcome>,
}

impl Default for MockWorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkerBuilder {
    pub fn new() -> Self {
        Self {
            versions: serde_json::json!({ "engine": "mock", "runtime": "harness" }),
            evals: VecDeque::new(),
        }
    }

    /// Version metadata carried by the ready announcement.
    pub fn versions(mut self, versions: Value) -> Self {
        self.versions = versions;
        self
    }

    /// Script the next `javascript` evaluation. Outcomes settle in
    /// queue order; once exhausted, evaluations resolve to null.
    pub fn eval(mut self, outcome: EvalOutcome) -> Self {
        self.evals.push_back(outcome);
        self
    }

    pub fn eval_value(self, value: Value) -> Self {
        self.eval(EvalOutcome::Resolve(value))
    }

    pub fn eval_error(self, message: &str) -> Self {
        self.eval(EvalOutcome::Reject(RemoteError::from_message(message)))
    }

    /// Connect the worker over an in-memory pair. Returns the worker
    /// and the controller-side channel. The ready announcement is NOT
    /// emitted yet; subscribe first, then call [`MockWorker::announce_ready`].
    pub fn connect(mut self) -> (MockWorker, IpcChannel) {
        let state = Arc::new(WorkerState::default());
        self.drain_evals_into(&state);
        self.finish(state)
    }

    pub(crate) fn drain_evals_into(&mut self, state: &WorkerState) {
        for outcome in self.evals.drain(..) {
            state.push_eval(outcome);
        }
    }

    pub(crate) fn finish(self, state: Arc<WorkerState>) -> (MockWorker, IpcChannel) {
        let (controller_side, worker_side) = IpcChannel::pair();
        state.set_channel(worker_side.clone());
        let worker = MockWorker {
            channel: worker_side,
            versions: self.versions,
            state,
        };
        worker.install_responders();
        (worker, controller_side)
    }
}

/// The far end of the channel: answers calls the way a live rendering
/// worker would, minus the rendering.
pub struct MockWorker {
    channel: IpcChannel,
    versions: Value,
    state: Arc<WorkerState>,
}

impl MockWorker {
    /// Emit the ready announcement with the configured versions.
    pub fn announce_ready(&self) {
        self.channel.emit("ready", vec![self.versions.clone()]);
    }

    /// Emit an arbitrary named event toward the controller.
    pub fn emit(&self, name: &str, payload: Vec<Value>) {
        self.channel.emit(name, payload);
    }

    /// Drop the transport, as a crashing process would.
    pub fn crash(&self) {
        self.channel.close();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls()
    }

    fn install_responders(&self) {
        let simple = [
            "browser-initialize",
            "continue",
            "type",
            "insert",
            "css",
            "html",
            "size",
            "useragent",
            "authentication",
            "action",
            "cookie.set",
            "cookie.clear",
            "cookie.clearAll",
        ];
        for name in simple {
            let state = Arc::clone(&self.state);
            self.channel
                .respond_to(name, move |args: Vec<Value>, ctx: ResponderContext| {
                    state.record(name, &args);
                    ctx.resolve(vec![]);
                });
        }

        let state = Arc::clone(&self.state);
        self.channel
            .respond_to("javascript", move |args: Vec<Value>, ctx: ResponderContext| {
                state.record("javascript", &args);
                match state.next_eval() {
                    EvalOutcome::Resolve(value) => ctx.resolve(vec![value]),
                    EvalOutcome::Reject(err) => ctx.reject(err),
                    EvalOutcome::RejectValue(value) => {
                        ctx.complete(Some(CallFailure::Value(value)), vec![])
                    }
                    EvalOutcome::Hang => drop(ctx),
                }
            });

        let state = Arc::clone(&self.state);
        self.channel
            .respond_to("goto", move |args: Vec<Value>, ctx: ResponderContext| {
                state.record("goto", &args);
                let url = args.first().cloned().unwrap_or(Value::Null);
                ctx.resolve(vec![serde_json::json!({ "url": url, "code": 200 })]);
            });

        for name in ["screenshot", "pdf"] {
            let state = Arc::clone(&self.state);
            self.channel
                .respond_to(name, move |args: Vec<Value>, ctx: ResponderContext| {
                    state.record(name, &args);
                    ctx.resolve(vec![serde_json::json!({ "data": [137, 80, 78, 71] })]);
                });
        }

        let state = Arc::clone(&self.state);
        self.channel
            .respond_to("cookie.get", move |args: Vec<Value>, ctx: ResponderContext| {
                state.record("cookie.get", &args);
                ctx.resolve(vec![serde_json::json!([])]);
            });

        // Quit acknowledges, then drops the transport like a real exit.
        let state = Arc::clone(&self.state);
        let closed = self.channel.closed_token();
        self.channel
            .respond_to("quit", move |args: Vec<Value>, ctx: ResponderContext| {
                state.record("quit", &args);
                state.mark_quit();
                ctx.resolve(vec![]);
                closed.cancel();
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_goto_with_a_navigation_result() {
        let (worker, controller) = MockWorkerBuilder::new().connect();
        let results = controller
            .call_wait("goto", vec![Value::from("https://example.com")])
            .await
            .unwrap();
        assert_eq!(results[0]["code"], 200);
        assert_eq!(worker.calls()[0].name, "goto");
    }

    #[tokio::test]
    async fn scripted_evals_settle_in_order_then_default_null() {
        let (_worker, controller) = MockWorkerBuilder::new()
            .eval_value(Value::from(1))
            .eval_error("page exploded")
            .connect();

        let first = controller
            .call_wait("javascript", vec![Value::from("x")])
            .await
            .unwrap();
        assert_eq!(first[0], 1);

        let err = controller
            .call_wait("javascript", vec![Value::from("y")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("page exploded"));

        let third = controller
            .call_wait("javascript", vec![Value::from("z")])
            .await
            .unwrap();
        assert_eq!(third[0], Value::Null);
    }

    #[tokio::test]
    async fn quit_acknowledges_then_closes_the_transport() {
        let (worker, controller) = MockWorkerBuilder::new().connect();
        controller.call_wait("quit", vec![]).await.unwrap();
        assert!(worker.state.was_quit());
        controller.closed().await;
    }

    #[tokio::test]
    async fn ready_carries_the_configured_versions() {
        let (worker, controller) = MockWorkerBuilder::new()
            .versions(serde_json::json!({ "engine": "9.9" }))
            .connect();
        let mut events = controller.subscribe();
        worker.announce_ready();

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "ready");
        assert_eq!(event.payload[0]["engine"], "9.9");
    }
}
