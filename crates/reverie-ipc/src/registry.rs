//! Responder registration and the write-once completion handle.
//!
//! A responder is the worker-side handler for one named operation. It
//! receives the call arguments and a [`ResponderContext`] through which it
//! may report progress any number of times and must complete exactly
//! once. A second completion is a programming error: it is logged and
//! dropped rather than sent, so the one-result-per-call invariant holds
//! on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{CallFailure, RemoteError};
use crate::message::Message;

/// A handler for one named remote operation.
///
/// Implemented for any `Fn(Vec<Value>, ResponderContext)` closure. The
/// handler body runs on the channel's reader task; long-running work
/// should move the context into a spawned task and complete from there.
pub trait Responder: Send + Sync + 'static {
    fn handle(&self, args: Vec<Value>, ctx: ResponderContext);
}

impl<F> Responder for F
where
    F: Fn(Vec<Value>, ResponderContext) + Send + Sync + 'static,
{
    fn handle(&self, args: Vec<Value>, ctx: ResponderContext) {
        self(args, ctx)
    }
}

/// Per-call completion and progress handle passed to a responder.
///
/// Clones share the same write-once completion flag.
#[derive(Clone)]
pub struct ResponderContext {
    call_id: u64,
    out: mpsc::UnboundedSender<Message>,
    completed: Arc<AtomicBool>,
}

impl ResponderContext {
    pub(crate) fn new(call_id: u64, out: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            call_id,
            out,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The id of the call this context answers.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Send a progress notification. Ignored after completion.
    pub fn progress(&self, payload: Vec<Value>) {
        if self.completed.load(Ordering::SeqCst) {
            tracing::warn!(id = self.call_id, "progress after completion ignored");
            return;
        }
        let _ = self.out.send(Message::call_data(self.call_id, payload));
    }

    /// Complete the call. The first invocation wins; later ones are
    /// flagged and dropped.
    pub fn complete(&self, err: Option<CallFailure>, results: Vec<Value>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::error!(
                id = self.call_id,
                "responder completed more than once; extra result dropped"
            );
            return;
        }
        let err = err.map(|f| f.to_wire()).unwrap_or(Value::Null);
        let _ = self.out.send(Message::call_result(self.call_id, err, results));
    }

    /// Complete successfully with the given results.
    pub fn resolve(&self, results: Vec<Value>) {
        self.complete(None, results);
    }

    /// Complete with a serialized error.
    pub fn reject(&self, err: RemoteError) {
        self.complete(Some(CallFailure::Remote(err)), Vec::new());
    }
}

/// Table mapping operation names to responders. At most one responder
/// per name; registering a duplicate replaces the old one.
#[derive(Default)]
pub struct ResponderRegistry {
    responders: HashMap<String, Arc<dyn Responder>>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a responder, replacing (and logging) any previous one.
    pub fn insert(&mut self, name: &str, responder: Arc<dyn Responder>) {
        if self.responders.contains_key(name) {
            tracing::debug!(name, "replacing responder");
        }
        self.responders.insert(name.to_string(), responder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Responder>> {
        self.responders.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}
