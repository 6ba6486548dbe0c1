//! The controller instance: a sequential action queue bridged to async
//! callers, plus the lifecycle plumbing around the worker.
//!
//! Fluent methods (see `actions`) only enqueue. Nothing touches the
//! worker until [`Reverie::run`], which detaches the queue and steps
//! through it one action at a time, issuing a `continue` call between
//! actions so the worker settles before the next one. The first queued
//! action is always the bootstrap that launches and initializes the
//! worker, so construction itself spawns nothing.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use reverie_ipc::{IpcChannel, IpcError, IpcEvent};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ControlError;
use crate::script;
use crate::supervisor::{self, ProcessLauncher, WorkerHandle, WorkerLauncher};

/// Instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed; the worker has not been launched.
    Initial,
    /// The worker is up and the queue is idle.
    Ready,
    /// A run is draining the queue.
    Running,
    /// End requested; teardown happens when the current run finishes
    /// (or immediately, on halt).
    Ending,
    /// Torn down. Terminal.
    Ended,
}

/// Why the instance considers its worker dead. Recorded once; the
/// first reason wins and outranks later action results.
#[derive(Debug, Clone)]
pub(crate) struct DieReason {
    pub message: String,
    pub stack: Option<String>,
    pub fatal: bool,
}

impl DieReason {
    pub(crate) fn into_error(self) -> ControlError {
        if self.fatal {
            ControlError::FatalWorker {
                message: self.message,
                stack: self.stack,
            }
        } else {
            ControlError::WorkerDied {
                message: self.message,
            }
        }
    }
}

type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, ControlError>> + Send>>;

pub(crate) struct Action {
    pub name: &'static str,
    pub op: Box<dyn FnOnce(Arc<Inner>) -> ActionFuture + Send>,
}

pub(crate) struct Inner {
    pub config: Config,
    /// Identifier namespacing this instance's page-side bridge.
    pub identifier: String,
    pub instance_id: Uuid,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub state: Mutex<State>,
    pub queue: Mutex<Vec<Action>>,
    pub worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    pub die: Mutex<Option<DieReason>>,
    pub rejector: Mutex<Option<oneshot::Sender<ControlError>>>,
    pub headers: Mutex<BTreeMap<String, String>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A controller for one sandboxed rendering worker.
///
/// Clones share the instance, so a halt handle can live on another
/// task while a run is in flight.
#[derive(Clone)]
pub struct Reverie {
    pub(crate) inner: Arc<Inner>,
}

impl Reverie {
    /// Create an instance that spawns the configured worker program.
    pub fn new(config: Config) -> Self {
        Self::with_launcher(config, Arc::new(ProcessLauncher))
    }

    /// Create an instance with an injected launcher (tests, embeddings).
    pub fn with_launcher(config: Config, launcher: Arc<dyn WorkerLauncher>) -> Self {
        config.warn_on_suspect_timeouts();
        let instance = Self {
            inner: Arc::new(Inner {
                config,
                identifier: Uuid::new_v4().simple().to_string(),
                instance_id: Uuid::new_v4(),
                launcher,
                state: Mutex::new(State::Initial),
                queue: Mutex::new(Vec::new()),
                worker: tokio::sync::Mutex::new(None),
                die: Mutex::new(None),
                rejector: Mutex::new(None),
                headers: Mutex::new(BTreeMap::new()),
            }),
        };
        instance.queue_action("bootstrap", |inner| Box::pin(bootstrap(inner)));
        instance
    }

    /// The per-instance identifier used to namespace page-side state.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn state(&self) -> State {
        *lock(&self.inner.state)
    }

    /// How many actions are queued for the next run.
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub(crate) fn queue_action<F>(&self, name: &'static str, op: F) -> &Self
    where
        F: FnOnce(Arc<Inner>) -> ActionFuture + Send + 'static,
    {
        lock(&self.inner.queue).push(Action {
            name,
            op: Box::new(op),
        });
        self
    }

    /// Enqueue a raw named call to the worker. The run's value becomes
    /// the call's first result. Extension point for custom operations.
    pub fn queue_call(&self, name: impl Into<String>, args: Vec<Value>) -> &Self {
        let name = name.into();
        self.queue_action("call", move |inner| {
            Box::pin(async move {
                let channel = require_channel(&inner).await?;
                let results = channel.call_wait(&name, args).await?;
                Ok(results.into_iter().next().unwrap_or(Value::Null))
            })
        })
    }

    /// Run a plugin: a function that queues onto this instance.
    pub fn apply<F>(&self, plugin: F) -> &Self
    where
        F: FnOnce(&Self),
    {
        plugin(self);
        self
    }

    /// Drain the queue, returning the value of the last action.
    ///
    /// The first action to fail short-circuits the run; queued actions
    /// after it do not execute. A halt from another task settles the
    /// returned future immediately with the halt error.
    pub async fn run(&self) -> Result<Value, ControlError> {
        let (reject_tx, reject_rx) = oneshot::channel();
        *lock(&self.inner.rejector) = Some(reject_tx);

        let fut = run_internal(Arc::clone(&self.inner));
        tokio::pin!(fut);
        tokio::select! {
            outcome = &mut fut => {
                let _ = lock(&self.inner.rejector).take();
                outcome
            }
            halted = reject_rx => match halted {
                Ok(error) => Err(error),
                // Rejector dropped without firing: keep running.
                Err(_) => fut.await,
            },
        }
    }

    /// Mark the instance as ending. The next (or current) run drains
    /// the remaining queue, then tears the worker down before settling.
    pub fn end(&self) -> &Self {
        let mut state = lock(&self.inner.state);
        if *state != State::Ended {
            *state = State::Ending;
        }
        self
    }

    /// Stop everything now: empty the queue, settle any in-flight run
    /// with `error` (default: the standard halt message), and tear the
    /// worker down. Idempotent once the instance has ended.
    pub async fn halt(&self, error: Option<ControlError>) {
        {
            let mut state = lock(&self.inner.state);
            if *state == State::Ended {
                return;
            }
            *state = State::Ending;
        }
        lock(&self.inner.queue).clear();

        let error = error.unwrap_or_else(ControlError::halted);
        record_die(
            &self.inner,
            DieReason {
                message: error.to_string(),
                stack: None,
                fatal: false,
            },
        );
        if let Some(tx) = lock(&self.inner.rejector).take() {
            let _ = tx.send(error);
        } else {
            tracing::debug!("halt with no run in flight");
        }
        end_instance(&self.inner, true).await;
    }
}

async fn run_internal(inner: Arc<Inner>) -> Result<Value, ControlError> {
    {
        let mut state = lock(&inner.state);
        if *state == State::Ended {
            return Err(ControlError::Ended);
        }
        if *state != State::Ending {
            *state = State::Running;
        }
    }

    let steps: Vec<Action> = std::mem::take(&mut *lock(&inner.queue));
    tracing::debug!(steps = steps.len(), "run started");

    let mut outcome: Result<Value, ControlError> = Ok(Value::Null);
    for action in steps {
        tracing::debug!(action = action.name, "running action");
        let result = (action.op)(Arc::clone(&inner)).await;

        // A recorded death outranks whatever the action reported.
        if let Some(reason) = lock(&inner.die).clone() {
            outcome = Err(reason.into_error());
            break;
        }
        match result {
            Ok(value) => outcome = Ok(value),
            Err(error) => {
                // A closed channel is a symptom; report the death that
                // caused it. The event pump may not have recorded the
                // reason yet, so give it one scheduling pass.
                let error = match error {
                    ControlError::Ipc(IpcError::ChannelClosed) => {
                        tokio::task::yield_now().await;
                        match lock(&inner.die).clone() {
                            Some(reason) => reason.into_error(),
                            None => ControlError::WorkerDied {
                                message: "worker process disconnected".into(),
                            },
                        }
                    }
                    other => other,
                };
                tracing::debug!(action = action.name, error = %error, "action failed");
                outcome = Err(error);
                break;
            }
        }

        // Let the worker settle before the next action. Failure here is
        // not the action's failure; the death path reports it instead.
        if let Some(channel) = worker_channel(&inner).await {
            if let Err(e) = channel.call_wait("continue", vec![]).await {
                tracing::debug!(error = %e, "continue call failed");
            }
        }
    }

    let ending = *lock(&inner.state) == State::Ending;
    if ending {
        end_instance(&inner, false).await;
    } else {
        let mut state = lock(&inner.state);
        if *state == State::Running {
            *state = State::Ready;
        }
    }
    outcome
}

/// Launch, watch, and initialize the worker. Always the first action of
/// the first run.
async fn bootstrap(inner: Arc<Inner>) -> Result<Value, ControlError> {
    let token = supervisor::register_teardown(inner.instance_id);
    spawn_teardown_watcher(Arc::downgrade(&inner), token);

    let mut launched = inner
        .launcher
        .launch(&inner.config, &inner.identifier)
        .await?;
    tokio::spawn(event_pump(
        Arc::downgrade(&inner),
        launched.channel.closed_token(),
        launched.channel.subscribe(),
    ));

    let versions = supervisor::ready_handshake(&mut launched, &inner.config).await?;
    *inner.worker.lock().await = Some(WorkerHandle {
        channel: launched.channel,
        child: launched.child,
        versions: versions.clone(),
    });
    tracing::info!(identifier = %inner.identifier, "worker initialized");
    Ok(versions)
}

fn spawn_teardown_watcher(inner: Weak<Inner>, token: CancellationToken) {
    tokio::spawn(async move {
        token.cancelled().await;
        if let Some(inner) = inner.upgrade() {
            if *lock(&inner.state) != State::Ended {
                tracing::info!("teardown requested, ending instance");
                record_die(
                    &inner,
                    DieReason {
                        message: "instance torn down by signal".into(),
                        stack: None,
                        fatal: false,
                    },
                );
                end_instance(&inner, false).await;
            }
        }
    });
}

/// Forward worker events: logs to the log, death notifications into the
/// recorded reason, everything else traced for diagnostics.
async fn event_pump(
    inner: Weak<Inner>,
    closed: CancellationToken,
    mut rx: broadcast::Receiver<IpcEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "worker event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        match event.name.as_str() {
            "log" => {
                tracing::debug!(target: "reverie::worker", payload = ?event.payload, "worker log")
            }
            "die" => {
                let message = event
                    .payload
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("worker died")
                    .to_string();
                let Some(inner) = inner.upgrade() else { break };
                record_die(
                    &inner,
                    DieReason {
                        message,
                        stack: None,
                        fatal: false,
                    },
                );
            }
            "uncaughtException" => {
                let message = event
                    .payload
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("uncaught exception in worker")
                    .to_string();
                let stack = event
                    .payload
                    .get(1)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::error!(error = %message, "uncaught exception in worker runner");
                let Some(inner) = inner.upgrade() else { break };
                record_die(
                    &inner,
                    DieReason {
                        message,
                        stack,
                        fatal: true,
                    },
                );
                end_instance(&inner, true).await;
                break;
            }
            other => tracing::trace!(event = other, "worker event"),
        }
    }

    // Transport gone without an explicit reason: record one so pending
    // work fails with a cause instead of a bare closed channel.
    if let Some(inner) = inner.upgrade() {
        if *lock(&inner.state) != State::Ended {
            record_die(
                &inner,
                DieReason {
                    message: "worker process disconnected".into(),
                    stack: None,
                    fatal: false,
                },
            );
        }
    }
}

pub(crate) fn record_die(inner: &Inner, reason: DieReason) {
    let mut die = lock(&inner.die);
    if die.is_none() {
        tracing::debug!(message = %reason.message, fatal = reason.fatal, "death recorded");
        *die = Some(reason);
    }
}

/// Tear down the worker and mark the instance ended. Idempotent.
pub(crate) async fn end_instance(inner: &Arc<Inner>, force_kill: bool) {
    {
        let mut state = lock(&inner.state);
        if *state == State::Ended {
            return;
        }
        *state = State::Ended;
    }
    let mut worker = inner.worker.lock().await;
    supervisor::end_worker(&mut worker, force_kill).await;
    drop(worker);
    supervisor::deregister_teardown(inner.instance_id);
    tracing::info!(identifier = %inner.identifier, "instance ended");
}

pub(crate) async fn worker_channel(inner: &Inner) -> Option<IpcChannel> {
    inner
        .worker
        .lock()
        .await
        .as_ref()
        .map(|w| w.channel.clone())
}

pub(crate) async fn require_channel(inner: &Inner) -> Result<IpcChannel, ControlError> {
    worker_channel(inner)
        .await
        .ok_or_else(|| ControlError::WorkerDied {
            message: "worker is not running".into(),
        })
}

/// Run `src` against the page right now, outside the queue.
pub(crate) async fn evaluate_now(
    inner: &Inner,
    src: &str,
    args: Vec<Value>,
) -> Result<Value, ControlError> {
    let channel = require_channel(inner).await?;
    let script = script::execute(&inner.identifier, src, &args);
    let results = channel
        .call_wait("javascript", vec![Value::from(script)])
        .await?;
    Ok(results.into_iter().next().unwrap_or(Value::Null))
}
