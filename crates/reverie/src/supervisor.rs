//! Worker process lifecycle: spawning, the ready handshake, teardown,
//! and process-wide signal handling.
//!
//! The launcher is a trait so tests can stand up an in-memory worker
//! without forking anything. The production [`ProcessLauncher`] spawns
//! the configured worker program with its stdio piped: stdin/stdout
//! carry the message protocol, stderr is forwarded to the log.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use reverie_ipc::{IpcChannel, IpcEvent};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ControlError;

/// How long teardown waits for a graceful quit before giving up.
const QUIT_GRACE: Duration = Duration::from_secs(5);

/// Boxed future returned by [`WorkerLauncher::launch`].
pub type LaunchFuture =
    Pin<Box<dyn Future<Output = Result<LaunchedWorker, ControlError>> + Send>>;

/// Something that can produce a connected worker.
///
/// `events` must be subscribed before the worker can emit anything, so
/// the `ready` announcement is never lost to a subscription race.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, config: &Config, identifier: &str) -> LaunchFuture;
}

/// A freshly launched, not yet initialized worker.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub channel: IpcChannel,
    pub events: broadcast::Receiver<IpcEvent>,
    pub child: Option<Child>,
}

/// An initialized worker owned by a controller instance.
pub(crate) struct WorkerHandle {
    pub channel: IpcChannel,
    pub child: Option<Child>,
    /// Engine/runtime version metadata from the ready announcement.
    pub versions: Value,
}

/// Spawns the configured worker program as a child process.
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, config: &Config, identifier: &str) -> LaunchFuture {
        let config = config.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            let program = config.worker_program.clone().ok_or_else(|| {
                ControlError::Spawn {
                    detail: "no worker program configured".into(),
                }
            })?;

            let boot = serde_json::json!({
                "identifier": identifier,
                "switches": config.switches,
                "paths": config.paths,
                "loadTimeoutMs": config.load_timeout_ms,
                "show": config.show,
            });

            let mut command = Command::new(&program);
            command
                .arg(boot.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            for (key, value) in &config.env {
                command.env(key, value);
            }

            let mut child = command.spawn().map_err(|e| ControlError::Spawn {
                detail: format!("{}: {e}", program.display()),
            })?;
            let stdout = child.stdout.take().ok_or_else(|| ControlError::Spawn {
                detail: "worker stdout was not captured".into(),
            })?;
            let stdin = child.stdin.take().ok_or_else(|| ControlError::Spawn {
                detail: "worker stdin was not captured".into(),
            })?;
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_stderr(stderr));
            }

            tracing::info!(
                pid = child.id(),
                program = %program.display(),
                "spawned worker process"
            );

            let channel = IpcChannel::new(stdout, stdin);
            let events = channel.subscribe();
            Ok(LaunchedWorker {
                channel,
                events,
                child: Some(child),
            })
        })
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.to_ascii_lowercase().contains("error") {
            tracing::error!(target: "reverie::worker", "{line}");
        } else {
            tracing::debug!(target: "reverie::worker", "{line}");
        }
    }
}

/// Wait for the worker's `ready` announcement, then initialize it.
///
/// Returns the version metadata from the announcement. The worker is
/// not usable until `browser-initialize` has been acknowledged.
pub(crate) async fn ready_handshake(
    worker: &mut LaunchedWorker,
    config: &Config,
) -> Result<Value, ControlError> {
    let versions = loop {
        let event = tokio::select! {
            _ = worker.channel.closed() => {
                return Err(ControlError::WorkerDied {
                    message: "worker exited before announcing ready".into(),
                });
            }
            event = worker.events.recv() => event,
        };
        match event {
            Ok(event) if event.name == "ready" => {
                break event.payload.first().cloned().unwrap_or(Value::Null);
            }
            Ok(event) => {
                tracing::debug!(event = %event.name, "event before ready");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event stream lagged during handshake");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(ControlError::WorkerDied {
                    message: "worker event stream closed before ready".into(),
                });
            }
        }
    };

    tracing::debug!(%versions, "worker ready, initializing");
    let options = serde_json::to_value(config).map_err(|e| ControlError::Spawn {
        detail: format!("could not serialize worker options: {e}"),
    })?;
    worker
        .channel
        .call_wait("browser-initialize", vec![options])
        .await?;
    Ok(versions)
}

/// Tear down the worker: request a graceful quit, optionally kill, and
/// reap the child. Safe to call when the worker never started or the
/// transport already closed.
pub(crate) async fn end_worker(slot: &mut Option<WorkerHandle>, force_kill: bool) {
    let Some(mut handle) = slot.take() else {
        tracing::debug!("no worker to tear down");
        return;
    };

    if !handle.channel.is_closed() {
        let quit = handle.channel.call("quit", vec![]);
        if force_kill {
            if let Some(child) = handle.child.as_mut() {
                tracing::debug!("force-killing worker process");
                let _ = child.start_kill();
            }
        }
        if tokio::time::timeout(QUIT_GRACE, quit.wait()).await.is_err() {
            tracing::warn!("worker did not acknowledge quit in time");
        }
    }

    match handle.child.take() {
        Some(mut child) => match child.wait().await {
            Ok(status) => {
                let code = status.code();
                match exit_hint(code) {
                    Some(hint) => tracing::info!(?code, hint, "worker process exited"),
                    None => tracing::info!(?code, "worker process exited"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to reap worker process"),
        },
        None => {
            // Launcher-injected worker: just wait for the transport.
            if tokio::time::timeout(QUIT_GRACE, handle.channel.closed())
                .await
                .is_err()
            {
                tracing::warn!("worker transport did not close after quit");
            }
        }
    }
    handle.channel.close();
}

/// A human-readable hint for well-known worker exit codes.
pub(crate) fn exit_hint(code: Option<i32>) -> Option<&'static str> {
    match code? {
        0 => Some("success"),
        1 => Some("general error; the worker may be missing runtime dependencies"),
        126 => Some("the worker program is not executable"),
        127 => Some("the worker program was not found"),
        _ => None,
    }
}

// Process-wide teardown registry. One listener task serves every live
// instance; each instance holds a token that, once cancelled, drives
// its own teardown. Registration and deregistration are deterministic
// so instances never leak handlers.

static TEARDOWNS: OnceLock<Mutex<HashMap<Uuid, CancellationToken>>> = OnceLock::new();
static LISTENER_STARTED: AtomicBool = AtomicBool::new(false);

fn teardowns() -> MutexGuard<'static, HashMap<Uuid, CancellationToken>> {
    TEARDOWNS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register an instance for signal-driven teardown. Must be called from
/// within a runtime; the first registration starts the listener.
pub(crate) fn register_teardown(instance: Uuid) -> CancellationToken {
    if !LISTENER_STARTED.swap(true, Ordering::SeqCst) {
        tokio::spawn(signal_listener());
    }
    let token = CancellationToken::new();
    teardowns().insert(instance, token.clone());
    token
}

/// Remove an instance from the registry and release its watcher.
pub(crate) fn deregister_teardown(instance: Uuid) {
    if let Some(token) = teardowns().remove(&instance) {
        // Cancelling after removal only wakes this instance's own
        // watcher, which finds the instance already ended.
        token.cancel();
    }
}

fn cancel_all_registered() {
    let tokens: Vec<CancellationToken> = teardowns().values().cloned().collect();
    tracing::info!(instances = tokens.len(), "tearing down worker instances");
    for token in tokens {
        token.cancel();
    }
}

#[cfg(unix)]
async fn signal_listener() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "could not install signal handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "could not install signal handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "could not install signal handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "could not install signal handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("received SIGINT"),
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
            _ = hangup.recv() => tracing::info!("received SIGHUP"),
            _ = quit.recv() => tracing::info!("received SIGQUIT"),
        }
        cancel_all_registered();
    }
}

#[cfg(not(unix))]
async fn signal_listener() {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("could not install ctrl-c handler");
            return;
        }
        tracing::info!("received ctrl-c");
        cancel_all_registered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_hints_cover_spawn_failures() {
        assert_eq!(exit_hint(Some(0)), Some("success"));
        assert!(exit_hint(Some(127)).unwrap().contains("not found"));
        assert!(exit_hint(Some(126)).unwrap().contains("not executable"));
        assert!(exit_hint(Some(1)).unwrap().contains("dependencies"));
        assert_eq!(exit_hint(Some(42)), None);
        assert_eq!(exit_hint(None), None);
    }

    #[tokio::test]
    async fn teardown_registry_is_deterministic() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let token_a = register_teardown(a);
        let token_b = register_teardown(b);

        deregister_teardown(a);
        assert!(token_a.is_cancelled(), "deregistration releases the watcher");
        assert!(!token_b.is_cancelled(), "other instances are untouched");

        cancel_all_registered();
        assert!(token_b.is_cancelled());
        deregister_teardown(b);
    }

    #[tokio::test]
    async fn end_worker_with_empty_slot_is_a_no_op() {
        let mut slot: Option<WorkerHandle> = None;
        end_worker(&mut slot, true).await;
        assert!(slot.is_none());
    }
}
