//! Plugging the mock worker into a controller.

use std::sync::{Arc, Mutex, MutexGuard};

use reverie::{Config, ControlError, LaunchFuture, LaunchedWorker, WorkerLauncher};
use serde_json::Value;

use crate::worker::{EvalOutcome, MockWorker, MockWorkerBuilder, RecordedCall, WorkerState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`WorkerLauncher`] that connects a [`MockWorker`] instead of
/// spawning a process. One launcher launches one worker.
pub struct MockLauncher {
    builder: Mutex<Option<MockWorkerBuilder>>,
    worker: Mutex<Option<MockWorker>>,
    state: Arc<WorkerState>,
}

impl MockLauncher {
    /// Build a launcher and the probe a test uses to watch the worker.
    pub fn new(mut builder: MockWorkerBuilder) -> (Arc<Self>, MockWorkerProbe) {
        let state = Arc::new(WorkerState::default());
        builder.drain_evals_into(&state);
        let launcher = Arc::new(Self {
            builder: Mutex::new(Some(builder)),
            worker: Mutex::new(None),
            state: Arc::clone(&state),
        });
        (launcher, MockWorkerProbe { state })
    }
}

impl WorkerLauncher for MockLauncher {
    fn launch(&self, _config: &Config, _identifier: &str) -> LaunchFuture {
        let builder = lock(&self.builder).take();
        let state = Arc::clone(&self.state);
        let result = builder.map(|builder| {
            let (worker, controller) = builder.finish(state);
            let events = controller.subscribe();
            worker.announce_ready();
            *lock(&self.worker) = Some(worker);
            LaunchedWorker {
                channel: controller,
                events,
                child: None,
            }
        });
        Box::pin(async move {
            result.ok_or_else(|| ControlError::Spawn {
                detail: "mock worker was already launched".into(),
            })
        })
    }
}

/// A test's view into the mock worker: what the controller called,
/// whether it quit, and hooks to script further behavior mid-test.
#[derive(Clone)]
pub struct MockWorkerProbe {
    state: Arc<WorkerState>,
}

impl MockWorkerProbe {
    /// Every call the controller has made, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls()
    }

    /// The call names in order, for shape assertions.
    pub fn call_names(&self) -> Vec<String> {
        self.state.calls().into_iter().map(|c| c.name).collect()
    }

    /// The recorded calls with the given name.
    pub fn calls_named(&self, name: &str) -> Vec<RecordedCall> {
        self.state
            .calls()
            .into_iter()
            .filter(|c| c.name == name)
            .collect()
    }

    /// Whether the controller asked the worker to quit.
    pub fn was_quit(&self) -> bool {
        self.state.was_quit()
    }

    /// Script the next `javascript` evaluation (appended to the queue).
    pub fn push_eval(&self, outcome: EvalOutcome) {
        self.state.push_eval(outcome);
    }

    /// Emit a named event toward the controller. Panics in tests that
    /// emit before the worker is launched.
    pub fn emit(&self, name: &str, payload: Vec<Value>) {
        match self.state.channel() {
            Some(channel) => channel.emit(name, payload),
            None => panic!("mock worker not launched yet"),
        }
    }

    /// Drop the transport, as a crashing worker process would.
    pub fn crash(&self) {
        if let Some(channel) = self.state.channel() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_hands_out_a_ready_worker() {
        let (launcher, probe) = MockLauncher::new(MockWorkerBuilder::new());
        let mut launched = launcher
            .launch(&Config::default(), "test-instance")
            .await
            .unwrap();

        let event = launched.events.recv().await.unwrap();
        assert_eq!(event.name, "ready");

        launched
            .channel
            .call_wait("browser-initialize", vec![])
            .await
            .unwrap();
        assert_eq!(probe.call_names(), vec!["browser-initialize"]);
    }

    #[tokio::test]
    async fn second_launch_fails() {
        let (launcher, _probe) = MockLauncher::new(MockWorkerBuilder::new());
        launcher
            .launch(&Config::default(), "one")
            .await
            .unwrap();
        let err = launcher
            .launch(&Config::default(), "two")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Spawn { .. }));
    }
}
