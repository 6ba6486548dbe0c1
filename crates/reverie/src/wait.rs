//! The wait engine.
//!
//! Three modes share one timing discipline:
//!
//! - a plain duration sleep, clamped to the configured ceiling (and
//!   reported as a timeout when the clamp fires);
//! - a selector wait, which is a predicate wait over an
//!   element-existence check;
//! - a predicate wait, which re-evaluates a page-side condition every
//!   poll interval until it is truthy.
//!
//! Predicate waits run two timers. The hard timer is the configured
//! ceiling and fails the wait. The soft timer, when present, *succeeds*
//! the wait early; its purpose is "give the page this long, then move
//! on either way". Both timers keep running while an evaluation is in
//! flight, so a slow page cannot stretch the wait past its bounds. An
//! evaluation result that arrives after the wait gave up is dropped
//! here, unobserved.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::error::ControlError;

/// Timing knobs for one predicate wait.
pub(crate) struct WaitSettings {
    /// Ceiling after which the wait fails.
    pub hard_timeout: Duration,
    /// Optional early-success bound.
    pub soft_timeout: Option<Duration>,
    /// Delay between evaluations.
    pub poll_interval: Duration,
    /// Selector to name in the timeout error, when this wait is a
    /// selector wait.
    pub selector: Option<String>,
}

impl WaitSettings {
    fn timeout_error(&self) -> ControlError {
        let waited_ms = self.hard_timeout.as_millis() as u64;
        match &self.selector {
            Some(selector) => ControlError::SelectorTimeout {
                selector: selector.clone(),
                waited_ms,
            },
            None => ControlError::WaitTimeout { waited_ms },
        }
    }
}

/// JavaScript truthiness over a JSON value.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Sleep for `requested`, clamped to `ceiling`. Sleeping the full
/// ceiling is reported as a timeout so over-long waits surface instead
/// of silently truncating.
pub(crate) async fn sleep_for(requested: Duration, ceiling: Duration) -> Result<(), ControlError> {
    if requested < ceiling {
        tokio::time::sleep(requested).await;
        Ok(())
    } else {
        tokio::time::sleep(ceiling).await;
        Err(ControlError::WaitTimeout {
            waited_ms: ceiling.as_millis() as u64,
        })
    }
}

/// Re-evaluate `eval` every poll interval until it yields a truthy
/// value, a timer fires, or an evaluation fails.
pub(crate) async fn wait_predicate<F, Fut>(
    settings: &WaitSettings,
    mut eval: F,
) -> Result<(), ControlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, ControlError>>,
{
    let hard = tokio::time::sleep(settings.hard_timeout);
    tokio::pin!(hard);
    let soft = async {
        match settings.soft_timeout {
            Some(bound) => tokio::time::sleep(bound).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(soft);

    loop {
        tokio::select! {
            _ = &mut hard => return Err(settings.timeout_error()),
            _ = &mut soft => {
                tracing::debug!("wait soft timeout reached, treating as satisfied");
                return Ok(());
            }
            outcome = eval() => match outcome {
                Ok(value) if is_truthy(&value) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            },
        }

        tokio::select! {
            _ = &mut hard => return Err(settings.timeout_error()),
            _ = &mut soft => return Ok(()),
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn settings(hard_ms: u64, soft_ms: Option<u64>) -> WaitSettings {
        WaitSettings {
            hard_timeout: Duration::from_millis(hard_ms),
            soft_timeout: soft_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(250),
            selector: None,
        }
    }

    #[test]
    fn truthiness_follows_javascript() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&Value::from(false)));
        assert!(!is_truthy(&Value::from(0)));
        assert!(!is_truthy(&Value::from("")));
        assert!(is_truthy(&Value::from(1)));
        assert!(is_truthy(&Value::from("no")));
        assert!(is_truthy(&serde_json::json!([])));
        assert!(is_truthy(&serde_json::json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn short_sleep_succeeds() {
        let start = Instant::now();
        sleep_for(Duration::from_millis(5_000), Duration::from_millis(30_000))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn over_ceiling_sleep_clamps_and_errors() {
        let start = Instant::now();
        let err = sleep_for(Duration::from_millis(40_000), Duration::from_millis(30_000))
            .await
            .unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_millis(30_000));
        assert!(matches!(
            err,
            ControlError::WaitTimeout { waited_ms: 30_000 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_polls_until_truthy() {
        let start = Instant::now();
        let evals = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&evals);

        wait_predicate(&settings(30_000, None), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Value::from(n >= 3)) }
        })
        .await
        .unwrap();

        // False three times, so three full poll intervals elapse.
        assert_eq!(evals.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_hard_timeout_fails() {
        let err = wait_predicate(&settings(1_000, None), || async { Ok(Value::from(false)) })
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::WaitTimeout { waited_ms: 1_000 }));
    }

    #[tokio::test(start_paused = true)]
    async fn selector_timeout_names_the_selector() {
        let mut s = settings(1_000, None);
        s.selector = Some("#missing".into());
        let err = wait_predicate(&s, || async { Ok(Value::from(false)) })
            .await
            .unwrap_err();
        match err {
            ControlError::SelectorTimeout { selector, waited_ms } => {
                assert_eq!(selector, "#missing");
                assert_eq!(waited_ms, 1_000);
            }
            other => panic!("expected SelectorTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_succeeds_before_hard() {
        let start = Instant::now();
        wait_predicate(&settings(30_000, Some(2_000)), || async {
            Ok(Value::from(false))
        })
        .await
        .unwrap();
        assert!(start.elapsed() <= Duration::from_millis(2_250));
    }

    #[tokio::test(start_paused = true)]
    async fn evaluation_error_fails_the_wait() {
        let err = wait_predicate(&settings(30_000, None), || async {
            Err(ControlError::WorkerDied {
                message: "gone".into(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ControlError::WorkerDied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_run_during_slow_evaluations() {
        // One evaluation that takes longer than the hard timeout: the
        // wait must still fail at the ceiling.
        let start = Instant::now();
        let err = wait_predicate(&settings(1_000, None), || async {
            tokio::time::sleep(Duration::from_millis(10_000)).await;
            Ok(Value::from(true))
        })
        .await
        .unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        assert!(matches!(err, ControlError::WaitTimeout { .. }));
    }
}
