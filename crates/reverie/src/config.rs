//! Instance configuration and its defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one worker instance.
///
/// All timeouts are in milliseconds on the wire; the accessor methods
/// hand out [`Duration`]s for the control loops. The whole struct is
/// serialized and passed to the worker during the `browser-initialize`
/// handshake, so the worker sees the same knobs the controller does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Ceiling for every wait operation.
    pub wait_timeout_ms: u64,
    /// Ceiling for page navigation.
    pub goto_timeout_ms: u64,
    /// Ceiling for one page-side evaluation.
    pub execution_timeout_ms: u64,
    /// Interval between wait-condition re-evaluations.
    pub poll_interval_ms: u64,
    /// Delay between simulated keystrokes.
    pub type_interval_ms: u64,
    /// How many times the worker may retry failed authentication.
    pub max_auth_retries: u32,
    /// Optional ceiling for full page load, separate from navigation.
    pub load_timeout_ms: Option<u64>,
    /// The worker program to spawn. Unset means the instance can only
    /// be driven through an injected launcher (tests).
    pub worker_program: Option<PathBuf>,
    /// Engine switches forwarded to the worker at spawn.
    pub switches: BTreeMap<String, String>,
    /// Path overrides forwarded to the worker at spawn.
    pub paths: BTreeMap<String, String>,
    /// Extra environment for the worker process.
    pub env: BTreeMap<String, String>,
    /// Whether the worker should show its rendering window.
    pub show: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 30_000,
            goto_timeout_ms: 30_000,
            execution_timeout_ms: 30_000,
            poll_interval_ms: 250,
            type_interval_ms: 100,
            max_auth_retries: 3,
            load_timeout_ms: None,
            worker_program: None,
            switches: BTreeMap::new(),
            paths: BTreeMap::new(),
            env: BTreeMap::new(),
            show: false,
        }
    }
}

impl Config {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn goto_timeout(&self) -> Duration {
        Duration::from_millis(self.goto_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn type_interval(&self) -> Duration {
        Duration::from_millis(self.type_interval_ms)
    }

    /// Flag combinations that are legal but usually mistakes.
    pub(crate) fn warn_on_suspect_timeouts(&self) {
        if let Some(load) = self.load_timeout_ms {
            if load < self.goto_timeout_ms {
                tracing::warn!(
                    load_timeout_ms = load,
                    goto_timeout_ms = self.goto_timeout_ms,
                    "load timeout is shorter than the navigation timeout; \
                     navigation may report failure before the page gives up loading"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.wait_timeout_ms, 30_000);
        assert_eq!(config.goto_timeout_ms, 30_000);
        assert_eq!(config.execution_timeout_ms, 30_000);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.type_interval_ms, 100);
        assert_eq!(config.max_auth_retries, 3);
        assert!(config.load_timeout_ms.is_none());
        assert!(!config.show);
    }

    #[test]
    fn serializes_camel_case_for_the_handshake() {
        let wire = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(wire["waitTimeoutMs"], 30_000);
        assert_eq!(wire["pollIntervalMs"], 250);
        assert_eq!(wire["maxAuthRetries"], 3);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "waitTimeoutMs": 5000,
        }))
        .unwrap();
        assert_eq!(config.wait_timeout_ms, 5000);
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[test]
    fn durations_reflect_milliseconds() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.wait_timeout(), Duration::from_secs(30));
    }
}
