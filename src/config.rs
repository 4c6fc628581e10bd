//! Startup configuration (§6 "Configuration knobs").
//!
//! Distinguishes knobs fixed at process start (endpoints, window length,
//! concurrency limits) from the ones that live inside the Constitution and
//! are hot-reloadable between utterances (thresholds, weights, budgets).

use serde::{Deserialize, Serialize};

/// Process-lifetime configuration, loadable from a struct literal or a
/// serde-deserialized file (grounded on a runtime-config struct elsewhere
/// in this crate's lineage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sliding window length, in turns, the Sensor and Verifier see as
    /// "recent island context" (§4.1).
    pub sensor_context_window: usize,
    /// Upper bound on outstanding drafter calls before `submit` rejects
    /// new utterances with a retriable error (§5 backpressure).
    pub max_outstanding_drafts: usize,
    /// Directory the ledger's per-island write-ahead logs live in.
    pub ledger_log_dir: String,
    /// Address of the drafting model endpoint. Opaque to this crate; the
    /// drafter adapter interprets it.
    pub drafter_endpoint: Option<String>,
    /// Address of the embedding provider endpoint. Opaque to this crate.
    pub embedder_endpoint: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sensor_context_window: 8,
            max_outstanding_drafts: 16,
            ledger_log_dir: "./ledger".to_string(),
            drafter_endpoint: None,
            embedder_endpoint: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.sensor_context_window > 0);
        assert!(cfg.max_outstanding_drafts > 0);
    }

    #[test]
    fn parses_from_json() {
        let json = r#"{
            "sensor_context_window": 4,
            "max_outstanding_drafts": 2,
            "ledger_log_dir": "/tmp/ledger",
            "drafter_endpoint": null,
            "embedder_endpoint": null
        }"#;
        let cfg = RuntimeConfig::from_json(json).unwrap();
        assert_eq!(cfg.sensor_context_window, 4);
    }
}
