//! Drafter Adapter (C4).
//!
//! Submits a generation request to the external model, modulated by the
//! sensed triple. The adapter makes no determinism claim; the ledger
//! captures the exact prompt and parameters used (§4.4).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sensor::Triple;

/// Decoding parameters derived from `τ` (§4.4): higher tension pushes
/// toward more conservative decoding, higher drift toward more grounding
/// emphasis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Modulation {
    pub temperature: f64,
    pub grounding_emphasis: f64,
}

impl Modulation {
    pub fn from_triple(triple: &Triple) -> Self {
        Self {
            temperature: (1.0 - 0.6 * triple.t).clamp(0.1, 1.0),
            grounding_emphasis: triple.s.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRequest {
    pub prompt: String,
    pub context_window: Vec<String>,
    pub modulation: Modulation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftResponse {
    pub text: String,
    /// Upstream's own hallucination estimate, when exposed.
    pub hallucination_self: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum DrafterError {
    #[error("drafter timed out")]
    Timeout,
    #[error("drafter quota exhausted")]
    QuotaExhausted,
}

/// One production implementation calling out to a real model, one
/// in-memory stub for tests — the same async-trait-over-an-external-call
/// split used for the Verifier's embedder and for guardian signing
/// elsewhere in the corpus.
#[async_trait]
pub trait DrafterAdapter: Send + Sync {
    async fn draft(&self, request: DraftRequest) -> Result<DraftResponse, DrafterError>;
}

/// Deterministic, canned adapter for tests and local development.
pub struct EchoDrafter;

#[async_trait]
impl DrafterAdapter for EchoDrafter {
    async fn draft(&self, request: DraftRequest) -> Result<DraftResponse, DrafterError> {
        Ok(DraftResponse {
            text: format!("draft: {}", request.prompt),
            hallucination_self: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulation_lowers_temperature_with_tension() {
        let calm = Modulation::from_triple(&Triple { t: 0.0, s: 0.0, r: 0.0 });
        let tense = Modulation::from_triple(&Triple { t: 1.0, s: 0.0, r: 0.0 });
        assert!(tense.temperature < calm.temperature);
    }

    #[tokio::test]
    async fn echo_drafter_round_trips_prompt() {
        let drafter = EchoDrafter;
        let response = drafter
            .draft(DraftRequest {
                prompt: "hi".into(),
                context_window: vec![],
                modulation: Modulation::from_triple(&Triple { t: 0.0, s: 0.0, r: 0.0 }),
            })
            .await
            .unwrap();
        assert_eq!(response.text, "draft: hi");
    }
}
