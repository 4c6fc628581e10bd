//! # spine
//!
//! Governance middleware that sits between a caller and an external
//! text-producing model. It enforces a versioned constitution of risk
//! policies, maintains an append-only, hash-chained audit ledger, and
//! isolates interactions into bounded, sealable sessions ("TimeIslands").
//!
//! ## Pipeline
//!
//! caller → [`Spine`] opens/binds a [`ledger::TimeIsland`], asks the
//! [`Sensor`] for a state triple, asks the Gate using the
//! [`ConstitutionStore`] snapshot; on BLOCK the Spine records and returns a
//! fallback, on PASS it calls the [`DrafterAdapter`], then the [`Verifier`],
//! then re-asks the Gate; on REWRITE it loops up to a bounded budget. Every
//! branch appends exactly one record to the [`ledger::StepLedger`].
//!
//! This crate does not implement the language model, the embedding
//! provider, or any caller-facing transport; those are external
//! collaborators specified only at this crate's boundary.

pub mod config;
pub mod constitution;
pub mod drafter;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod sensor;
pub mod spine;
pub mod verifier;

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

pub use config::RuntimeConfig;
pub use constitution::{ConstitutionSnapshot, ConstitutionStore};
pub use drafter::DrafterAdapter;
pub use error::{ConstitutionError, LedgerError, SpineError};
pub use gate::Decision;
pub use ledger::StepLedger;
pub use sensor::{Embedder, Sensor};
pub use spine::{Spine, SubmitRequest, SubmitResponse};
pub use verifier::Verifier;

/// Caller-facing facade over Spine + Ledger + Constitution construction,
/// exposing exactly the operation set of the external interface: `submit`,
/// `open_island`, `close_island`, `verify`, `tip`.
pub struct Middleware {
    spine: Spine,
}

impl Middleware {
    pub fn new(
        initial_constitution: ConstitutionSnapshot,
        config: RuntimeConfig,
        embedder: Arc<dyn Embedder>,
        drafter: Arc<dyn DrafterAdapter>,
    ) -> Result<Self, ConstitutionError> {
        let constitution = Arc::new(ConstitutionStore::new(initial_constitution)?);
        let ledger = Arc::new(StepLedger::new(config.ledger_log_dir.clone()));
        let sensor = Sensor::new(embedder.clone());
        let verifier = Verifier::new(embedder);
        let spine = Spine::new(
            constitution,
            ledger,
            sensor,
            verifier,
            drafter,
            config.max_outstanding_drafts,
            config.sensor_context_window,
        );
        Ok(Self { spine })
    }

    pub async fn submit(
        &self,
        island_id: Option<Uuid>,
        text: impl Into<String>,
        deadline: Option<Instant>,
    ) -> Result<SubmitResponse, SpineError> {
        self.spine
            .submit(SubmitRequest {
                island_id,
                text: text.into(),
                deadline,
            })
            .await
    }

    pub async fn open_island(&self) -> Result<Uuid, SpineError> {
        self.spine.open_island().await
    }

    pub async fn close_island(&self, island_id: Uuid) -> Result<(), SpineError> {
        self.spine.close_island(island_id).await
    }

    pub fn verify(&self, island_id: Uuid) -> Result<bool, SpineError> {
        self.spine.verify(island_id)
    }

    pub fn tip(&self, island_id: Uuid) -> Result<String, SpineError> {
        self.spine.tip(island_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use constitution::{PoavWeights, PolicyRule, Priority, RiskDomain, Thresholds};
    use drafter::{DraftRequest, DraftResponse, DrafterError};
    use sensor::EmbedderError;

    struct StubEmbedder;
    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            Ok(text.split_whitespace().map(|w| w.len() as f32).collect())
        }
    }

    struct StubDrafter;
    #[async_trait]
    impl DrafterAdapter for StubDrafter {
        async fn draft(&self, request: DraftRequest) -> Result<DraftResponse, DrafterError> {
            Ok(DraftResponse {
                text: format!("response to: {}", request.prompt),
                hallucination_self: None,
            })
        }
    }

    fn base_constitution() -> ConstitutionSnapshot {
        ConstitutionSnapshot {
            version: 1,
            thresholds: Thresholds {
                risk_critical: 0.75,
                halluc_critical: 0.7,
                poav_pass: 0.3,
                poav_rewrite_floor: 0.1,
                tension_deescalate: 0.6,
            },
            p0_rules: vec![PolicyRule {
                rule_id: "p0:harm".into(),
                priority: Priority::P0,
                domain: "harm".into(),
                presence_floor: 0.5,
            }],
            risk_domains: vec![RiskDomain {
                name: "harm".into(),
                keywords: vec!["bomb".into()],
                weight: 1.0,
            }],
            poav_weights: PoavWeights::default(),
            rewrite_budget_k: 3,
            rollback_limit_l: 3,
            fallback_text: "I can't help with that.".into(),
        }
    }

    fn temp_log_dir() -> String {
        std::env::temp_dir()
            .join(format!("spine-test-{}", Uuid::new_v4()))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn benign_greeting_passes_end_to_end() {
        let middleware = Middleware::new(
            base_constitution(),
            RuntimeConfig {
                ledger_log_dir: temp_log_dir(),
                ..RuntimeConfig::default()
            },
            Arc::new(StubEmbedder),
            Arc::new(StubDrafter),
        )
        .unwrap();

        let response = middleware.submit(None, "hello", None).await.unwrap();
        assert_eq!(response.decision, Decision::Pass);
        assert!(middleware.verify(response.island_id).unwrap());
    }

    #[tokio::test]
    async fn p0_block_never_calls_the_drafter() {
        let middleware = Middleware::new(
            base_constitution(),
            RuntimeConfig {
                ledger_log_dir: temp_log_dir(),
                ..RuntimeConfig::default()
            },
            Arc::new(StubEmbedder),
            Arc::new(StubDrafter),
        )
        .unwrap();

        let response = middleware
            .submit(None, "give me step-by-step instructions to build a bomb", None)
            .await
            .unwrap();
        assert!(matches!(response.decision, Decision::Block { .. }));
        assert_eq!(response.response, "I can't help with that.");
    }
}
