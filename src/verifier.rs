//! Verifier (C5).
//!
//! Audits a draft against the constitution for hallucination/consistency;
//! may reduce POAV and force REWRITE (§4.5).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sensor::{jaccard_similarity, Embedder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    pub hallucination: f64,
    pub consistent: bool,
    pub details: String,
}

/// A claim the draft makes that should be traceable to either the
/// island's recent payloads or a declared external source (§4.5
/// citation/grounding check).
pub struct Claim<'a> {
    pub text: &'a str,
    pub anchored: bool,
}

pub struct Verifier {
    embedder: Arc<dyn Embedder>,
    consistency_weight: f64,
    grounding_weight: f64,
}

impl Verifier {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            consistency_weight: 0.6,
            grounding_weight: 0.4,
        }
    }

    pub async fn verify(
        &self,
        draft: &str,
        last_user_utterance: &str,
        claims: &[Claim<'_>],
    ) -> VerifyResult {
        let (consistency_score, used_fallback) =
            match self.embedding_consistency(draft, last_user_utterance).await {
                Some(score) => (score, false),
                None => (
                    jaccard_similarity(draft, last_user_utterance),
                    true,
                ),
            };

        let unanchored = claims.iter().filter(|c| !c.anchored).count();
        let grounding_penalty = if claims.is_empty() {
            0.0
        } else {
            unanchored as f64 / claims.len() as f64
        };

        let inconsistency = 1.0 - consistency_score;
        let hallucination = (self.consistency_weight * inconsistency
            + self.grounding_weight * grounding_penalty)
            .clamp(0.0, 1.0);

        let consistent = consistency_score >= 0.5 && unanchored == 0;

        VerifyResult {
            hallucination,
            consistent,
            details: if used_fallback {
                "consistency via jaccard fallback (embedder unavailable)".to_string()
            } else {
                "consistency via embedding cosine similarity".to_string()
            },
        }
    }

    async fn embedding_consistency(&self, draft: &str, last_user_utterance: &str) -> Option<f64> {
        let v_draft = self.embedder.embed(draft).await.ok()?;
        let v_user = self.embedder.embed(last_user_utterance).await.ok()?;
        let mag_draft: f32 = v_draft.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mag_user: f32 = v_user.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag_draft == 0.0 || mag_user == 0.0 {
            return Some(0.0);
        }
        let dot: f32 = v_draft.iter().zip(v_user.iter()).map(|(a, b)| a * b).sum();
        Some((dot / (mag_draft * mag_user)) as f64)
    }
}
