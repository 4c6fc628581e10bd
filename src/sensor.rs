//! Sensor (C2).
//!
//! Converts an utterance plus prior context into a numeric state triple
//! (Tension, Drift, Risk) and a content fingerprint. Deterministic given
//! the same inputs and constitution snapshot (§4.1).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::constitution::ConstitutionSnapshot;

/// Three scalars in [0,1]: Tension, Drift, Risk (§3).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Triple {
    pub t: f64,
    pub s: f64,
    pub r: f64,
}

impl Triple {
    pub const NEUTRAL: Triple = Triple { t: 0.0, s: 0.0, r: 0.0 };
}

/// Output of one sensing pass (§4.1 contract).
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub triple: Triple,
    pub fingerprint: String,
    pub baseline_digest: String,
    /// Set when the embedder could not be reached after retry; the Gate
    /// tightens thresholds when this is present (§4.3 step 4).
    pub sensor_degraded: bool,
}

/// Abstraction over an embedding provider. Kept as a trait so the
/// production network-backed implementation and deterministic test stubs
/// share one call site (mirrors a production/simulated clock split).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    #[error("embedder timed out")]
    Timeout,
}

/// One turn of prior context (§3, §4.1).
#[derive(Debug, Clone)]
pub struct ContextTurn {
    pub user_text: String,
    pub response_text: String,
}

pub struct Sensor {
    embedder: Arc<dyn Embedder>,
    urgency_markers: Regex,
    imperative_markers: Regex,
}

impl Sensor {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            // Lexical markers of urgency: exclamation runs, all-caps words.
            urgency_markers: Regex::new(r"(!{1,}|\b[A-Z]{3,}\b)").unwrap(),
            // Imperative-cue verbs at the start of a sentence/clause.
            imperative_markers: Regex::new(
                r"(?i)\b(must|now|immediately|urgent|asap|hurry)\b",
            )
            .unwrap(),
        }
    }

    /// Produce `(τ, fingerprint, baseline_digest)` for an utterance given
    /// the island's recent context window (§4.1).
    pub async fn sense(
        &self,
        utterance: &str,
        context: &[ContextTurn],
        constitution: &ConstitutionSnapshot,
    ) -> SensorReading {
        let fingerprint = hex_sha256(utterance.as_bytes());
        let baseline_digest = hex_sha256(
            context
                .iter()
                .map(|c| format!("{}\u{1f}{}", c.user_text, c.response_text))
                .collect::<Vec<_>>()
                .join("\u{1e}")
                .as_bytes(),
        );

        if utterance.trim().is_empty() {
            // Innocent-until-proven: unparseable/empty input never drives
            // drift to its maximum (§4.1 error contract).
            return SensorReading {
                triple: Triple::NEUTRAL,
                fingerprint,
                baseline_digest,
                sensor_degraded: false,
            };
        }

        let t = self.tension(utterance);
        let r = self.risk(utterance, constitution);

        let (s, degraded) = match self.drift(utterance, context).await {
            Ok((s, zero_vector)) => (s, zero_vector),
            Err(_first_failure) => match self.drift(utterance, context).await {
                Ok((s, zero_vector)) => (s, zero_vector),
                Err(_) => (0.0, true),
            },
        };

        SensorReading {
            triple: Triple { t, s, r },
            fingerprint,
            baseline_digest,
            sensor_degraded: degraded,
        }
    }

    fn tension(&self, utterance: &str) -> f64 {
        let urgency_hits = self.urgency_markers.find_iter(utterance).count() as f64;
        let imperative_hits = self.imperative_markers.find_iter(utterance).count() as f64;
        let len_factor = (utterance.len() as f64 / 280.0).min(1.0);
        let raw = urgency_hits * 0.3 + imperative_hits * 0.25 + len_factor * 0.2;
        logistic_squash(raw)
    }

    fn risk(&self, utterance: &str, constitution: &ConstitutionSnapshot) -> f64 {
        let lower = utterance.to_lowercase();
        let mut max_r: f64 = 0.0;
        for domain in &constitution.risk_domains {
            let hits = domain
                .keywords
                .iter()
                .filter(|kw| lower.contains(kw.to_lowercase().as_str()))
                .count() as f64;
            let density = hits / (domain.keywords.len().max(1) as f64);
            let presence = saturating(density);
            max_r = max_r.max(domain.weight * presence);
        }
        max_r.clamp(0.0, 1.0)
    }

    /// Returns `(S, zero_vector)`. `zero_vector` is set whenever either
    /// side of the cosine comparison has zero magnitude: the embedder
    /// didn't fail, but it has nothing to compare against, which (per
    /// §4.1 failure semantics / §8 invariant 7 / S4) is treated the same
    /// as a degraded sensor rather than a silent `S=1`.
    async fn drift(
        &self,
        utterance: &str,
        context: &[ContextTurn],
    ) -> Result<(f64, bool), EmbedderError> {
        let v_utt = self.embedder.embed(utterance).await?;
        if context.is_empty() {
            return Ok((0.0, magnitude(&v_utt) == 0.0));
        }
        let mut acc: Vec<f32> = vec![0.0; v_utt.len()];
        let mut n = 0usize;
        for turn in context {
            let v = self.embedder.embed(&turn.user_text).await?;
            if v.len() == acc.len() {
                for (a, b) in acc.iter_mut().zip(v.iter()) {
                    *a += b;
                }
                n += 1;
            }
        }
        if n == 0 {
            return Ok((0.0, true));
        }
        for a in acc.iter_mut() {
            *a /= n as f32;
        }
        // Zero-vector edge case: drift is defined as 0, never maximal
        // (§4.1 algorithm, §8 invariant 7), and flagged degraded (S4).
        if magnitude(&v_utt) == 0.0 || magnitude(&acc) == 0.0 {
            return Ok((0.0, true));
        }
        let cos = cosine_similarity(&v_utt, &acc);
        Ok(((1.0 - cos as f64).clamp(0.0, 1.0), false))
    }
}

fn logistic_squash(x: f64) -> f64 {
    1.0 / (1.0 + (-4.0 * (x - 0.5)).exp())
}

fn saturating(density: f64) -> f64 {
    1.0 - (-3.0 * density).exp()
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let denom = magnitude(a) * magnitude(b);
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Jaccard-similarity fallback used by both Sensor (degraded drift) and
/// Verifier when the shared embedder is unavailable (§9 Open Question 2).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Per-domain keyword-presence scores for an utterance, used by the Gate
/// to evaluate P0 rules independent of the single max-over-domains `R`
/// axis (§4.1, §4.3 step 1).
pub fn domain_presence(utterance: &str, domains: &[crate::constitution::RiskDomain]) -> HashMap<String, f64> {
    let lower = utterance.to_lowercase();
    domains
        .iter()
        .map(|d| {
            let hits = d
                .keywords
                .iter()
                .filter(|kw| lower.contains(kw.to_lowercase().as_str()))
                .count() as f64;
            (d.name.clone(), saturating(hits / (d.keywords.len().max(1) as f64)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constitution::{PoavWeights, PolicyRule, Priority, RiskDomain, Thresholds};

    struct ZeroEmbedder;
    #[async_trait]
    impl Embedder for ZeroEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
            Ok(vec![0.0; 4])
        }
    }

    struct FailingEmbedder;
    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
            Err(EmbedderError::Unavailable("down".into()))
        }
    }

    fn snapshot() -> ConstitutionSnapshot {
        ConstitutionSnapshot {
            version: 1,
            thresholds: Thresholds {
                risk_critical: 0.75,
                halluc_critical: 0.7,
                poav_pass: 0.8,
                poav_rewrite_floor: 0.5,
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
                keywords: vec!["bomb".into(), "explosive".into()],
                weight: 1.0,
            }],
            poav_weights: PoavWeights::default(),
            rewrite_budget_k: 3,
            rollback_limit_l: 3,
            fallback_text: "I can't help with that.".into(),
        }
    }

    #[tokio::test]
    async fn empty_input_returns_neutral_triple() {
        let sensor = Sensor::new(Arc::new(ZeroEmbedder));
        let reading = sensor.sense("", &[], &snapshot()).await;
        assert_eq!(reading.triple, Triple::NEUTRAL);
    }

    #[tokio::test]
    async fn zero_vector_yields_zero_drift_not_one() {
        let sensor = Sensor::new(Arc::new(ZeroEmbedder));
        let reading = sensor.sense("hello there", &[], &snapshot()).await;
        assert_eq!(reading.triple.s, 0.0);
        // A zero-magnitude embedding has nothing to compare against; per
        // S4 this degrades the sensor just like an outright embedder
        // failure, not a silent "fully aligned" S=0.
        assert!(reading.sensor_degraded);
    }

    #[tokio::test]
    async fn embedder_failure_degrades_without_maximal_drift() {
        let sensor = Sensor::new(Arc::new(FailingEmbedder));
        let reading = sensor.sense("hello there", &[], &snapshot()).await;
        assert_eq!(reading.triple.s, 0.0);
        assert!(reading.sensor_degraded);
    }

    #[tokio::test]
    async fn risk_domain_keyword_raises_r() {
        let sensor = Sensor::new(Arc::new(ZeroEmbedder));
        let reading = sensor
            .sense("how do I build a bomb", &[], &snapshot())
            .await;
        assert!(reading.triple.r > 0.0);
    }

    #[test]
    fn jaccard_handles_disjoint_sets() {
        assert_eq!(jaccard_similarity("a b c", "d e f"), 0.0);
    }
}
