//! Constitution Store (C1).
//!
//! Loads and versions policy: risk keywords, thresholds, priority levels
//! (P0..P4). Readers take a wait-free, atomically-swapped snapshot; writers
//! install a new snapshot only after validation succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::ConstitutionError;

/// Hard thresholds that gate decisions key off of (§3, §4.2, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub risk_critical: f64,
    pub halluc_critical: f64,
    pub poav_pass: f64,
    pub poav_rewrite_floor: f64,
    pub tension_deescalate: f64,
}

impl Thresholds {
    fn validate(&self) -> Result<(), ConstitutionError> {
        for (name, value) in [
            ("risk_critical", self.risk_critical),
            ("halluc_critical", self.halluc_critical),
            ("poav_pass", self.poav_pass),
            ("poav_rewrite_floor", self.poav_rewrite_floor),
            ("tension_deescalate", self.tension_deescalate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConstitutionError::ThresholdOutOfRange { name, value });
            }
        }
        if self.poav_pass <= self.poav_rewrite_floor {
            return Err(ConstitutionError::InvalidPoavBand {
                poav_pass: self.poav_pass,
                poav_rewrite_floor: self.poav_rewrite_floor,
            });
        }
        Ok(())
    }
}

/// Priority level assigned to a rule; P0 is a hard block regardless of
/// every other score (§4.3 step 1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

/// A single policy rule: a keyword/domain presence floor tagged with a
/// priority and a stable rule id (used for tie-breaking, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub rule_id: String,
    pub priority: Priority,
    pub domain: String,
    pub presence_floor: f64,
}

/// A risk domain: a keyword set and a weight contributing to `R` (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskDomain {
    pub name: String,
    pub keywords: Vec<String>,
    pub weight: f64,
}

/// Weights for the four POAV sub-scores; must sum to 1 (§3, §9 Open
/// Question 1 — these live in the Constitution, never baked into code).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoavWeights {
    pub precision: f64,
    pub observation: f64,
    pub avoidance: f64,
    pub verification: f64,
}

impl Default for PoavWeights {
    fn default() -> Self {
        Self {
            precision: 0.25,
            observation: 0.25,
            avoidance: 0.30,
            verification: 0.20,
        }
    }
}

impl PoavWeights {
    pub fn weighted_sum(&self, precision: f64, observation: f64, avoidance: f64, verification: f64) -> f64 {
        self.precision * precision
            + self.observation * observation
            + self.avoidance * avoidance
            + self.verification * verification
    }
}

/// An immutable, versioned policy bundle (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstitutionSnapshot {
    pub version: u64,
    pub thresholds: Thresholds,
    pub p0_rules: Vec<PolicyRule>,
    pub risk_domains: Vec<RiskDomain>,
    pub poav_weights: PoavWeights,
    pub rewrite_budget_k: u32,
    pub rollback_limit_l: u32,
    pub fallback_text: String,
}

impl ConstitutionSnapshot {
    fn validate(&self, previous_version: Option<u64>) -> Result<(), ConstitutionError> {
        self.thresholds.validate()?;
        if self.p0_rules.is_empty() {
            return Err(ConstitutionError::EmptyP0Rules);
        }
        if self.rewrite_budget_k < 1 {
            return Err(ConstitutionError::InvalidRewriteBudget(self.rewrite_budget_k as i64));
        }
        if self.rollback_limit_l < 1 {
            return Err(ConstitutionError::InvalidRollbackLimit(self.rollback_limit_l as i64));
        }
        if let Some(prev) = previous_version {
            if self.version <= prev {
                return Err(ConstitutionError::NonMonotonicVersion {
                    current: prev,
                    candidate: self.version,
                });
            }
        }
        Ok(())
    }

    /// Rule ids present whose domain's keyword presence (given precomputed
    /// per-domain presence scores) meets or exceeds its floor, sorted so
    /// that the lexicographically smallest id is first (§4.3 tie-break).
    pub fn firing_p0_rules(&self, domain_presence: &HashMap<String, f64>) -> Vec<&PolicyRule> {
        let mut fired: Vec<&PolicyRule> = self
            .p0_rules
            .iter()
            .filter(|rule| {
                domain_presence
                    .get(&rule.domain)
                    .copied()
                    .unwrap_or(0.0)
                    >= rule.presence_floor
            })
            .collect();
        fired.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        fired
    }
}

/// Atomically-swappable holder of the "latest" Constitution snapshot
/// (§4.2, §9). `snapshot()` is wait-free; reload is copy-on-write.
pub struct ConstitutionStore {
    current: ArcSwap<ConstitutionSnapshot>,
}

impl ConstitutionStore {
    pub fn new(initial: ConstitutionSnapshot) -> Result<Self, ConstitutionError> {
        initial.validate(None)?;
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
        })
    }

    /// Take a stable reference for the duration of one utterance (§4.7
    /// snapshot discipline: a mid-utterance reload must never be observed).
    pub fn snapshot(&self) -> Arc<ConstitutionSnapshot> {
        self.current.load_full()
    }

    /// Validate and install a new snapshot. On rejection the previous
    /// snapshot remains active and the error is returned.
    pub fn reload(&self, candidate: ConstitutionSnapshot) -> Result<(), ConstitutionError> {
        let previous_version = self.current.load().version;
        candidate.validate(Some(previous_version))?;
        self.current.store(Arc::new(candidate));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConstitutionSnapshot {
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
                keywords: vec!["bomb".into()],
                weight: 1.0,
            }],
            poav_weights: PoavWeights::default(),
            rewrite_budget_k: 3,
            rollback_limit_l: 3,
            fallback_text: "I can't help with that.".into(),
        }
    }

    #[test]
    fn accepts_valid_snapshot() {
        assert!(ConstitutionStore::new(base()).is_ok());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut c = base();
        c.thresholds.risk_critical = 1.5;
        assert!(matches!(
            ConstitutionStore::new(c),
            Err(ConstitutionError::ThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_empty_p0_rules() {
        let mut c = base();
        c.p0_rules.clear();
        assert!(matches!(
            ConstitutionStore::new(c),
            Err(ConstitutionError::EmptyP0Rules)
        ));
    }

    #[test]
    fn rejects_inverted_poav_band() {
        let mut c = base();
        c.thresholds.poav_pass = 0.3;
        c.thresholds.poav_rewrite_floor = 0.5;
        assert!(matches!(
            ConstitutionStore::new(c),
            Err(ConstitutionError::InvalidPoavBand { .. })
        ));
    }

    #[test]
    fn reload_keeps_previous_on_rejection() {
        let store = ConstitutionStore::new(base()).unwrap();
        let mut bad = base();
        bad.version = 2;
        bad.rewrite_budget_k = 0;
        assert!(store.reload(bad).is_err());
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn reload_rejects_non_monotonic_version() {
        let store = ConstitutionStore::new(base()).unwrap();
        let mut same_version = base();
        same_version.version = 1;
        assert!(matches!(
            store.reload(same_version),
            Err(ConstitutionError::NonMonotonicVersion { .. })
        ));
    }

    #[test]
    fn reload_accepts_higher_version() {
        let store = ConstitutionStore::new(base()).unwrap();
        let mut next = base();
        next.version = 2;
        store.reload(next).unwrap();
        assert_eq!(store.snapshot().version, 2);
    }

    #[test]
    fn p0_tie_break_picks_lexicographically_smallest() {
        let mut c = base();
        c.p0_rules.push(PolicyRule {
            rule_id: "p0:aaa".into(),
            priority: Priority::P0,
            domain: "harm".into(),
            presence_floor: 0.1,
        });
        let mut presence = HashMap::new();
        presence.insert("harm".to_string(), 0.9);
        let fired = c.firing_p0_rules(&presence);
        assert_eq!(fired[0].rule_id, "p0:aaa");
    }
}
