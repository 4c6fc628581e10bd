//! Gate (C3).
//!
//! Pure decision function: given a triple, a POAV estimate, and flags,
//! decides {PASS, REWRITE, BLOCK} against a constitution snapshot. Ordered
//! rule evaluation, first match wins (§4.3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constitution::ConstitutionSnapshot;
use crate::sensor::Triple;

/// Decision outcome plus a structured reason (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Decision {
    Pass,
    Rewrite { reason: String },
    Block { reason: String },
}

impl Decision {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Pass => None,
            Decision::Rewrite { reason } | Decision::Block { reason } => Some(reason),
        }
    }
}

/// Everything the Gate needs beyond the triple and constitution (§4.3).
#[derive(Debug, Clone)]
pub struct GateInputs<'a> {
    pub triple: Triple,
    pub poav: f64,
    pub hallucination: f64,
    pub sensor_degraded: bool,
    /// Precomputed per-domain keyword-presence scores, used for P0
    /// evaluation (kept separate from `triple.r` since P0 rules key off
    /// individual domains, not the max-over-domains risk score).
    pub domain_presence: &'a HashMap<String, f64>,
}

/// Evaluate the ordered decision policy (§4.3 steps 1-4).
pub fn decide(inputs: &GateInputs, constitution: &ConstitutionSnapshot) -> Decision {
    // Step 1: P0 hard block, lexicographically smallest rule id wins.
    let fired = constitution.firing_p0_rules(inputs.domain_presence);
    if let Some(rule) = fired.first() {
        return Decision::Block {
            reason: format!("p0:{}", rule.rule_id),
        };
    }

    // Step 2: critical-threshold override (safety breaker).
    let risk_critical = inputs.triple.r >= constitution.thresholds.risk_critical;
    let halluc_critical = inputs.hallucination >= constitution.thresholds.halluc_critical;
    if risk_critical || halluc_critical {
        let reason = match (risk_critical, halluc_critical) {
            (true, true) => "critical:risk,hallucination".to_string(),
            (true, false) => "critical:risk".to_string(),
            (false, true) => "critical:hallucination".to_string(),
            (false, false) => unreachable!(),
        };
        return step4_tighten(
            Decision::Rewrite { reason },
            inputs,
            constitution,
        );
    }

    // Step 3: POAV band.
    let t = &constitution.thresholds;
    let banded = if inputs.poav >= t.poav_pass {
        Decision::Pass
    } else if inputs.poav >= t.poav_rewrite_floor {
        Decision::Rewrite {
            reason: "poav:band".to_string(),
        }
    } else {
        Decision::Block {
            reason: "poav:floor".to_string(),
        }
    };

    step4_tighten(banded, inputs, constitution)
}

/// Step 4: sensor-degraded tightening — promote REWRITE to BLOCK when
/// `R >= risk_critical / 2` and the sensor reported degraded operation.
fn step4_tighten(
    decision: Decision,
    inputs: &GateInputs,
    constitution: &ConstitutionSnapshot,
) -> Decision {
    if !inputs.sensor_degraded {
        return decision;
    }
    match decision {
        Decision::Rewrite { reason } if inputs.triple.r >= constitution.thresholds.risk_critical / 2.0 => {
            Decision::Block {
                reason: format!("sensor_degraded:{reason}"),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constitution::{PoavWeights, PolicyRule, Priority, RiskDomain, Thresholds};

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
            p0_rules: vec![
                PolicyRule {
                    rule_id: "harm".into(),
                    priority: Priority::P0,
                    domain: "harm".into(),
                    presence_floor: 0.5,
                },
                PolicyRule {
                    rule_id: "aaa_first".into(),
                    priority: Priority::P0,
                    domain: "harm".into(),
                    presence_floor: 0.5,
                },
            ],
            risk_domains: vec![RiskDomain {
                name: "harm".into(),
                keywords: vec!["bomb".into()],
                weight: 1.0,
            }],
            poav_weights: PoavWeights::default(),
            rewrite_budget_k: 3,
            rollback_limit_l: 3,
            fallback_text: "fallback".into(),
        }
    }

    fn empty_presence() -> HashMap<String, f64> {
        HashMap::new()
    }

    #[test]
    fn benign_greeting_passes() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.1, s: 0.0, r: 0.0 },
            poav: 0.95,
            hallucination: 0.0,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        assert_eq!(decide(&inputs, &snapshot()), Decision::Pass);
    }

    #[test]
    fn p0_hard_block_wins_regardless_of_poav() {
        let mut presence = HashMap::new();
        presence.insert("harm".to_string(), 0.9);
        let inputs = GateInputs {
            triple: Triple { t: 0.1, s: 0.0, r: 0.2 },
            poav: 0.99,
            hallucination: 0.0,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        let decision = decide(&inputs, &snapshot());
        assert!(matches!(decision, Decision::Block { .. }));
    }

    #[test]
    fn p0_tie_break_is_lexicographic() {
        let mut presence = HashMap::new();
        presence.insert("harm".to_string(), 0.9);
        let inputs = GateInputs {
            triple: Triple { t: 0.0, s: 0.0, r: 0.0 },
            poav: 0.5,
            hallucination: 0.0,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        let decision = decide(&inputs, &snapshot());
        assert_eq!(decision.reason(), Some("p0:aaa_first"));
    }

    #[test]
    fn critical_risk_overrides_high_poav() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.1, s: 0.1, r: 0.8 },
            poav: 0.77,
            hallucination: 0.0,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        let decision = decide(&inputs, &snapshot());
        assert_eq!(
            decision,
            Decision::Rewrite {
                reason: "critical:risk".to_string()
            }
        );
    }

    #[test]
    fn critical_both_fields_names_risk_then_hallucination() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.0, s: 0.0, r: 0.9 },
            poav: 0.0,
            hallucination: 0.9,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        let decision = decide(&inputs, &snapshot());
        assert_eq!(decision.reason(), Some("critical:risk,hallucination"));
    }

    #[test]
    fn poav_below_floor_blocks() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.0, s: 0.0, r: 0.0 },
            poav: 0.2,
            hallucination: 0.0,
            sensor_degraded: false,
            domain_presence: &presence,
        };
        assert!(matches!(decide(&inputs, &snapshot()), Decision::Block { .. }));
    }

    #[test]
    fn sensor_degraded_promotes_rewrite_to_block() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.0, s: 0.0, r: 0.4 },
            poav: 0.6,
            hallucination: 0.0,
            sensor_degraded: true,
            domain_presence: &presence,
        };
        // risk_critical / 2 == 0.375, r == 0.4 triggers tightening.
        let decision = decide(&inputs, &snapshot());
        assert!(matches!(decision, Decision::Block { .. }));
    }

    #[test]
    fn sensor_degraded_leaves_pass_untouched() {
        let presence = empty_presence();
        let inputs = GateInputs {
            triple: Triple { t: 0.0, s: 0.0, r: 0.0 },
            poav: 0.95,
            hallucination: 0.0,
            sensor_degraded: true,
            domain_presence: &presence,
        };
        assert_eq!(decide(&inputs, &snapshot()), Decision::Pass);
    }
}
