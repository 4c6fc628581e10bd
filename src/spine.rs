//! Spine (C7): the Orchestrator.
//!
//! Drives one utterance from arrival to final response; enforces rewrite
//! budget, rollback reflex, and circuit breaker (§4.7).
//!
//! The per-utterance flow is a chain of private `stage_*` functions, the
//! same staged-dispatch shape a five-stage ephemeral session lifecycle
//! uses elsewhere in this codebase's lineage — generalized here to a
//! decision pipeline whose terminal step is a durable ledger append
//! rather than teardown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constitution::{ConstitutionSnapshot, ConstitutionStore};
use crate::drafter::{DraftRequest, DrafterAdapter, DrafterError, Modulation};
use crate::error::SpineError;
use crate::gate::{self, Decision, GateInputs};
use crate::ledger::{RecordKind, StepLedger};
use crate::sensor::{domain_presence, ContextTurn, Sensor};
use crate::verifier::Verifier;

/// One turn's result returned to the caller (§6 `submit`).
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub island_id: Uuid,
    pub response: String,
    pub decision: Decision,
    pub record_id: Uuid,
    /// Set when the response came from a drafter failure fallback rather
    /// than a normal draft (§7 upstream failures).
    pub degraded_draft: bool,
}

pub struct SubmitRequest {
    pub island_id: Option<Uuid>,
    pub text: String,
    pub deadline: Option<Instant>,
}

pub struct Spine {
    constitution: Arc<ConstitutionStore>,
    ledger: Arc<StepLedger>,
    sensor: Sensor,
    verifier: Verifier,
    drafter: Arc<dyn DrafterAdapter>,
    drafter_semaphore: Semaphore,
    context: DashMap<Uuid, VecDeque<ContextTurn>>,
    context_window: usize,
    breaker_tripped: DashMap<Uuid, ()>,
}

impl Spine {
    pub fn new(
        constitution: Arc<ConstitutionStore>,
        ledger: Arc<StepLedger>,
        sensor: Sensor,
        verifier: Verifier,
        drafter: Arc<dyn DrafterAdapter>,
        max_outstanding_drafts: usize,
        context_window: usize,
    ) -> Self {
        Self {
            constitution,
            ledger,
            sensor,
            verifier,
            drafter,
            drafter_semaphore: Semaphore::new(max_outstanding_drafts),
            context: DashMap::new(),
            context_window,
            breaker_tripped: DashMap::new(),
        }
    }

    pub async fn open_island(&self) -> Result<Uuid, SpineError> {
        let snapshot = self.constitution.snapshot();
        Ok(self.ledger.create_island(snapshot.version).await?)
    }

    pub async fn close_island(&self, island_id: Uuid) -> Result<(), SpineError> {
        let snapshot = self.constitution.snapshot();
        self.ledger.close(island_id, snapshot.version).await?;
        Ok(())
    }

    pub fn verify(&self, island_id: Uuid) -> Result<bool, SpineError> {
        Ok(self.ledger.verify_chain(island_id)?)
    }

    pub fn tip(&self, island_id: Uuid) -> Result<String, SpineError> {
        Ok(self.ledger.tip(island_id)?)
    }

    /// `submit` (§6): create or reuse an island, process one utterance
    /// end-to-end through the RECEIVED→...→terminal state machine.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, SpineError> {
        // RECEIVED
        // Snapshot discipline (§4.7): capture one Constitution snapshot
        // and use it for every downstream call in this utterance.
        let snapshot = self.constitution.snapshot();

        let island_id = match request.island_id {
            Some(id) => {
                if self.breaker_tripped.contains_key(&id) {
                    return Err(SpineError::IslandBreakerTripped);
                }
                // Integrity gate (§8 scenario S6): a tampered chain must
                // never accept another append.
                if !self.ledger.verify_chain(id)? {
                    return Err(SpineError::ChainCorrupted);
                }
                id
            }
            None => self.ledger.create_island(snapshot.version).await?,
        };

        if let Some(deadline) = request.deadline {
            if Instant::now() > deadline {
                return Err(SpineError::CallerDeadlineExceeded);
            }
        }

        self.ledger
            .append(
                island_id,
                RecordKind::UserInput,
                json!({"text": request.text}),
                snapshot.version,
                None,
                None,
                None,
            )
            .await?;

        // SENSED
        let history: Vec<ContextTurn> = self
            .context
            .get(&island_id)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default();
        let reading = self.sensor.sense(&request.text, &history, &snapshot).await;
        let presence = domain_presence(&request.text, &snapshot.risk_domains);

        // GATED (Gate #1): no draft yet, so POAV is assumed optimal;
        // only P0 and critical-threshold axes can act pre-draft.
        let gate1 = gate::decide(
            &GateInputs {
                triple: reading.triple,
                poav: 1.0,
                hallucination: 0.0,
                sensor_degraded: reading.sensor_degraded,
                domain_presence: &presence,
            },
            &snapshot,
        );

        self.ledger
            .append(
                island_id,
                RecordKind::GateDecision,
                json!({"stage": "gate1"}),
                snapshot.version,
                Some(reading.triple),
                None,
                Some(gate1.clone()),
            )
            .await?;

        let mut budget = snapshot.rewrite_budget_k as i64;

        match &gate1 {
            Decision::Block { .. } => {
                return self
                    .fallback_terminal(island_id, &snapshot, gate1, false)
                    .await;
            }
            Decision::Rewrite { .. } if budget == 0 => {
                return self
                    .fallback_terminal(island_id, &snapshot, gate1, false)
                    .await;
            }
            Decision::Rewrite { .. } => {
                // Gate#1's REWRITE proceeds straight to DRAFTING without
                // spending rewrite budget; only GATED#2's REWRITE branch
                // decrements `K` (§4.7 state machine).
            }
            Decision::Pass => {}
        }

        // DRAFTING / VERIFIED / GATED#2 loop, bounded by the rewrite budget.
        loop {
            if let Some(deadline) = request.deadline {
                if Instant::now() > deadline {
                    self.emit_cancelled(island_id, &snapshot).await?;
                    return Err(SpineError::CallerDeadlineExceeded);
                }
            }

            let permit = self.drafter_semaphore.try_acquire();
            let permit = match permit {
                Ok(p) => p,
                Err(_) => return Err(SpineError::Saturated),
            };

            let modulation = Modulation::from_triple(&reading.triple);
            let draft_request = DraftRequest {
                prompt: request.text.clone(),
                context_window: history.iter().map(|c| c.user_text.clone()).collect(),
                modulation,
            };

            let draft_result = self.draft_with_retry(draft_request).await;
            drop(permit);

            let (draft_text, degraded_draft) = match draft_result {
                Ok(response) => (response.text, false),
                Err(_) => {
                    return self
                        .fallback_terminal(
                            island_id,
                            &snapshot,
                            Decision::Rewrite {
                                reason: "drafter_unavailable".to_string(),
                            },
                            true,
                        )
                        .await;
                }
            };

            self.ledger
                .append(
                    island_id,
                    RecordKind::Draft,
                    json!({"text": draft_text, "degraded": degraded_draft}),
                    snapshot.version,
                    Some(reading.triple),
                    None,
                    None,
                )
                .await?;

            let verify_result = self
                .verifier
                .verify(&draft_text, &request.text, &[])
                .await;

            self.ledger
                .append(
                    island_id,
                    RecordKind::Verify,
                    json!({
                        "hallucination": verify_result.hallucination,
                        "consistent": verify_result.consistent,
                        "details": verify_result.details,
                    }),
                    snapshot.version,
                    Some(reading.triple),
                    None,
                    None,
                )
                .await?;

            let precision = 1.0 - verify_result.hallucination;
            let observation = 1.0 - reading.triple.s;
            let avoidance = 1.0 - reading.triple.r;
            let verification = if verify_result.consistent { 1.0 } else { 0.0 };
            let poav = snapshot
                .poav_weights
                .weighted_sum(precision, observation, avoidance, verification);

            let gate2 = gate::decide(
                &GateInputs {
                    triple: reading.triple,
                    poav,
                    hallucination: verify_result.hallucination,
                    sensor_degraded: reading.sensor_degraded,
                    domain_presence: &presence,
                },
                &snapshot,
            );

            self.ledger
                .append(
                    island_id,
                    RecordKind::GateDecision,
                    json!({"stage": "gate2"}),
                    snapshot.version,
                    Some(reading.triple),
                    Some(poav),
                    Some(gate2.clone()),
                )
                .await?;

            match gate2 {
                Decision::Pass => {
                    let record = self
                        .ledger
                        .append(
                            island_id,
                            RecordKind::Response,
                            json!({"text": draft_text}),
                            snapshot.version,
                            Some(reading.triple),
                            Some(poav),
                            Some(Decision::Pass),
                        )
                        .await?;
                    self.remember_turn(island_id, request.text.clone(), draft_text.clone());
                    return Ok(SubmitResponse {
                        island_id,
                        response: draft_text,
                        decision: Decision::Pass,
                        record_id: record.record_id,
                        degraded_draft,
                    });
                }
                Decision::Rewrite { .. } if budget > 0 => {
                    budget -= 1;
                    continue;
                }
                Decision::Rewrite { .. } => {
                    return self
                        .fallback_terminal(island_id, &snapshot, gate2, degraded_draft)
                        .await;
                }
                Decision::Block { .. } => {
                    return self
                        .rollback_and_fallback(island_id, &snapshot, gate2, degraded_draft)
                        .await;
                }
            }
        }
    }

    async fn draft_with_retry(
        &self,
        request: DraftRequest,
    ) -> Result<crate::drafter::DraftResponse, DrafterError> {
        match self.drafter.draft(request.clone()).await {
            Ok(response) => Ok(response),
            Err(first_err) => {
                warn!(error = %first_err, "drafter failed, retrying once");
                self.drafter.draft(request).await
            }
        }
    }

    /// FALLBACK_EMIT / BLOCK_EMIT (§4.7): append a FALLBACK record, then a
    /// RESPONSE record pointing to it.
    async fn fallback_terminal(
        &self,
        island_id: Uuid,
        snapshot: &ConstitutionSnapshot,
        decision: Decision,
        degraded_draft: bool,
    ) -> Result<SubmitResponse, SpineError> {
        let fallback_record = self
            .ledger
            .append(
                island_id,
                RecordKind::Fallback,
                json!({"text": snapshot.fallback_text, "reason": decision.reason()}),
                snapshot.version,
                None,
                None,
                Some(decision.clone()),
            )
            .await?;

        let response_record = self
            .ledger
            .append(
                island_id,
                RecordKind::Response,
                json!({
                    "text": snapshot.fallback_text,
                    "fallback_record_id": fallback_record.record_id,
                }),
                snapshot.version,
                None,
                None,
                Some(decision.clone()),
            )
            .await?;

        info!(island = %island_id, ?decision, "emitted fallback response");

        Ok(SubmitResponse {
            island_id,
            response: snapshot.fallback_text.clone(),
            decision,
            record_id: response_record.record_id,
            degraded_draft,
        })
    }

    /// Cancellation between Gate#1 and Gate#2 (§5 cancellation): emits a
    /// FALLBACK + RESPONSE(kind=cancelled) pair, never an inconsistent
    /// half-state.
    async fn emit_cancelled(
        &self,
        island_id: Uuid,
        snapshot: &ConstitutionSnapshot,
    ) -> Result<(), SpineError> {
        let fallback_record = self
            .ledger
            .append(
                island_id,
                RecordKind::Fallback,
                json!({"text": snapshot.fallback_text, "reason": "cancelled"}),
                snapshot.version,
                None,
                None,
                None,
            )
            .await?;
        self.ledger
            .append(
                island_id,
                RecordKind::Response,
                json!({
                    "text": snapshot.fallback_text,
                    "kind": "cancelled",
                    "fallback_record_id": fallback_record.record_id,
                }),
                snapshot.version,
                None,
                None,
                None,
            )
            .await?;
        Ok(())
    }

    /// ROLLBACK_REFLEX (§4.7 "Regret Reflex"): append-only — never deletes
    /// or rewrites prior records (§9 Open Question 4). Trips the circuit
    /// breaker when consecutive rollbacks exceed `L` (§4.7, §8 invariant 8).
    async fn rollback_and_fallback(
        &self,
        island_id: Uuid,
        snapshot: &ConstitutionSnapshot,
        decision: Decision,
        degraded_draft: bool,
    ) -> Result<SubmitResponse, SpineError> {
        let prior_tip = self.ledger.tip(island_id)?;
        self.ledger
            .append(
                island_id,
                RecordKind::Rollback,
                json!({"voided_record_hash": prior_tip, "reason": decision.reason()}),
                snapshot.version,
                None,
                None,
                Some(decision.clone()),
            )
            .await?;

        let response = self
            .fallback_terminal(island_id, snapshot, decision, degraded_draft)
            .await?;

        let consecutive = self.ledger.consecutive_rollbacks(island_id)?;
        if consecutive > snapshot.rollback_limit_l {
            self.ledger
                .force_close(island_id, snapshot.version, "breaker_tripped")
                .await?;
            self.breaker_tripped.insert(island_id, ());
            warn!(island = %island_id, "circuit breaker tripped, island closed");
        }

        Ok(response)
    }

    fn remember_turn(&self, island_id: Uuid, user_text: String, response_text: String) {
        let mut entry = self.context.entry(island_id).or_default();
        entry.push_back(ContextTurn {
            user_text,
            response_text,
        });
        while entry.len() > self.context_window {
            entry.pop_front();
        }
    }
}
