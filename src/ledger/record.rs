//! StepRecord: the immutable, hash-chained unit of the ledger (§3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::gate::Decision;
use crate::sensor::Triple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    IslandStart,
    IslandEnd,
    UserInput,
    Draft,
    Verify,
    GateDecision,
    Rollback,
    Fallback,
    Response,
}

/// One append-only, content-addressed record (§3).
///
/// Field order here matches §3's enumeration; the hash itself never
/// depends on struct field order or derive-generated serialization —
/// see [`canonical_payload_hash`], which always serializes `payload`
/// through `serde_json`'s `BTreeMap`-backed `Value`, not through the
/// containing struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub record_id: Uuid,
    pub island_id: Uuid,
    pub sequence_num: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub content_hash: String,
    pub previous_hash: String,
    pub constitution_version: u64,
    pub triple: Option<Triple>,
    pub poav: Option<f64>,
    pub decision: Option<Decision>,
}

/// `H(canonical(payload))` — SHA-256 over a sorted-key, whitespace-free
/// UTF-8 JSON encoding of the payload (§3, §6). `serde_json::Value`'s map
/// variant is a `BTreeMap` as long as the crate's `preserve_order` feature
/// is not enabled, which gives deterministic key ordering for free.
pub fn canonical_payload_hash(payload: &serde_json::Value) -> String {
    let canonical =
        serde_json::to_string(payload).expect("payload must be representable as JSON");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// `H(e[n-1].record_id || e[n-1].content_hash || e[n-1].timestamp)` —
/// the value the next record's `previous_hash` must equal (§4.6 hash
/// chain invariant).
pub fn core_hash(record_id: &Uuid, content_hash: &str, timestamp: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record_id.as_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

pub const GENESIS: &str = "genesis";

impl StepRecord {
    /// Build the `n`-th record of an island given the previous record's
    /// chain-relevant fields (`None` for the genesis record, `n = 0`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        island_id: Uuid,
        sequence_num: u64,
        timestamp: DateTime<Utc>,
        kind: RecordKind,
        payload: serde_json::Value,
        constitution_version: u64,
        triple: Option<Triple>,
        poav: Option<f64>,
        decision: Option<Decision>,
        previous: Option<(&Uuid, &str, &DateTime<Utc>)>,
    ) -> Self {
        let previous_hash = match previous {
            None => GENESIS.to_string(),
            Some((prev_id, prev_content_hash, prev_timestamp)) => {
                core_hash(prev_id, prev_content_hash, prev_timestamp)
            }
        };
        let content_hash = canonical_payload_hash(&payload);
        Self {
            record_id: Uuid::new_v4(),
            island_id,
            sequence_num,
            timestamp,
            kind,
            payload,
            content_hash,
            previous_hash,
            constitution_version,
            triple,
            poav,
            decision,
        }
    }
}

/// Recompute every `previous_hash` from scratch over an ordered record
/// slice (§4.6 `verify_chain`, §8 invariants 1, 2, 5). Shared by
/// [`crate::ledger::island::TimeIsland::verify_chain`] and by tests that
/// need to check an arbitrary (possibly tampered) record stream without
/// going through a live island.
pub fn verify_chain(records: &[StepRecord]) -> bool {
    for (i, record) in records.iter().enumerate() {
        if i == 0 {
            if record.previous_hash != GENESIS {
                return false;
            }
        } else {
            let prev = &records[i - 1];
            let expected = core_hash(&prev.record_id, &prev.content_hash, &prev.timestamp);
            if record.previous_hash != expected {
                return false;
            }
        }
        if record.sequence_num != i as u64 {
            return false;
        }
        if canonical_payload_hash(&record.payload) != record.content_hash {
            return false;
        }
    }
    true
}
