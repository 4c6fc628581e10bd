//! TimeIsland: bounded, sealable session container (§3, §4.6).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::gate::Decision;
use crate::sensor::Triple;

use super::record::{RecordKind, StepRecord, GENESIS};
use super::writer::LedgerWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IslandState {
    Active,
    Suspended,
    Closed,
}

#[derive(Clone)]
struct Tip {
    record_id: Uuid,
    content_hash: String,
    timestamp: DateTime<Utc>,
}

/// A record fsyncs at a boundary when it starts/ends the island's durable
/// window, or before a BLOCK record, since that decision is irrecoverable
/// and must survive a crash right after it's returned to the caller
/// (§4.6 durability).
fn requires_fsync(kind: RecordKind, decision: &Option<Decision>) -> bool {
    matches!(kind, RecordKind::IslandStart | RecordKind::IslandEnd)
        || matches!(decision, Some(Decision::Block { .. }))
}

/// One island's mutable state. Bookkeeping (`state`, `tip`, sequence
/// counter) sits behind fast `parking_lot` locks for readers like `tip()`;
/// the actual append — which suspends on durable I/O — is serialized by a
/// `tokio::sync::Mutex` held for the duration of the write, giving the
/// single-writer-per-island discipline §4.6/§5 require without blocking
/// other islands or blocking synchronous tip/state reads mid-write.
pub struct TimeIsland {
    pub island_id: Uuid,
    pub created_at: DateTime<Utc>,
    state: Mutex<IslandState>,
    tip: Mutex<Option<Tip>>,
    next_sequence: Mutex<u64>,
    records: Mutex<Vec<StepRecord>>,
    consecutive_rollbacks: Mutex<u32>,
    write_lock: AsyncMutex<()>,
    writer: LedgerWriter,
}

impl TimeIsland {
    pub fn new(island_id: Uuid, writer: LedgerWriter) -> Self {
        Self {
            island_id,
            created_at: Utc::now(),
            state: Mutex::new(IslandState::Active),
            tip: Mutex::new(None),
            next_sequence: Mutex::new(0),
            records: Mutex::new(Vec::new()),
            consecutive_rollbacks: Mutex::new(0),
            write_lock: AsyncMutex::new(()),
            writer,
        }
    }

    /// Rebuild an island's in-memory index from its durable record stream
    /// (§4.6.2: "the WAL file is the durable source of truth replayed to
    /// rebuild the index on restart"). Does not re-derive SUSPENDED, since
    /// that transition is never itself durably logged; a replayed island
    /// that was suspended before the process stopped comes back ACTIVE.
    pub fn from_records(island_id: Uuid, writer: LedgerWriter, records: Vec<StepRecord>) -> Self {
        let mut consecutive_rollbacks = 0u32;
        for record in &records {
            if record.kind == RecordKind::Rollback {
                consecutive_rollbacks += 1;
            } else if record.kind == RecordKind::Response
                && matches!(record.decision, Some(Decision::Pass))
            {
                consecutive_rollbacks = 0;
            }
        }

        let state = match records.last() {
            Some(r) if r.kind == RecordKind::IslandEnd => IslandState::Closed,
            _ => IslandState::Active,
        };

        let tip = records.last().map(|r| Tip {
            record_id: r.record_id,
            content_hash: r.content_hash.clone(),
            timestamp: r.timestamp,
        });

        let created_at = records.first().map(|r| r.timestamp).unwrap_or_else(Utc::now);

        Self {
            island_id,
            created_at,
            state: Mutex::new(state),
            next_sequence: Mutex::new(records.len() as u64),
            tip: Mutex::new(tip),
            consecutive_rollbacks: Mutex::new(consecutive_rollbacks),
            records: Mutex::new(records),
            write_lock: AsyncMutex::new(()),
            writer,
        }
    }

    pub fn state(&self) -> IslandState {
        *self.state.lock()
    }

    /// Whether a record of `kind` may be appended while the island is in
    /// `state`. ACTIVE accepts anything; SUSPENDED accepts only the
    /// terminal `IslandEnd` write, matching §4.6's state machine
    /// (`SUSPENDED --close--> CLOSED` alongside `ACTIVE --close--> CLOSED`);
    /// CLOSED is terminal and accepts nothing.
    fn appendable(state: IslandState, kind: RecordKind) -> bool {
        match state {
            IslandState::Active => true,
            IslandState::Suspended => kind == RecordKind::IslandEnd,
            IslandState::Closed => false,
        }
    }

    /// Current island hash: the content_hash of the last appended record,
    /// or `"genesis"` if the island has no records yet (§4.6 `tip()`).
    pub fn tip_hash(&self) -> String {
        match &*self.tip.lock() {
            Some(t) => t.content_hash.clone(),
            None => GENESIS.to_string(),
        }
    }

    pub fn consecutive_rollbacks(&self) -> u32 {
        *self.consecutive_rollbacks.lock()
    }

    pub fn records_snapshot(&self) -> Vec<StepRecord> {
        self.records.lock().clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        kind: RecordKind,
        payload: serde_json::Value,
        constitution_version: u64,
        triple: Option<Triple>,
        poav: Option<f64>,
        decision: Option<Decision>,
    ) -> Result<StepRecord, LedgerError> {
        if !Self::appendable(self.state(), kind) {
            return Err(LedgerError::IslandNotActive(self.island_id));
        }

        let _guard = self.write_lock.lock().await;

        // Re-check under the write lock: a concurrent suspend/close could
        // have landed between the fast check above and acquiring the
        // exclusive writer slot.
        if !Self::appendable(self.state(), kind) {
            return Err(LedgerError::IslandNotActive(self.island_id));
        }

        let sequence_num = *self.next_sequence.lock();
        let previous = self.tip.lock().clone();
        // Weakly monotonic timestamp: never earlier than the previous record.
        let mut timestamp = Utc::now();
        if let Some(prev) = &previous {
            if timestamp < prev.timestamp {
                timestamp = prev.timestamp;
            }
        }

        let previous_tuple = previous
            .as_ref()
            .map(|p| (&p.record_id, p.content_hash.as_str(), &p.timestamp));

        let record = StepRecord::new(
            self.island_id,
            sequence_num,
            timestamp,
            kind,
            payload,
            constitution_version,
            triple,
            poav,
            decision,
        previous_tuple,
        );

        self.writer
            .append(&record, requires_fsync(kind, &record.decision))
            .await?;

        *self.next_sequence.lock() = sequence_num + 1;
        *self.tip.lock() = Some(Tip {
            record_id: record.record_id,
            content_hash: record.content_hash.clone(),
            timestamp: record.timestamp,
        });
        self.records.lock().push(record.clone());

        // Only a genuinely successful turn clears the streak: the RESPONSE
        // record that closes out a fallback/rollback path carries that
        // same non-PASS decision, so it must not reset the counter the
        // ROLLBACK record right before it just incremented (§4.7 circuit
        // breaker, §8 scenario S5).
        if kind == RecordKind::Rollback {
            *self.consecutive_rollbacks.lock() += 1;
        } else if kind == RecordKind::Response
            && matches!(record.decision, Some(Decision::Pass))
        {
            *self.consecutive_rollbacks.lock() = 0;
        }

        if kind == RecordKind::IslandEnd {
            *self.state.lock() = IslandState::Closed;
        }

        Ok(record)
    }

    pub fn suspend(&self) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        match *state {
            IslandState::Active => {
                *state = IslandState::Suspended;
                Ok(())
            }
            IslandState::Suspended => Ok(()),
            IslandState::Closed => Err(LedgerError::IslandNotActive(self.island_id)),
        }
    }

    pub fn resume(&self) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        match *state {
            IslandState::Suspended => {
                *state = IslandState::Active;
                Ok(())
            }
            IslandState::Active => Ok(()),
            IslandState::Closed => Err(LedgerError::IslandNotActive(self.island_id)),
        }
    }

    /// Mark the island terminally closed. Unlike `append`, this does not
    /// itself write an `IslandEnd` record — callers append one first via
    /// [`TimeIsland::append`], which transitions the state as a side
    /// effect; this method exists for the idempotent direct-close path
    /// (`close()` on an already-CLOSED island is a no-op, §8 laws).
    pub fn mark_closed(&self) {
        *self.state.lock() = IslandState::Closed;
    }

    /// Recompute every `previous_hash` from scratch (§4.6 `verify_chain`).
    pub fn verify_chain(&self) -> bool {
        super::record::verify_chain(&self.records.lock())
    }
}
