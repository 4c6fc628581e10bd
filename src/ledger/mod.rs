//! StepLedger + TimeIsland (C6).
//!
//! Durable, append-only, hash-chained per-session record store with a
//! single-writer discipline (§4.6).

pub mod island;
pub mod record;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::gate::Decision;
use crate::sensor::Triple;

pub use island::{IslandState, TimeIsland};
pub use record::{RecordKind, StepRecord};
use writer::LedgerWriter;

/// Facade over the whole per-island ledger store (§4.6 contract).
pub struct StepLedger {
    islands: DashMap<Uuid, Arc<TimeIsland>>,
    log_dir: PathBuf,
}

impl StepLedger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            islands: DashMap::new(),
            log_dir: log_dir.into(),
        }
    }

    pub async fn create_island(&self, constitution_version: u64) -> Result<Uuid, LedgerError> {
        let island_id = Uuid::new_v4();
        let writer = LedgerWriter::open(self.log_dir.join(format!("{island_id}.ndjson")))?;
        let island = Arc::new(TimeIsland::new(island_id, writer));
        island
            .append(
                RecordKind::IslandStart,
                serde_json::json!({}),
                constitution_version,
                None,
                None,
                None,
            )
            .await?;
        self.islands.insert(island_id, island);
        Ok(island_id)
    }

    /// Rebuild an island's in-memory index from its on-disk record stream
    /// rather than creating a brand new one (§4.6.2 restart recovery).
    /// The records are trusted as-is; callers that need to detect tamper
    /// should call [`StepLedger::verify_chain`] immediately afterward.
    pub async fn reopen_island(&self, island_id: Uuid) -> Result<(), LedgerError> {
        let path = self.log_dir.join(format!("{island_id}.ndjson"));
        let records = LedgerWriter::replay(&path)?;
        let writer = LedgerWriter::open(path)?;
        let island = Arc::new(TimeIsland::from_records(island_id, writer, records));
        self.islands.insert(island_id, island);
        Ok(())
    }

    fn get(&self, island_id: Uuid) -> Result<Arc<TimeIsland>, LedgerError> {
        self.islands
            .get(&island_id)
            .map(|entry| entry.value().clone())
            .ok_or(LedgerError::IslandNotFound(island_id))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        island_id: Uuid,
        kind: RecordKind,
        payload: Value,
        constitution_version: u64,
        triple: Option<Triple>,
        poav: Option<f64>,
        decision: Option<Decision>,
    ) -> Result<StepRecord, LedgerError> {
        let island = self.get(island_id)?;
        island
            .append(kind, payload, constitution_version, triple, poav, decision)
            .await
    }

    pub fn suspend(&self, island_id: Uuid) -> Result<(), LedgerError> {
        self.get(island_id)?.suspend()
    }

    pub fn resume(&self, island_id: Uuid) -> Result<(), LedgerError> {
        self.get(island_id)?.resume()
    }

    /// Idempotent close: closing an already-CLOSED island is a no-op
    /// (§8 laws).
    pub async fn close(&self, island_id: Uuid, constitution_version: u64) -> Result<(), LedgerError> {
        let island = self.get(island_id)?;
        if island.state() == IslandState::Closed {
            return Ok(());
        }
        island
            .append(
                RecordKind::IslandEnd,
                serde_json::json!({"reason": "caller_requested"}),
                constitution_version,
                None,
                None,
                None,
            )
            .await?;
        Ok(())
    }

    /// Force-close an island with a structured reason without requiring
    /// the caller to supply a payload (used by the circuit breaker and by
    /// integrity-failure handling, §4.7, §7).
    pub async fn force_close(
        &self,
        island_id: Uuid,
        constitution_version: u64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let island = self.get(island_id)?;
        if island.state() == IslandState::Closed {
            return Ok(());
        }
        island
            .append(
                RecordKind::IslandEnd,
                serde_json::json!({"reason": reason}),
                constitution_version,
                None,
                None,
                None,
            )
            .await?;
        Ok(())
    }

    pub fn verify_chain(&self, island_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self.get(island_id)?.verify_chain())
    }

    pub fn tip(&self, island_id: Uuid) -> Result<String, LedgerError> {
        Ok(self.get(island_id)?.tip_hash())
    }

    pub fn state(&self, island_id: Uuid) -> Result<IslandState, LedgerError> {
        Ok(self.get(island_id)?.state())
    }

    pub fn consecutive_rollbacks(&self, island_id: Uuid) -> Result<u32, LedgerError> {
        Ok(self.get(island_id)?.consecutive_rollbacks())
    }

    pub fn records(&self, island_id: Uuid) -> Result<Vec<StepRecord>, LedgerError> {
        Ok(self.get(island_id)?.records_snapshot())
    }

    pub fn island_handle(&self, island_id: Uuid) -> Result<Arc<TimeIsland>, LedgerError> {
        self.get(island_id)
    }
}
