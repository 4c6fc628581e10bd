//! Crate-wide error types.
//!
//! Each concern owns a focused enum; [`SpineError`] is the boundary type
//! returned to callers (§6, §7) and composes the others via `From`.

use thiserror::Error;

/// Errors from the Constitution Store (§4.2).
#[derive(Error, Debug)]
pub enum ConstitutionError {
    #[error("threshold {name} out of range [0,1]: {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("P0 rule set is empty")]
    EmptyP0Rules,

    #[error("poav_pass ({poav_pass}) must be greater than poav_rewrite_floor ({poav_rewrite_floor})")]
    InvalidPoavBand {
        poav_pass: f64,
        poav_rewrite_floor: f64,
    },

    #[error("rewrite budget K must be >= 1, got {0}")]
    InvalidRewriteBudget(i64),

    #[error("rollback limit L must be >= 1, got {0}")]
    InvalidRollbackLimit(i64),

    #[error("constitution version must increase strictly: current={current}, candidate={candidate}")]
    NonMonotonicVersion { current: u64, candidate: u64 },

    #[error("failed to parse constitution document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors from the StepLedger / TimeIsland (§4.6).
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("island {0} is not active")]
    IslandNotActive(uuid::Uuid),

    #[error("island {0} hash chain is corrupted")]
    ChainCorrupted(uuid::Uuid),

    #[error("sequence gap in island {island}: expected {expected}, got {got}")]
    SequenceGap {
        island: uuid::Uuid,
        expected: u64,
        got: u64,
    },

    #[error("island {0} not found")]
    IslandNotFound(uuid::Uuid),

    #[error("io failure writing ledger: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize ledger record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced at the caller-facing boundary (§6, §7).
#[derive(Error, Debug)]
pub enum SpineError {
    #[error("island is not active")]
    IslandNotActive,

    #[error("island breaker has tripped; open a new island")]
    IslandBreakerTripped,

    #[error("caller deadline exceeded")]
    CallerDeadlineExceeded,

    #[error("drafter unavailable")]
    DrafterUnavailable,

    #[error("policy rejected: {reason}")]
    PolicyRejected { reason: String },

    #[error("ledger chain corrupted")]
    ChainCorrupted,

    #[error("backpressure: too many outstanding drafter calls")]
    Saturated,

    #[error(transparent)]
    Constitution(#[from] ConstitutionError),
}

impl From<LedgerError> for SpineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::IslandNotActive(_) | LedgerError::IslandNotFound(_) => {
                SpineError::IslandNotActive
            }
            LedgerError::ChainCorrupted(_) => SpineError::ChainCorrupted,
            LedgerError::SequenceGap { .. } => SpineError::ChainCorrupted,
            LedgerError::Io(_) | LedgerError::Serde(_) => SpineError::ChainCorrupted,
        }
    }
}

pub type Result<T, E = SpineError> = std::result::Result<T, E>;
