// rust/buildnet-ledger/src/lib.rs
// Double-entry audit ledger: hash-chained DEBIT/CREDIT pairs over a state backend

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod canonical;
pub mod delta;
pub mod entry;
pub mod ledger;
pub mod mirror;

pub use canonical::{canonical_string, checksum_of};
pub use delta::compute_delta;
pub use entry::{
    AccountType, Actor, ActorKind, ChangeDelta, EntryType, FieldChange, LedgerEntry,
    LedgerTransaction,
};
pub use ledger::{
    EntryFilter, IntegrityError, IntegrityErrorKind, IntegrityReport, Ledger, LedgerConfig,
    LedgerStats,
};
pub use mirror::LedgerMirror;

use buildnet_state::BackendError;
use thiserror::Error;

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger error types
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The state backend failed or timed out
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    /// The writer lease stayed busy past the retry limit
    #[error("Ledger writer lease unavailable after {attempts} attempts")]
    LeaseUnavailable { attempts: u32 },

    /// Startup recovery found a non-dense sequence; writes are refused
    #[error("Sequence gap detected: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    /// An entry could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Mirror file I/O failed
    #[error("Mirror error: {0}")]
    Mirror(String),
}
