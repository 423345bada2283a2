//! Ledger entry and transaction model
//!
//! Entries are immutable once written. Every mutation in the system becomes
//! a transaction of 0, 1, or 2 entries: a pure create is one CREDIT, a pure
//! delete one DEBIT, an update a DEBIT+CREDIT pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of actor originating a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    Agent,
    Service,
    System,
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorKind::User => write!(f, "user"),
            ActorKind::Agent => write!(f, "agent"),
            ActorKind::Service => write!(f, "service"),
            ActorKind::System => write!(f, "system"),
        }
    }
}

/// Originator of a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Actor kind
    pub kind: ActorKind,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Actor {
    /// The distinguished actor for daemon-initiated changes
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            name: "BuildNet Daemon".to_string(),
            kind: ActorKind::System,
            metadata: BTreeMap::new(),
        }
    }

    /// Create an actor of the given kind
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ActorKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            metadata: BTreeMap::new(),
        }
    }
}

/// Double-entry side of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Debit,
    Credit,
}

/// Coarse account categorization for reporting dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    BuildQueue,
    CompletedBuilds,
    WorkerPool,
    UserSessions,
    ConfigActive,
    SecurityEvents,
    SystemEvents,
}

impl AccountType {
    /// Stable mapping from entity type to account
    pub fn for_entity_type(entity_type: &str) -> Self {
        match entity_type {
            "build" => AccountType::BuildQueue,
            "build_result" => AccountType::CompletedBuilds,
            "worker" | "resource" => AccountType::WorkerPool,
            "session" | "activity" => AccountType::UserSessions,
            "config" => AccountType::ConfigActive,
            "security" => AccountType::SecurityEvents,
            _ => AccountType::SystemEvents,
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccountType::BuildQueue => "BUILD_QUEUE",
            AccountType::CompletedBuilds => "COMPLETED_BUILDS",
            AccountType::WorkerPool => "WORKER_POOL",
            AccountType::UserSessions => "USER_SESSIONS",
            AccountType::ConfigActive => "CONFIG_ACTIVE",
            AccountType::SecurityEvents => "SECURITY_EVENTS",
            AccountType::SystemEvents => "SYSTEM_EVENTS",
        };
        write!(f, "{}", name)
    }
}

/// Old/new pair for one changed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Classification of a change plus the per-field diff for updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeDelta {
    Create,
    Update { changes: BTreeMap<String, FieldChange> },
    Delete,
}

/// One immutable, hash-chained audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id
    pub entry_id: Uuid,
    /// Groups the entries of one logical mutation
    pub transaction_id: Uuid,
    /// Dense, monotonically increasing position in the whole ledger
    pub sequence_number: u64,
    /// DEBIT or CREDIT
    pub entry_type: EntryType,
    /// Reporting account
    pub account_type: AccountType,
    /// Kind of entity mutated (resource, session, build, ...)
    pub entity_type: String,
    /// Id of the entity mutated
    pub entity_id: String,
    /// State before the mutation (absent on create)
    pub previous_state: Option<Value>,
    /// State after the mutation (absent on delete)
    pub new_state: Option<Value>,
    /// Change classification and field diff
    pub delta: ChangeDelta,
    /// When the mutation happened
    pub timestamp: DateTime<Utc>,
    /// Who made the change
    pub actor: Actor,
    /// Human-readable reason
    pub reason: String,
    /// Ties related mutations together (e.g. one build's entries)
    pub correlation_id: Option<Uuid>,
    /// SHA-256 over the canonical serialization of every other field
    pub checksum: String,
    /// Checksum of the entry at `sequence_number - 1`
    pub previous_checksum: String,
}

/// Logical grouping of the entries produced by one `record_change`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub transaction_id: Uuid,
    pub entries: Vec<LedgerEntry>,
}
