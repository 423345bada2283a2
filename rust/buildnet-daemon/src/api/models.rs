//! Request/response models for the HTTP adapter

use crate::orchestrate::BuildOptions;
use buildnet_ledger::EntryFilter;
use serde::{Deserialize, Serialize};

/// Error body returned by every failing operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// POST /builds
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBuildRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: BuildOptions,
}

/// DELETE /resources/:id query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoveResourceQuery {
    #[serde(default)]
    pub force: bool,
}

/// GET /ledger/entries query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerQuery {
    pub sequence_from: Option<u64>,
    pub sequence_to: Option<u64>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LedgerQuery {
    pub fn filter(&self) -> EntryFilter {
        EntryFilter {
            sequence_from: self.sequence_from,
            sequence_to: self.sequence_to,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            actor_id: self.actor_id.clone(),
            time_from: None,
            time_to: None,
        }
    }
}
