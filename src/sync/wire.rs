// sync/wire.rs - request/response DTOs for POST /sync/push and /sync/pull

use serde::{Deserialize, Serialize};

/// One outgoing change, as shipped in a push request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushChange {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    /// Deserialized entity snapshot, not a string.
    pub payload: serde_json::Value,
    pub priority: i64,
    pub created_at: String,
    pub retry_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub device_id: String,
    pub changes: Vec<PushChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResultItem {
    pub entity_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResponse {
    pub success_count: i64,
    pub failure_count: i64,
    pub results: Vec<PushResultItem>,
    pub new_checkpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequest {
    pub device_id: String,
    pub checkpoint: Option<String>,
}

/// One server-originated change. `entity_type` is one of `note`, `relation`,
/// `reflection`, `note_keyword`.
#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: DeltaOperation,
    pub data: Option<serde_json::Value>,
    pub updated_at: String,
    pub server_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOperation {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullResponse {
    pub has_more: bool,
    pub changes: Vec<Delta>,
    pub new_checkpoint: String,
    pub total_changes: i64,
}
