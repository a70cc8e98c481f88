//! Wire protocol between store clients and the daemon.
//!
//! All frames are UTF-8 JSON sent as binary WebSocket messages, type-tagged
//! and camelCased like the record schema itself. Snapshots carry raw JSON
//! rows — the client validates them through `decode_records`, keeping the
//! boundary-validation responsibility on the client side where it also sits
//! for other store backends.

use serde::{Deserialize, Serialize};
use vellum_core::planner::MutationPlan;
use vellum_core::record::ProjectId;

/// Maximum message size (16MB) to prevent memory exhaustion from a
/// misbehaving client. Generous for a snapshot of a document project.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Open a live query on a project. The daemon answers with a `Snapshot`
    /// and keeps pushing one on every change until the connection closes.
    #[serde(rename_all = "camelCase")]
    Subscribe { project_id: ProjectId },

    /// Apply a mutation plan atomically. Answered with `BatchApplied` or
    /// `BatchRejected` carrying the same `batch_id`.
    #[serde(rename_all = "camelCase")]
    SubmitBatch {
        project_id: ProjectId,
        batch_id: u64,
        ops: MutationPlan,
    },
}

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full current record set for a subscribed project. Never a diff.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        project_id: ProjectId,
        files: Vec<serde_json::Value>,
    },

    /// The batch applied; subscribers will observe it as a new snapshot.
    #[serde(rename_all = "camelCase")]
    BatchApplied { batch_id: u64 },

    /// The batch was refused; nothing was applied.
    #[serde(rename_all = "camelCase")]
    BatchRejected { batch_id: u64, reason: String },
}

impl ClientMessage {
    /// Serialize to UTF-8 JSON bytes for a binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_binary(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

impl ServerMessage {
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ServerMessage serialization should not fail")
    }

    pub fn from_binary(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
