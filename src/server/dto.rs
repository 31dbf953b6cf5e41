use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::StorageAccountant;
use crate::types::{EnabledNamespace, Index, Node, Replica, TaskPayload, Token, WatermarkLevel};

#[derive(Debug, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub node_id: i64,
    pub pull_frequency_secs: u64,
    pub tasks: Vec<TaskPayload>,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    #[serde(flatten)]
    pub node: Node,
    pub online: bool,
    pub lost: bool,
    pub concurrency_limit: i64,
    pub unclaimed_storage_bytes: i64,
}

#[derive(Debug, Deserialize)]
pub struct EnableNamespaceRequest {
    pub root_namespace_id: i64,
    /// Falls back to `zoekt_default_number_of_replicas`.
    #[serde(default)]
    pub replicas: Option<u32>,
}

/// An index with the numbers derived from its storage columns.
#[derive(Debug, Serialize)]
pub struct IndexResponse {
    #[serde(flatten)]
    pub index: Index,
    pub free_storage_bytes: i64,
    pub current_watermark: WatermarkLevel,
}

impl From<Index> for IndexResponse {
    fn from(index: Index) -> Self {
        Self {
            free_storage_bytes: StorageAccountant::free_storage_bytes(&index),
            current_watermark: StorageAccountant::watermark_level(&index),
            index,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReplicaResponse {
    #[serde(flatten)]
    pub replica: Replica,
    pub indices: Vec<Index>,
}

#[derive(Debug, Serialize)]
pub struct EnabledNamespaceResponse {
    #[serde(flatten)]
    pub enabled_namespace: EnabledNamespace,
    pub replicas: Vec<ReplicaResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ReallocateRequest {
    pub from_node_id: i64,
    pub to_node_id: i64,
}

/// Settings to change, keyed by setting name.
pub type UpdateSettingsRequest = BTreeMap<String, String>;

#[derive(Debug, Deserialize)]
pub struct NamespaceMirrorRequest {
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectMirrorRequest {
    pub namespace_id: i64,
    pub root_namespace_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub metadata: Token,
}
