use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    IndexJobKind, IndexJobState, IndexState, ReplicaState, RepositoryState, TaskState, TaskType,
    WatermarkLevel,
};

/// Self-reported details of a node, stored alongside its disk statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    #[serde(default)]
    pub task_count: i64,
    #[serde(default)]
    pub concurrency: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_override: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub uuid: Uuid,
    pub index_base_url: String,
    pub search_base_url: String,
    pub last_seen_at: DateTime<Utc>,
    pub used_bytes: i64,
    pub total_bytes: i64,
    pub indexed_bytes: i64,
    pub metadata: NodeMetadata,
    /// Consecutive task failures reported by this node; drives pull backoff.
    pub task_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written on every heartbeat. Keyed by `uuid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    pub uuid: Uuid,
    pub index_base_url: String,
    pub search_base_url: String,
    pub last_seen_at: DateTime<Utc>,
    pub used_bytes: i64,
    pub total_bytes: i64,
    pub indexed_bytes: i64,
    pub metadata: NodeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledNamespace {
    pub id: i64,
    pub root_namespace_id: i64,
    /// Search traffic is served only once every replica is ready.
    pub search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rollout_failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub id: i64,
    pub zoekt_enabled_namespace_id: i64,
    pub namespace_id: i64,
    pub state: ReplicaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub id: i64,
    pub zoekt_node_id: i64,
    /// `None` once the replica has been destroyed.
    pub zoekt_replica_id: Option<i64>,
    /// `None` once the enabled namespace has been destroyed.
    pub zoekt_enabled_namespace_id: Option<i64>,
    pub namespace_id: i64,
    pub state: IndexState,
    pub watermark_level: WatermarkLevel,
    pub reserved_storage_bytes: i64,
    pub used_storage_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An index placement to be written as part of a namespace allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPlacement {
    pub zoekt_node_id: i64,
    pub state: IndexState,
    pub reserved_storage_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub zoekt_index_id: i64,
    /// `None` once the project is deleted; `project_identifier` keeps the id.
    pub project_id: Option<i64>,
    pub project_identifier: i64,
    pub state: RepositoryState,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub partition_id: i64,
    pub zoekt_node_id: i64,
    pub zoekt_repository_id: i64,
    pub project_identifier: i64,
    pub task_type: TaskType,
    pub state: TaskState,
    pub retries_left: i32,
    pub perform_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub zoekt_node_id: i64,
    pub zoekt_repository_id: i64,
    pub project_identifier: i64,
    pub task_type: TaskType,
    pub retries_left: i32,
    pub perform_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One time slice of the task log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPartition {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detached_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub id: i64,
    pub zoekt_index_id: i64,
    pub kind: IndexJobKind,
    pub state: IndexJobState,
    pub created_at: DateTime<Utc>,
}

/// Mirror of a namespace owned by the web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    pub name: String,
}

impl Namespace {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Mirror of a project owned by the web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub namespace_id: i64,
    pub root_namespace_id: i64,
}

/// Billing end date for a root namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub namespace_id: i64,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_lookup: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}
