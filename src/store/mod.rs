mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

/// Repository tallies for one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryCounts {
    pub total: i64,
    pub ready: i64,
    pub failed: i64,
}

/// Position in the due-task ordering, used to page through `list_due_tasks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCursor {
    pub perform_at: DateTime<Utc>,
    pub id: i64,
}

/// Store defines the persistence interface.
///
/// Every invariant that must hold across concurrent coordinator processes is
/// enforced here (uniqueness, referential restriction, conditional updates)
/// rather than by the callers.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Settings
    fn list_settings(&self) -> Result<Vec<(String, String)>>;
    fn put_setting(&self, key: &str, value: &str) -> Result<()>;

    // Token operations
    fn create_token(&self, token: &Token) -> Result<()>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>>;
    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>>;
    fn delete_token(&self, id: &str) -> Result<bool>;
    fn update_token_last_used(&self, id: &str, now: DateTime<Utc>) -> Result<()>;
    fn has_admin_token(&self) -> Result<bool>;

    // Mirrored namespaces, projects and subscriptions
    fn upsert_namespace(&self, ns: &Namespace) -> Result<()>;
    fn get_namespace(&self, id: i64) -> Result<Option<Namespace>>;
    /// Root namespaces that have no enabled namespace yet.
    fn list_unindexed_root_namespaces(&self, limit: i64) -> Result<Vec<Namespace>>;
    fn upsert_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: i64) -> Result<Option<Project>>;
    fn delete_project(&self, id: i64) -> Result<bool>;
    fn list_projects_in_root_namespace(&self, root_namespace_id: i64) -> Result<Vec<Project>>;
    fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;

    // Node operations
    /// Inserts or updates the node with `registration.uuid`.
    fn upsert_node(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<Node>;
    fn get_node(&self, id: i64) -> Result<Option<Node>>;
    fn get_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>>;
    fn list_nodes(&self) -> Result<Vec<Node>>;
    fn list_nodes_seen_since(&self, since: DateTime<Utc>) -> Result<Vec<Node>>;
    fn list_nodes_seen_before(&self, before: DateTime<Utc>) -> Result<Vec<Node>>;
    /// Resets the consecutive failure counter on success, bumps it otherwise.
    fn record_node_task_outcome(&self, id: i64, success: bool) -> Result<i32>;
    /// Deletes a node with its tasks, its indices and their repositories.
    fn delete_node_cascade(&self, id: i64) -> Result<bool>;
    fn sum_reserved_storage_for_node(&self, node_id: i64) -> Result<i64>;
    /// Online nodes hosting a ready repository for the project.
    fn list_nodes_with_ready_repository(
        &self,
        project_id: i64,
        seen_since: DateTime<Utc>,
    ) -> Result<Vec<Node>>;

    // Enabled namespace operations
    /// Creates the enabled namespace and one replica per placement, atomically.
    fn create_enabled_namespace(
        &self,
        root_namespace_id: i64,
        placements: &[IndexPlacement],
        now: DateTime<Utc>,
    ) -> Result<(EnabledNamespace, Vec<(Replica, Index)>)>;
    /// Adds replicas to an existing enabled namespace, atomically.
    fn add_replicas(
        &self,
        enabled_namespace: &EnabledNamespace,
        placements: &[IndexPlacement],
        now: DateTime<Utc>,
    ) -> Result<Vec<(Replica, Index)>>;
    fn get_enabled_namespace_by_root(&self, root_namespace_id: i64)
    -> Result<Option<EnabledNamespace>>;
    fn list_enabled_namespaces(&self, after_id: i64, limit: i64) -> Result<Vec<EnabledNamespace>>;
    fn delete_enabled_namespace(&self, id: i64) -> Result<bool>;
    fn set_enabled_namespace_search(&self, id: i64, search: bool, now: DateTime<Utc>)
    -> Result<()>;
    fn set_rollout_failed_at(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()>;
    /// Enabled namespaces without replicas whose last rollout failed before `failed_before`.
    fn list_enabled_namespaces_awaiting_rollout(
        &self,
        failed_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EnabledNamespace>>;
    /// Enabled namespaces whose subscription ended before `ended_before`.
    fn list_expired_enabled_namespaces(
        &self,
        ended_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EnabledNamespace>>;

    // Replica operations
    fn get_replica(&self, id: i64) -> Result<Option<Replica>>;
    fn list_replicas(&self, enabled_namespace_id: i64) -> Result<Vec<Replica>>;
    fn set_replica_state(&self, id: i64, state: ReplicaState, now: DateTime<Utc>) -> Result<()>;

    // Index operations
    fn create_index(
        &self,
        replica: &Replica,
        placement: &IndexPlacement,
        now: DateTime<Utc>,
    ) -> Result<Index>;
    fn get_index(&self, id: i64) -> Result<Option<Index>>;
    fn list_indices(&self, after_id: i64, limit: i64) -> Result<Vec<Index>>;
    fn list_indices_for_replica(&self, replica_id: i64) -> Result<Vec<Index>>;
    fn list_indices_in_state(&self, state: IndexState, limit: i64) -> Result<Vec<Index>>;
    /// Indices whose replica or enabled namespace is gone and that are not yet orphaned.
    fn list_detached_indices(&self, limit: i64) -> Result<Vec<Index>>;
    /// Indices with `used >= ratio * reserved` whose level is below `level`.
    fn list_indices_needing_watermark(
        &self,
        ratio: f64,
        level: WatermarkLevel,
        limit: i64,
    ) -> Result<Vec<Index>>;
    /// Flagged indices whose usage fell below `ratio * reserved`.
    fn list_indices_below_watermark(&self, ratio: f64, limit: i64) -> Result<Vec<Index>>;
    fn set_index_state(&self, id: i64, state: IndexState, now: DateTime<Utc>) -> Result<()>;
    fn set_index_watermark_level(
        &self,
        id: i64,
        level: WatermarkLevel,
        now: DateTime<Utc>,
    ) -> Result<()>;
    fn set_index_reserved_storage(&self, id: i64, bytes: i64, now: DateTime<Utc>) -> Result<()>;
    /// Recomputes `used_storage_bytes` from ready repositories in one transaction.
    fn recompute_index_used_storage(&self, id: i64, now: DateTime<Utc>) -> Result<i64>;
    /// Fails with `Conflict` while the index still has repositories.
    fn delete_index(&self, id: i64) -> Result<bool>;
    fn count_repositories(&self, index_id: i64) -> Result<RepositoryCounts>;

    // Repository operations
    /// Returns the repository for (index, project), creating it as pending.
    /// Fails with `Validation` when another live index of the same replica already
    /// holds the project and neither index is reallocating.
    fn find_or_create_repository(
        &self,
        index: &Index,
        project_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Repository>;
    fn get_repository(&self, id: i64) -> Result<Option<Repository>>;
    fn get_repository_by_project(
        &self,
        index_id: i64,
        project_identifier: i64,
    ) -> Result<Option<Repository>>;
    fn list_repositories(&self, index_id: i64) -> Result<Vec<Repository>>;
    fn list_repositories_in_state(&self, state: RepositoryState, limit: i64)
    -> Result<Vec<Repository>>;
    /// Repositories whose project was deleted and that are not yet orphaned.
    fn list_repositories_missing_project(&self, limit: i64) -> Result<Vec<Repository>>;
    fn set_repository_state(&self, id: i64, state: RepositoryState, now: DateTime<Utc>)
    -> Result<()>;
    fn mark_repository_indexed(&self, id: i64, size_bytes: i64, now: DateTime<Utc>) -> Result<()>;
    fn delete_repository(&self, id: i64) -> Result<bool>;

    // Task operations
    /// Inserts a task unless a pending task with the same (repository, node, type) exists.
    fn insert_task(&self, task: &NewTask, partition_id: i64) -> Result<Option<Task>>;
    fn get_task(&self, id: i64) -> Result<Option<Task>>;
    /// Pending tasks with `perform_at <= now`, oldest first, strictly after `after`.
    fn list_due_tasks(
        &self,
        node_id: Option<i64>,
        now: DateTime<Utc>,
        after: Option<TaskCursor>,
        limit: i64,
    ) -> Result<Vec<Task>>;
    /// Moves a pending task to processing. Returns false when another caller won.
    fn claim_task(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;
    /// Moves a pending or processing task to `state`. False when it has already settled.
    fn settle_task(&self, id: i64, state: TaskState, now: DateTime<Utc>) -> Result<bool>;
    /// Moves a processing task to `state`. False when it is no longer processing.
    fn release_task(&self, id: i64, state: TaskState, now: DateTime<Utc>) -> Result<bool>;
    /// Returns a processing task to pending. False when it is no longer processing
    /// or when that would duplicate a pending task.
    fn reschedule_task(
        &self,
        id: i64,
        perform_at: DateTime<Utc>,
        retries_left: i32,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Marks pending tasks of a type for a repository as orphaned.
    fn orphan_pending_tasks(
        &self,
        repository_id: i64,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Result<usize>;
    fn list_processing_tasks_updated_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>>;
    fn count_tasks_for_node(&self, node_id: i64, state: TaskState) -> Result<i64>;
    fn list_tasks_for_repository(&self, repository_id: i64) -> Result<Vec<Task>>;

    // Task partition operations
    fn active_task_partition(&self) -> Result<Option<TaskPartition>>;
    fn create_task_partition(&self, now: DateTime<Utc>) -> Result<TaskPartition>;
    fn list_attached_task_partitions(&self) -> Result<Vec<TaskPartition>>;
    fn oldest_task_created_at(&self, partition_id: i64) -> Result<Option<DateTime<Utc>>>;
    /// Drops the partition's rows, only if none are pending or processing.
    fn detach_task_partition(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    // Index job operations
    fn create_index_job(
        &self,
        index_id: i64,
        kind: IndexJobKind,
        now: DateTime<Utc>,
    ) -> Result<IndexJob>;
    fn has_pending_index_job(&self, index_id: i64, kind: IndexJobKind) -> Result<bool>;
    fn list_pending_index_jobs(&self, limit: i64) -> Result<Vec<IndexJob>>;
    fn complete_index_job(&self, id: i64) -> Result<()>;

}
