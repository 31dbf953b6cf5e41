use chrono::TimeDelta;

use super::Context;
use crate::error::Result;
use crate::types::{Heartbeat, Node, NodeMetadata, NodeRegistration};

/// A node that has not reported within this window is offline.
pub const ONLINE_DURATION_THRESHOLD: TimeDelta = TimeDelta::minutes(1);
pub const DEFAULT_CONCURRENCY_LIMIT: i64 = 20;
pub const MAX_CONCURRENCY_LIMIT: i64 = 200;

/// Fleet membership, liveness and per-node concurrency budget.
pub struct NodeRegistry<'a> {
    ctx: Context<'a>,
}

impl<'a> NodeRegistry<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Upserts the node identified by the heartbeat's UUID.
    ///
    /// A different UUID reporting the same URLs gets its own row, which is
    /// how a replacement node takes over from the one it replaces.
    pub fn register_or_update(&self, heartbeat: &Heartbeat) -> Result<Node> {
        let now = self.ctx.clock.now();
        let registration = NodeRegistration {
            uuid: heartbeat.uuid,
            index_base_url: heartbeat.url.clone(),
            search_base_url: heartbeat
                .search_url
                .clone()
                .unwrap_or_else(|| heartbeat.url.clone()),
            last_seen_at: now,
            used_bytes: heartbeat.disk_used.max(0),
            total_bytes: heartbeat.disk_all.max(0),
            indexed_bytes: heartbeat.disk_indexed.max(0),
            metadata: NodeMetadata {
                name: heartbeat.name.clone(),
                task_count: heartbeat.task_count.max(0),
                concurrency: heartbeat.concurrency.max(0),
                concurrency_override: heartbeat.concurrency_override,
            },
        };

        let node = self.ctx.store.upsert_node(&registration, now)?;
        tracing::debug!(node_id = node.id, uuid = %node.uuid, "Node heartbeat");
        Ok(node)
    }

    /// Number of tasks the node may run at once, always within `1..=MAX_CONCURRENCY_LIMIT`.
    #[must_use]
    pub fn concurrency_limit(&self, node: &Node) -> i64 {
        if let Some(limit) = node.metadata.concurrency_override.filter(|o| *o > 0) {
            return limit.min(MAX_CONCURRENCY_LIMIT);
        }

        let concurrency = node.metadata.concurrency;
        if concurrency <= 0 {
            return DEFAULT_CONCURRENCY_LIMIT;
        }

        let scaled = (concurrency as f64 * self.ctx.settings.cpu_to_tasks_ratio).floor() as i64;
        scaled.clamp(1, MAX_CONCURRENCY_LIMIT)
    }

    #[must_use]
    pub fn is_online(&self, node: &Node) -> bool {
        node.last_seen_at >= self.ctx.clock.now() - ONLINE_DURATION_THRESHOLD
    }

    /// Always false when the lost-node threshold is disabled.
    #[must_use]
    pub fn is_lost(&self, node: &Node) -> bool {
        match self.ctx.settings.lost_node_threshold {
            Some(threshold) => node.last_seen_at < self.ctx.clock.now() - threshold,
            None => false,
        }
    }

    pub fn online_nodes(&self) -> Result<Vec<Node>> {
        self.ctx
            .store
            .list_nodes_seen_since(self.ctx.clock.now() - ONLINE_DURATION_THRESHOLD)
    }

    /// Online nodes that can answer searches for the project.
    pub fn searchable_nodes_for(&self, project_id: i64) -> Result<Vec<Node>> {
        self.ctx.store.list_nodes_with_ready_repository(
            project_id,
            self.ctx.clock.now() - ONLINE_DURATION_THRESHOLD,
        )
    }

    /// Deletes lost nodes along with everything placed on them.
    pub fn remove_lost_nodes(&self) -> Result<Vec<Node>> {
        let Some(threshold) = self.ctx.settings.lost_node_threshold else {
            return Ok(Vec::new());
        };

        let lost = self
            .ctx
            .store
            .list_nodes_seen_before(self.ctx.clock.now() - threshold)?;
        let mut removed = Vec::with_capacity(lost.len());
        for node in lost {
            if self.ctx.store.delete_node_cascade(node.id)? {
                tracing::warn!(
                    node_id = node.id,
                    uuid = %node.uuid,
                    last_seen_at = %node.last_seen_at,
                    "Removed lost node"
                );
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Updates the consecutive-failure counter behind task backoff.
    pub fn record_task_outcome(&self, node_id: i64, success: bool) -> Result<i32> {
        self.ctx.store.record_node_task_outcome(node_id, success)
    }
}
