use serde::Serialize;

use super::Context;
use crate::error::Result;

/// What one maintenance pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub lost_nodes_removed: usize,
    pub namespaces_expired: usize,
    pub namespaces_auto_enabled: usize,
    pub rollouts_retried: usize,
    pub indices_orphaned: usize,
    pub repositories_orphaned: usize,
    pub repository_deletes_queued: usize,
    pub index_jobs_processed: usize,
    pub stale_tasks_requeued: usize,
    pub indices_measured: usize,
    pub watermark_transitions: usize,
    pub reservations_resized: usize,
    pub reallocations_completed: usize,
    pub indices_deleted: usize,
    pub partition_rotated: bool,
    pub partitions_detached: usize,
}

/// The periodic sweep that keeps coordinator state converging.
pub struct Maintenance<'a> {
    ctx: Context<'a>,
    batch: i64,
}

impl<'a> Maintenance<'a> {
    pub fn new(ctx: Context<'a>, batch_size: usize) -> Self {
        Self {
            ctx,
            batch: i64::try_from(batch_size).unwrap_or(i64::MAX).max(1),
        }
    }

    /// Runs every step once, in dependency order. Stops at the first error.
    pub fn run_once(&self) -> Result<MaintenanceReport> {
        let ctx = self.ctx;
        let batch = self.batch;
        let planner = ctx.planner();

        let report = MaintenanceReport {
            lost_nodes_removed: ctx.nodes().remove_lost_nodes()?.len(),
            namespaces_expired: planner.sweep_expired_namespaces(batch)?,
            namespaces_auto_enabled: planner.auto_enable_namespaces(batch)?,
            rollouts_retried: planner.retry_failed_rollouts(batch)?,
            indices_orphaned: planner.mark_orphaned_indices(batch)?,
            repositories_orphaned: ctx.repositories().mark_orphaned_repositories(batch)?,
            repository_deletes_queued: ctx.repositories().cleanup_orphaned_repositories(batch)?,
            index_jobs_processed: planner.process_index_jobs(batch)?,
            stale_tasks_requeued: ctx.tasks().requeue_stale_tasks(batch)?,
            indices_measured: ctx.storage().update_all_used_storage(batch)?,
            watermark_transitions: ctx.storage().refresh_watermark_levels(batch)?.len(),
            reservations_resized: ctx.storage().resize_flagged_reservations(batch)?,
            reallocations_completed: {
                planner.refresh_index_states(batch)?;
                planner.complete_reallocations(batch)?
            },
            indices_deleted: planner.remove_deletable_indices(batch)?,
            partition_rotated: ctx.partitions().rotate()?.is_some(),
            partitions_detached: ctx.partitions().detach_reclaimable()?.len(),
        };

        tracing::debug!(?report, "Maintenance pass complete");
        Ok(report)
    }
}
