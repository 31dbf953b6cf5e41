use chrono::TimeDelta;

use super::Context;
use crate::error::Result;
use crate::types::TaskPartition;

/// Age of the oldest task after which the active segment is rotated.
pub const PARTITION_DURATION: TimeDelta = TimeDelta::days(1);

/// Segment manager for the task log.
///
/// Tasks are appended to the newest attached segment. Older segments stop
/// receiving writes and are dropped once nothing in them is pending or
/// processing.
pub struct TaskPartitions<'a> {
    ctx: Context<'a>,
}

impl<'a> TaskPartitions<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// The segment accepting writes, created on first use.
    pub fn active(&self) -> Result<TaskPartition> {
        match self.ctx.store.active_task_partition()? {
            Some(partition) => Ok(partition),
            None => self.ctx.store.create_task_partition(self.ctx.clock.now()),
        }
    }

    /// Opens a new segment when the active one holds rows older than
    /// [`PARTITION_DURATION`].
    pub fn rotate(&self) -> Result<Option<TaskPartition>> {
        let now = self.ctx.clock.now();
        let active = self.active()?;
        let Some(oldest) = self.ctx.store.oldest_task_created_at(active.id)? else {
            return Ok(None);
        };
        if now - oldest <= PARTITION_DURATION {
            return Ok(None);
        }

        let partition = self.ctx.store.create_task_partition(now)?;
        tracing::info!(
            previous = active.id,
            partition_id = partition.id,
            "Rotated task partition"
        );
        Ok(Some(partition))
    }

    /// Drops every non-active segment with no in-flight tasks.
    pub fn detach_reclaimable(&self) -> Result<Vec<i64>> {
        let now = self.ctx.clock.now();
        let active = self.active()?;
        let mut detached = Vec::new();

        for partition in self.ctx.store.list_attached_task_partitions()? {
            if partition.id == active.id {
                continue;
            }
            if self.ctx.store.detach_task_partition(partition.id, now)? {
                tracing::info!(partition_id = partition.id, "Detached task partition");
                detached.push(partition.id);
            }
        }
        Ok(detached)
    }
}
