use serde::Serialize;

use super::Context;
use crate::error::Result;
use crate::types::{Index, Node, WatermarkLevel};

pub const LOW_WATERMARK: f64 = 0.70;
pub const HIGH_WATERMARK: f64 = 0.75;
pub const CRITICAL_WATERMARK: f64 = 0.85;
/// Utilisation a resized reservation aims for.
pub const IDEAL_PERCENT_USED: f64 = 0.40;
pub const DEFAULT_RESERVED_STORAGE_BYTES: i64 = 10 * 1024 * 1024 * 1024;

/// A watermark level change applied by [`StorageAccountant::refresh_watermark_levels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatermarkTransition {
    pub index_id: i64,
    pub from: WatermarkLevel,
    pub to: WatermarkLevel,
}

/// Storage usage, free capacity and watermarks.
pub struct StorageAccountant<'a> {
    ctx: Context<'a>,
}

impl<'a> StorageAccountant<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Sets the index's used bytes to the total size of its ready repositories.
    pub fn update_used_storage(&self, index_id: i64) -> Result<i64> {
        self.ctx
            .store
            .recompute_index_used_storage(index_id, self.ctx.clock.now())
            .inspect_err(|e| {
                tracing::error!(
                    component = "storage_accountant",
                    index_id,
                    error = %e,
                    "Failed to update used storage"
                );
            })
    }

    /// Recomputes every index, `batch` rows per query. Stops at the first failure.
    pub fn update_all_used_storage(&self, batch: i64) -> Result<usize> {
        let mut after_id = 0;
        let mut updated = 0;
        loop {
            let indices = self.ctx.store.list_indices(after_id, batch)?;
            let Some(last) = indices.last() else {
                return Ok(updated);
            };
            after_id = last.id;

            for index in &indices {
                self.update_used_storage(index.id)?;
                updated += 1;
            }
        }
    }

    /// May be negative when the index outgrew its reservation.
    #[must_use]
    pub fn free_storage_bytes(index: &Index) -> i64 {
        index.reserved_storage_bytes - index.used_storage_bytes
    }

    /// Capacity on the node not yet promised to any index.
    pub fn unclaimed_storage_bytes(&self, node: &Node) -> Result<i64> {
        let reserved = self.ctx.store.sum_reserved_storage_for_node(node.id)?;
        Ok(node.total_bytes - node.used_bytes + node.indexed_bytes - reserved)
    }

    #[must_use]
    pub fn watermark_exceeded_low(index: &Index) -> bool {
        used_ratio(index) >= LOW_WATERMARK
    }

    #[must_use]
    pub fn watermark_exceeded_high(index: &Index) -> bool {
        used_ratio(index) >= HIGH_WATERMARK
    }

    #[must_use]
    pub fn watermark_exceeded_critical(index: &Index) -> bool {
        used_ratio(index) >= CRITICAL_WATERMARK
    }

    /// Level implied by the index's current numbers, ignoring the stored flag.
    #[must_use]
    pub fn watermark_level(index: &Index) -> WatermarkLevel {
        if Self::watermark_exceeded_critical(index) {
            WatermarkLevel::CriticalWatermarkExceeded
        } else if Self::watermark_exceeded_high(index) {
            WatermarkLevel::HighWatermarkExceeded
        } else if Self::watermark_exceeded_low(index) {
            WatermarkLevel::LowWatermarkExceeded
        } else {
            WatermarkLevel::Healthy
        }
    }

    /// Flags indices that crossed a threshold since the last pass and clears
    /// indices that dropped back under the low watermark.
    pub fn refresh_watermark_levels(&self, limit: i64) -> Result<Vec<WatermarkTransition>> {
        let mut transitions = Vec::new();
        let now = self.ctx.clock.now();

        // Most severe first, so an index jumping straight past several
        // thresholds is flagged once at its final level.
        for (level, ratio) in [
            (WatermarkLevel::CriticalWatermarkExceeded, CRITICAL_WATERMARK),
            (WatermarkLevel::HighWatermarkExceeded, HIGH_WATERMARK),
            (WatermarkLevel::LowWatermarkExceeded, LOW_WATERMARK),
        ] {
            for index in self
                .ctx
                .store
                .list_indices_needing_watermark(ratio, level, limit)?
            {
                self.ctx
                    .store
                    .set_index_watermark_level(index.id, level, now)?;
                tracing::warn!(
                    index_id = index.id,
                    node_id = index.zoekt_node_id,
                    used = index.used_storage_bytes,
                    reserved = index.reserved_storage_bytes,
                    level = %level,
                    "Index exceeded storage watermark"
                );
                transitions.push(WatermarkTransition {
                    index_id: index.id,
                    from: index.watermark_level,
                    to: level,
                });
            }
        }

        for index in self
            .ctx
            .store
            .list_indices_below_watermark(LOW_WATERMARK, limit)?
        {
            self.ctx
                .store
                .set_index_watermark_level(index.id, WatermarkLevel::Healthy, now)?;
            transitions.push(WatermarkTransition {
                index_id: index.id,
                from: index.watermark_level,
                to: WatermarkLevel::Healthy,
            });
        }

        Ok(transitions)
    }

    /// Grows the reservation towards `used / IDEAL_PERCENT_USED`, bounded by
    /// what the node has left unclaimed. Returns the new size when it changed.
    pub fn resize_reservation(&self, index: &Index) -> Result<Option<i64>> {
        let ideal = (index.used_storage_bytes as f64 / IDEAL_PERCENT_USED).ceil() as i64;
        let target = ideal
            .max(index.used_storage_bytes)
            .max(DEFAULT_RESERVED_STORAGE_BYTES);
        if target <= index.reserved_storage_bytes {
            return Ok(None);
        }

        let Some(node) = self.ctx.store.get_node(index.zoekt_node_id)? else {
            return Ok(None);
        };
        let headroom = self.unclaimed_storage_bytes(&node)?.max(0);
        let resized = target.min(index.reserved_storage_bytes + headroom);
        if resized <= index.reserved_storage_bytes {
            tracing::warn!(
                index_id = index.id,
                node_id = node.id,
                "No unclaimed storage left to grow index reservation"
            );
            return Ok(None);
        }

        self.ctx
            .store
            .set_index_reserved_storage(index.id, resized, self.ctx.clock.now())?;
        tracing::info!(
            index_id = index.id,
            from = index.reserved_storage_bytes,
            to = resized,
            "Resized index reservation"
        );
        Ok(Some(resized))
    }

    /// Resizes every index currently flagged above a watermark.
    pub fn resize_flagged_reservations(&self, batch: i64) -> Result<usize> {
        let mut after_id = 0;
        let mut resized = 0;
        loop {
            let indices = self.ctx.store.list_indices(after_id, batch)?;
            let Some(last) = indices.last() else {
                return Ok(resized);
            };
            after_id = last.id;

            for index in indices
                .iter()
                .filter(|i| i.watermark_level != WatermarkLevel::Healthy)
            {
                if self.resize_reservation(index)?.is_some() {
                    resized += 1;
                }
            }
        }
    }
}

fn used_ratio(index: &Index) -> f64 {
    if index.reserved_storage_bytes <= 0 {
        return if index.used_storage_bytes > 0 {
            f64::INFINITY
        } else {
            0.0
        };
    }
    index.used_storage_bytes as f64 / index.reserved_storage_bytes as f64
}
