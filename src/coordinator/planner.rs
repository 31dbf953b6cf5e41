use super::storage::DEFAULT_RESERVED_STORAGE_BYTES;
use super::{Context, EnqueueOutcome};
use crate::error::{Error, Result};
use crate::types::{
    EnabledNamespace, Index, IndexJobKind, IndexPlacement, IndexState, Replica, ReplicaState,
    TaskType,
};

/// Maps enabled namespaces onto replicas and replicas onto node indices.
pub struct ShardPlanner<'a> {
    ctx: Context<'a>,
}

impl<'a> ShardPlanner<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Enables search for a root namespace with `replica_count` replicas,
    /// each placed on a different online node.
    pub fn enable_namespace(
        &self,
        root_namespace_id: i64,
        replica_count: u32,
    ) -> Result<(EnabledNamespace, Vec<(Replica, Index)>)> {
        let namespace = self
            .ctx
            .store
            .get_namespace(root_namespace_id)?
            .ok_or_else(|| {
                Error::validation(format!("namespace {root_namespace_id} does not exist"))
            })?;
        if !namespace.is_root() {
            return Err(Error::validation(format!(
                "namespace {} is not a root namespace",
                namespace.id
            )));
        }
        if replica_count == 0 {
            return Err(Error::validation("replica count must be at least 1"));
        }
        if self
            .ctx
            .store
            .get_enabled_namespace_by_root(root_namespace_id)?
            .is_some()
        {
            return Err(Error::AlreadyExists);
        }

        let placements = self.place(replica_count)?;
        let (enabled_namespace, replicas) = self.ctx.store.create_enabled_namespace(
            root_namespace_id,
            &placements,
            self.ctx.clock.now(),
        )?;

        for (_, index) in &replicas {
            self.schedule_initial_indexing(index)?;
        }

        tracing::info!(
            namespace_id = root_namespace_id,
            enabled_namespace_id = enabled_namespace.id,
            replicas = replicas.len(),
            "Enabled namespace"
        );
        Ok((enabled_namespace, replicas))
    }

    /// Removes the enabled namespace. Its indices are orphaned by the next sweep.
    pub fn disable_namespace(&self, root_namespace_id: i64) -> Result<bool> {
        let Some(enabled_namespace) = self
            .ctx
            .store
            .get_enabled_namespace_by_root(root_namespace_id)?
        else {
            return Ok(false);
        };

        let deleted = self
            .ctx
            .store
            .delete_enabled_namespace(enabled_namespace.id)?;
        if deleted {
            tracing::info!(namespace_id = root_namespace_id, "Disabled namespace");
        }
        Ok(deleted)
    }

    /// Enables root namespaces that are not indexed yet, when auto-indexing is on.
    ///
    /// A namespace that cannot be placed is still recorded, with no replicas
    /// and a failed rollout, so that `retry_failed_rollouts` picks it up.
    pub fn auto_enable_namespaces(&self, limit: i64) -> Result<usize> {
        if !self.ctx.settings.auto_index_root_namespace {
            return Ok(0);
        }

        let replica_count = self.ctx.settings.default_number_of_replicas;
        let mut enabled = 0;
        for namespace in self.ctx.store.list_unindexed_root_namespaces(limit)? {
            match self.enable_namespace(namespace.id, replica_count) {
                Ok(_) => enabled += 1,
                Err(Error::InsufficientCapacity(reason)) => {
                    let now = self.ctx.clock.now();
                    let (placeholder, _) =
                        self.ctx
                            .store
                            .create_enabled_namespace(namespace.id, &[], now)?;
                    self.ctx
                        .store
                        .set_rollout_failed_at(placeholder.id, Some(now))?;
                    tracing::warn!(
                        namespace_id = namespace.id,
                        reason = %reason,
                        "Namespace rollout failed"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(enabled)
    }

    /// Re-plans namespaces whose rollout failed at least one retry interval ago.
    pub fn retry_failed_rollouts(&self, limit: i64) -> Result<usize> {
        let Some(interval) = self.ctx.settings.rollout_retry_interval else {
            return Ok(0);
        };

        let now = self.ctx.clock.now();
        let mut rolled_out = 0;
        for enabled_namespace in self
            .ctx
            .store
            .list_enabled_namespaces_awaiting_rollout(now - interval, limit)?
        {
            let placements = match self.place(self.ctx.settings.default_number_of_replicas) {
                Ok(placements) => placements,
                Err(Error::InsufficientCapacity(reason)) => {
                    self.ctx
                        .store
                        .set_rollout_failed_at(enabled_namespace.id, Some(now))?;
                    tracing::warn!(
                        enabled_namespace_id = enabled_namespace.id,
                        reason = %reason,
                        "Namespace rollout retry failed"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let replicas = self
                .ctx
                .store
                .add_replicas(&enabled_namespace, &placements, now)?;
            for (_, index) in &replicas {
                self.schedule_initial_indexing(index)?;
            }
            rolled_out += 1;
        }
        Ok(rolled_out)
    }

    /// Starts moving a replica from one node to another.
    ///
    /// The new index is created `reallocating` next to the old one, which
    /// keeps serving until the move completes.
    pub fn reallocate_replica(
        &self,
        replica_id: i64,
        from_node_id: i64,
        to_node_id: i64,
    ) -> Result<Index> {
        if from_node_id == to_node_id {
            return Err(Error::validation("source and target node are the same"));
        }
        let replica = self
            .ctx
            .store
            .get_replica(replica_id)?
            .ok_or(Error::NotFound)?;

        let indices = self.ctx.store.list_indices_for_replica(replica.id)?;
        let source = indices
            .iter()
            .find(|i| i.zoekt_node_id == from_node_id && i.state.is_live())
            .ok_or_else(|| {
                Error::validation(format!(
                    "replica {} has no live index on node {}",
                    replica.id, from_node_id
                ))
            })?;
        if indices
            .iter()
            .any(|i| i.state == IndexState::Reallocating)
        {
            return Err(Error::Conflict(format!(
                "replica {} is already being reallocated",
                replica.id
            )));
        }

        let target = self
            .ctx
            .store
            .get_node(to_node_id)?
            .ok_or_else(|| Error::validation(format!("node {to_node_id} does not exist")))?;
        if !self.ctx.nodes().is_online(&target) {
            return Err(Error::InsufficientCapacity(format!(
                "node {to_node_id} is offline"
            )));
        }
        let reserved = source.reserved_storage_bytes;
        if self.ctx.storage().unclaimed_storage_bytes(&target)? < reserved {
            return Err(Error::InsufficientCapacity(format!(
                "node {to_node_id} cannot reserve {reserved} bytes"
            )));
        }

        let index = self.ctx.store.create_index(
            &replica,
            &IndexPlacement {
                zoekt_node_id: target.id,
                state: IndexState::Reallocating,
                reserved_storage_bytes: reserved,
            },
            self.ctx.clock.now(),
        )?;
        self.schedule_initial_indexing(&index)?;

        tracing::info!(
            replica_id = replica.id,
            from_index = source.id,
            to_index = index.id,
            to_node = target.id,
            "Reallocating replica"
        );
        Ok(index)
    }

    /// Promotes reallocating indices that caught up with the index they replace.
    pub fn complete_reallocations(&self, limit: i64) -> Result<usize> {
        let mut completed = 0;
        for index in self
            .ctx
            .store
            .list_indices_in_state(IndexState::Reallocating, limit)?
        {
            if self.reallocation_caught_up(&index)? {
                self.promote(&index)?;
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Promotes a reallocating index without waiting for it to catch up.
    pub fn finish_reallocation(&self, index_id: i64) -> Result<Index> {
        let index = self
            .ctx
            .store
            .get_index(index_id)?
            .ok_or(Error::NotFound)?;
        if index.state != IndexState::Reallocating {
            return Err(Error::validation(format!(
                "index {} is {}, not reallocating",
                index.id, index.state
            )));
        }
        self.promote(&index)?;
        self.ctx.store.get_index(index_id)?.ok_or(Error::NotFound)
    }

    /// Marks indices whose replica or enabled namespace is gone as orphaned.
    pub fn mark_orphaned_indices(&self, limit: i64) -> Result<usize> {
        let detached = self.ctx.store.list_detached_indices(limit)?;
        for index in &detached {
            self.ctx.store.set_index_state(
                index.id,
                IndexState::Orphaned,
                self.ctx.clock.now(),
            )?;
            tracing::info!(
                index_id = index.id,
                node_id = index.zoekt_node_id,
                "Index orphaned"
            );
        }
        Ok(detached.len())
    }

    /// Destroys enabled namespaces whose subscription ended more than the
    /// grace period ago.
    pub fn sweep_expired_namespaces(&self, limit: i64) -> Result<usize> {
        let now = self.ctx.clock.now();
        let cutoff = match self.ctx.settings.subscription_grace_period {
            Some(grace) => now - grace,
            None => now,
        };

        let expired = self
            .ctx
            .store
            .list_expired_enabled_namespaces(cutoff, limit)?;
        for enabled_namespace in &expired {
            self.ctx
                .store
                .delete_enabled_namespace(enabled_namespace.id)?;
            tracing::info!(
                namespace_id = enabled_namespace.root_namespace_id,
                "Removed enabled namespace with expired subscription"
            );
        }
        Ok(expired.len())
    }

    /// Expands pending namespace-level jobs into per-repository tasks.
    pub fn process_index_jobs(&self, limit: i64) -> Result<usize> {
        let jobs = self.ctx.store.list_pending_index_jobs(limit)?;
        let now = self.ctx.clock.now();

        for job in &jobs {
            let Some(index) = self.ctx.store.get_index(job.zoekt_index_id)? else {
                self.ctx.store.complete_index_job(job.id)?;
                continue;
            };

            match job.kind {
                IndexJobKind::IndexNamespace if index.state.is_deletable() => {}
                IndexJobKind::IndexNamespace => {
                    let projects = self
                        .ctx
                        .store
                        .list_projects_in_root_namespace(index.namespace_id)?;
                    if projects.is_empty() && index.state == IndexState::Pending {
                        self.ctx.store.set_index_state(
                            index.id,
                            IndexState::Ready,
                            self.ctx.clock.now(),
                        )?;
                    }
                    for project in projects {
                        self.enqueue_logged(project.id, &index, TaskType::IndexRepo)?;
                    }
                }
                IndexJobKind::DeleteNamespace => {
                    for repository in self.ctx.store.list_repositories(index.id)? {
                        self.ctx.tasks().enqueue_for_repository(
                            &repository,
                            index.zoekt_node_id,
                            TaskType::DeleteRepo,
                            now,
                        )?;
                    }
                }
            }

            self.ctx.store.complete_index_job(job.id)?;
            tracing::debug!(job_id = job.id, index_id = index.id, kind = %job.kind, "Index job done");
        }
        Ok(jobs.len())
    }

    /// Takes an index out of service and queues removal of its repositories.
    pub fn retire_index(&self, index_id: i64) -> Result<()> {
        let index = self
            .ctx
            .store
            .get_index(index_id)?
            .ok_or(Error::NotFound)?;
        self.ctx.store.set_index_state(
            index.id,
            IndexState::PendingDeletion,
            self.ctx.clock.now(),
        )?;
        self.queue_namespace_delete(&index)?;
        tracing::info!(index_id, node_id = index.zoekt_node_id, "Index retired");
        Ok(())
    }

    /// Deletes orphaned or retired indices once their repositories are gone.
    pub fn remove_deletable_indices(&self, limit: i64) -> Result<usize> {
        let mut removed = 0;
        for state in [IndexState::Orphaned, IndexState::PendingDeletion] {
            for index in self.ctx.store.list_indices_in_state(state, limit)? {
                let counts = self.ctx.store.count_repositories(index.id)?;
                if counts.total > 0 {
                    self.queue_namespace_delete(&index)?;
                    continue;
                }

                match self.ctx.store.delete_index(index.id) {
                    Ok(true) => {
                        removed += 1;
                        tracing::info!(index_id = index.id, "Index deleted");
                    }
                    Ok(false) => {}
                    // A repository was added since the count; try again next pass.
                    Err(Error::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(removed)
    }

    /// Moves index, replica and enabled-namespace states forward from what
    /// their repositories report.
    pub fn refresh_index_states(&self, batch: i64) -> Result<()> {
        let mut after_id = 0;
        loop {
            let enabled_namespaces = self.ctx.store.list_enabled_namespaces(after_id, batch)?;
            let Some(last) = enabled_namespaces.last() else {
                return Ok(());
            };
            after_id = last.id;

            for enabled_namespace in &enabled_namespaces {
                self.refresh_enabled_namespace(enabled_namespace)?;
            }
        }
    }

    fn refresh_enabled_namespace(&self, enabled_namespace: &EnabledNamespace) -> Result<()> {
        let replicas = self.ctx.store.list_replicas(enabled_namespace.id)?;
        let mut all_replicas_ready = !replicas.is_empty();

        for replica in &replicas {
            let mut live = 0;
            let mut ready = 0;
            for index in self.ctx.store.list_indices_for_replica(replica.id)? {
                let state = self.refresh_index(&index)?;
                if state.is_live() {
                    live += 1;
                    if state == IndexState::Ready {
                        ready += 1;
                    }
                }
            }

            let replica_state = if live > 0 && ready == live {
                ReplicaState::Ready
            } else {
                ReplicaState::Pending
            };
            if replica_state != replica.state {
                self.ctx
                    .store
                    .set_replica_state(replica.id, replica_state, self.ctx.clock.now())?;
            }
            all_replicas_ready &= replica_state == ReplicaState::Ready;
        }

        if enabled_namespace.search != all_replicas_ready {
            self.ctx.store.set_enabled_namespace_search(
                enabled_namespace.id,
                all_replicas_ready,
                self.ctx.clock.now(),
            )?;
            tracing::info!(
                namespace_id = enabled_namespace.root_namespace_id,
                search = all_replicas_ready,
                "Namespace search availability changed"
            );
        }
        Ok(())
    }

    /// Pending and failed indices follow their repositories; other states are left alone.
    fn refresh_index(&self, index: &Index) -> Result<IndexState> {
        if !matches!(index.state, IndexState::Pending | IndexState::Failed) {
            return Ok(index.state);
        }

        let state = if self.ctx.repositories().all_ready(index.id)? {
            IndexState::Ready
        } else {
            let counts = self.ctx.store.count_repositories(index.id)?;
            if counts.total > 0 && counts.failed == counts.total {
                IndexState::Failed
            } else {
                IndexState::Pending
            }
        };

        if state != index.state {
            self.ctx
                .store
                .set_index_state(index.id, state, self.ctx.clock.now())?;
            tracing::info!(index_id = index.id, from = %index.state, to = %state, "Index state changed");
        }
        Ok(state)
    }

    fn reallocation_caught_up(&self, index: &Index) -> Result<bool> {
        if self
            .ctx
            .store
            .has_pending_index_job(index.id, IndexJobKind::IndexNamespace)?
        {
            return Ok(false);
        }

        let counts = self.ctx.store.count_repositories(index.id)?;
        if counts.ready != counts.total {
            return Ok(false);
        }

        for replaced in self.replaced_by(index)? {
            let theirs = self.ctx.store.count_repositories(replaced.id)?;
            if counts.ready < theirs.ready {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Live indices of the same replica that a reallocating index replaces.
    fn replaced_by(&self, index: &Index) -> Result<Vec<Index>> {
        let Some(replica_id) = index.zoekt_replica_id else {
            return Ok(Vec::new());
        };
        Ok(self
            .ctx
            .store
            .list_indices_for_replica(replica_id)?
            .into_iter()
            .filter(|i| i.id != index.id && i.state.is_live())
            .collect())
    }

    fn promote(&self, index: &Index) -> Result<()> {
        let replaced = self.replaced_by(index)?;
        self.ctx
            .store
            .set_index_state(index.id, IndexState::Ready, self.ctx.clock.now())?;
        for old in &replaced {
            self.retire_index(old.id)?;
        }
        tracing::info!(
            index_id = index.id,
            replaced = replaced.len(),
            "Reallocation complete"
        );
        Ok(())
    }

    /// Online nodes with room for a default reservation, most unclaimed first.
    fn place(&self, replica_count: u32) -> Result<Vec<IndexPlacement>> {
        let mut candidates = Vec::new();
        for node in self.ctx.nodes().online_nodes()? {
            let unclaimed = self.ctx.storage().unclaimed_storage_bytes(&node)?;
            if unclaimed >= DEFAULT_RESERVED_STORAGE_BYTES {
                candidates.push((unclaimed, node.id));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let wanted = replica_count as usize;
        if candidates.len() < wanted {
            return Err(Error::InsufficientCapacity(format!(
                "{wanted} replicas requested but only {} nodes have room",
                candidates.len()
            )));
        }

        Ok(candidates
            .into_iter()
            .take(wanted)
            .map(|(_, node_id)| IndexPlacement {
                zoekt_node_id: node_id,
                state: IndexState::Pending,
                reserved_storage_bytes: DEFAULT_RESERVED_STORAGE_BYTES,
            })
            .collect())
    }

    fn schedule_initial_indexing(&self, index: &Index) -> Result<()> {
        let now = self.ctx.clock.now();
        if !self.ctx.settings.initial_indexing_per_repository {
            self.ctx
                .store
                .create_index_job(index.id, IndexJobKind::IndexNamespace, now)?;
            return Ok(());
        }

        for project in self
            .ctx
            .store
            .list_projects_in_root_namespace(index.namespace_id)?
        {
            self.enqueue_logged(project.id, index, TaskType::IndexRepo)?;
        }
        Ok(())
    }

    fn queue_namespace_delete(&self, index: &Index) -> Result<()> {
        if !self
            .ctx
            .store
            .has_pending_index_job(index.id, IndexJobKind::DeleteNamespace)?
        {
            self.ctx.store.create_index_job(
                index.id,
                IndexJobKind::DeleteNamespace,
                self.ctx.clock.now(),
            )?;
        }
        Ok(())
    }

    /// Enqueues, logging rather than failing on a project placement conflict.
    fn enqueue_logged(&self, project_id: i64, index: &Index, task_type: TaskType) -> Result<()> {
        match self
            .ctx
            .tasks()
            .enqueue(project_id, index, task_type, self.ctx.clock.now())
        {
            Ok(EnqueueOutcome::Created(_) | EnqueueOutcome::Duplicate) => Ok(()),
            Ok(outcome) => {
                tracing::debug!(project_id, index_id = index.id, ?outcome, "Task not queued");
                Ok(())
            }
            Err(e) if e.is_validation() => {
                tracing::warn!(project_id, index_id = index.id, error = %e, "Task not queued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
