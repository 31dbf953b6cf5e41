use super::{Context, EnqueueOutcome};
use crate::error::{Error, Result};
use crate::types::{Index, Repository, RepositoryState, TaskState, TaskType};

/// Per-(index, project) indexing state.
pub struct RepositoryStateMachine<'a> {
    ctx: Context<'a>,
}

impl<'a> RepositoryStateMachine<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Returns the existing repository for the pair or creates a pending one.
    pub fn create_or_find(&self, project_id: i64, index: &Index) -> Result<Repository> {
        self.ctx
            .store
            .find_or_create_repository(index, project_id, self.ctx.clock.now())
    }

    pub fn transition(&self, repository_id: i64, to: RepositoryState) -> Result<Repository> {
        let mut repository = self
            .ctx
            .store
            .get_repository(repository_id)?
            .ok_or(Error::NotFound)?;

        if !repository.state.can_transition_to(to) {
            return Err(Error::validation(format!(
                "repository {} cannot move from {} to {}",
                repository.id, repository.state, to
            )));
        }

        let now = self.ctx.clock.now();
        self.ctx
            .store
            .set_repository_state(repository.id, to, now)?;
        tracing::debug!(
            repository_id = repository.id,
            from = %repository.state,
            to = %to,
            "Repository state changed"
        );
        repository.state = to;
        repository.updated_at = now;
        Ok(repository)
    }

    /// Explicit retry of a failed repository.
    pub fn reset_failed(&self, repository_id: i64) -> Result<Repository> {
        let repository = self
            .ctx
            .store
            .get_repository(repository_id)?
            .ok_or(Error::NotFound)?;
        if repository.state != RepositoryState::Failed {
            return Err(Error::validation(format!(
                "repository {} is {}, not failed",
                repository.id, repository.state
            )));
        }
        self.transition(repository_id, RepositoryState::Pending)
    }

    /// True when the index has repositories and all of them are ready.
    pub fn all_ready(&self, index_id: i64) -> Result<bool> {
        let counts = self.ctx.store.count_repositories(index_id)?;
        Ok(counts.total > 0 && counts.ready == counts.total)
    }

    /// Orphans repositories whose project is gone, along with their pending
    /// `index_repo` tasks. Pending `delete_repo` tasks are kept.
    pub fn mark_orphaned_repositories(&self, limit: i64) -> Result<usize> {
        let now = self.ctx.clock.now();
        let repositories = self.ctx.store.list_repositories_missing_project(limit)?;

        for repository in &repositories {
            self.ctx
                .store
                .set_repository_state(repository.id, RepositoryState::Orphaned, now)?;
            let orphaned_tasks =
                self.ctx
                    .store
                    .orphan_pending_tasks(repository.id, TaskType::IndexRepo, now)?;
            tracing::info!(
                repository_id = repository.id,
                project_id = repository.project_identifier,
                orphaned_tasks,
                "Repository orphaned"
            );
        }

        Ok(repositories.len())
    }

    /// Queues removal of orphaned repositories from their nodes.
    pub fn cleanup_orphaned_repositories(&self, limit: i64) -> Result<usize> {
        let mut queued = 0;
        for repository in self
            .ctx
            .store
            .list_repositories_in_state(RepositoryState::Orphaned, limit)?
        {
            let in_flight = self
                .ctx
                .store
                .list_tasks_for_repository(repository.id)?
                .into_iter()
                .any(|t| t.task_type == TaskType::DeleteRepo && t.state == TaskState::Processing);
            if in_flight {
                continue;
            }

            let Some(index) = self.ctx.store.get_index(repository.zoekt_index_id)? else {
                continue;
            };
            let outcome = self.ctx.tasks().enqueue_for_repository(
                &repository,
                index.zoekt_node_id,
                TaskType::DeleteRepo,
                self.ctx.clock.now(),
            )?;
            if matches!(outcome, EnqueueOutcome::Created(_)) {
                queued += 1;
            }
        }
        Ok(queued)
    }
}
