use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::Context;
use crate::error::{Error, Result};
use crate::store::TaskCursor;
use crate::types::{
    CallbackKind, Index, NewTask, Node, Repository, RepositoryState, Task, TaskCallback,
    TaskPayload, TaskState, TaskType,
};

pub const TASK_PULL_FREQUENCY_DEFAULT: Duration = Duration::from_secs(10);
pub const TASK_PULL_FREQUENCY_INCREASED: Duration = Duration::from_secs(60);
const MAX_PULL_FREQUENCY: Duration = Duration::from_secs(5 * 60);

const RETRY_BASE_DELAY_SECS: i64 = 30;
const MAX_RETRY_DELAY_SECS: i64 = 30 * 60;
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Rows fetched per query while draining.
const DRAIN_PAGE_SIZE: i64 = 100;

/// What `enqueue` did. Only the first variant wrote anything.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(Task),
    /// A pending task of the same type already targets this repository and node.
    Duplicate,
    /// `index_repo` on a failed repository; reset it first.
    FailedRepository,
    /// Indexing is switched off.
    Disabled,
}

impl EnqueueOutcome {
    #[must_use]
    pub fn task(self) -> Option<Task> {
        match self {
            Self::Created(task) => Some(task),
            _ => None,
        }
    }
}

/// Creates, hands out and settles node tasks.
pub struct TaskDispatcher<'a> {
    ctx: Context<'a>,
}

impl<'a> TaskDispatcher<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Queues work for `project_id` on the index's node, creating the
    /// repository record when needed.
    pub fn enqueue(
        &self,
        project_id: i64,
        index: &Index,
        task_type: TaskType,
        perform_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if task_type == TaskType::IndexRepo && !self.ctx.settings.indexing_enabled {
            return Ok(EnqueueOutcome::Disabled);
        }

        let repository = self.ctx.repositories().create_or_find(project_id, index)?;
        self.enqueue_for_repository(&repository, index.zoekt_node_id, task_type, perform_at)
    }

    pub fn enqueue_for_repository(
        &self,
        repository: &Repository,
        node_id: i64,
        task_type: TaskType,
        perform_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if task_type == TaskType::IndexRepo && repository.state == RepositoryState::Failed {
            tracing::debug!(
                repository_id = repository.id,
                "Skipping index task for failed repository"
            );
            return Ok(EnqueueOutcome::FailedRepository);
        }

        let partition = self.ctx.partitions().active()?;
        let task = NewTask {
            zoekt_node_id: node_id,
            zoekt_repository_id: repository.id,
            project_identifier: repository.project_identifier,
            task_type,
            retries_left: self.ctx.settings.task_retries,
            perform_at,
            created_at: self.ctx.clock.now(),
        };

        match self.ctx.store.insert_task(&task, partition.id)? {
            Some(task) => {
                tracing::debug!(
                    task_id = task.id,
                    node_id,
                    repository_id = repository.id,
                    task_type = %task_type,
                    "Task queued"
                );
                Ok(EnqueueOutcome::Created(task))
            }
            None => Ok(EnqueueOutcome::Duplicate),
        }
    }

    /// Lazily claims up to `limit` due tasks across all nodes, oldest first,
    /// at most one per project. Each call starts a fresh scan.
    pub fn drain(&self, limit: usize) -> Drain<'a> {
        Drain::new(self.ctx, None, limit)
    }

    /// Due tasks for one node, bounded by the node's free concurrency.
    pub fn drain_for_node(&self, node: &Node) -> Result<Vec<Task>> {
        if !self.ctx.settings.dispatch_allowed() {
            return Ok(Vec::new());
        }

        let limit = self.ctx.nodes().concurrency_limit(node);
        let running = self
            .ctx
            .store
            .count_tasks_for_node(node.id, TaskState::Processing)?;
        let free = usize::try_from(limit - running).unwrap_or(0);

        Drain::new(self.ctx, Some(node.id), free).collect()
    }

    /// Applies a node's report about a task it ran.
    pub fn record_result(&self, node: &Node, callback: &TaskCallback) -> Result<Task> {
        let now = self.ctx.clock.now();
        let task = self
            .ctx
            .store
            .get_task(callback.payload.task_id)?
            .ok_or(Error::NotFound)?;

        if task.zoekt_node_id != node.id {
            return Err(Error::validation(format!(
                "task {} is not assigned to node {}",
                task.id, node.id
            )));
        }
        let expected = match callback.name {
            CallbackKind::Index => TaskType::IndexRepo,
            CallbackKind::Delete => TaskType::DeleteRepo,
        };
        if task.task_type != expected {
            return Err(Error::validation(format!(
                "task {} is {}, not {}",
                task.id, task.task_type, expected
            )));
        }
        if !task.state.is_in_flight() {
            // Already settled; repeated callbacks are harmless.
            return Ok(task);
        }

        self.ctx.nodes().record_task_outcome(node.id, callback.success)?;

        if !callback.success {
            tracing::warn!(
                task_id = task.id,
                node_id = node.id,
                error = callback.error.as_deref().unwrap_or("unknown"),
                "Task failed on node"
            );
            return self.fail_task(task);
        }

        let repository = self.ctx.store.get_repository(task.zoekt_repository_id)?;
        let state = match (task.task_type, &repository) {
            (TaskType::IndexRepo, Some(repository))
                if matches!(
                    repository.state,
                    RepositoryState::Pending | RepositoryState::Ready
                ) =>
            {
                TaskState::Done
            }
            (TaskType::DeleteRepo, _) => TaskState::Done,
            // The repository was orphaned, failed or removed meanwhile.
            (TaskType::IndexRepo, _) => TaskState::Skipped,
        };

        // Whoever settles the task first applies its effects.
        if !self.ctx.store.settle_task(task.id, state, now)? {
            return self.current(task);
        }

        match (state, repository) {
            (TaskState::Done, Some(repository)) if task.task_type == TaskType::IndexRepo => {
                let size = callback
                    .payload
                    .repo_stats
                    .as_ref()
                    .map(|s| s.size_in_bytes.max(0))
                    .unwrap_or(repository.size_bytes);
                self.ctx
                    .store
                    .mark_repository_indexed(repository.id, size, now)?;
                self.ctx.storage().update_used_storage(repository.zoekt_index_id)?;
            }
            (TaskState::Done, Some(repository)) => {
                self.ctx.store.delete_repository(repository.id)?;
                self.ctx.storage().update_used_storage(repository.zoekt_index_id)?;
            }
            _ => {}
        }

        Ok(Task {
            state,
            updated_at: now,
            ..task
        })
    }

    /// Treats in-flight tasks older than the indexing timeout as failed.
    pub fn requeue_stale_tasks(&self, limit: i64) -> Result<usize> {
        let cutoff = self.ctx.clock.now() - self.ctx.settings.indexing_timeout;
        let stale = self
            .ctx
            .store
            .list_processing_tasks_updated_before(cutoff, limit)?;

        for task in &stale {
            tracing::warn!(
                task_id = task.id,
                node_id = task.zoekt_node_id,
                "Task timed out"
            );
            self.fail_task(task.clone())?;
        }
        Ok(stale.len())
    }

    /// Seconds a node should wait before asking for more work.
    pub fn task_pull_frequency(&self, node: &Node) -> Result<Duration> {
        let pending = self
            .ctx
            .store
            .count_tasks_for_node(node.id, TaskState::Pending)?;
        let base = if pending >= self.ctx.nodes().concurrency_limit(node) {
            TASK_PULL_FREQUENCY_INCREASED
        } else {
            TASK_PULL_FREQUENCY_DEFAULT
        };

        Ok(base.max(failure_backoff(node.task_failures)))
    }

    /// Wire form of a claimed task, as handed to the node.
    pub fn payload(&self, task: &Task) -> Result<TaskPayload> {
        let repository = self
            .ctx
            .store
            .get_repository(task.zoekt_repository_id)?
            .ok_or(Error::NotFound)?;
        let index = self
            .ctx
            .store
            .get_index(repository.zoekt_index_id)?
            .ok_or(Error::NotFound)?;

        Ok(TaskPayload {
            id: task.id,
            task_type: task.task_type,
            project_id: task.project_identifier,
            perform_at: task.perform_at,
            repository_id: repository.id,
            index_id: index.id,
            namespace_id: index.namespace_id,
        })
    }

    /// Retries with backoff while retries remain, otherwise fails the task.
    fn fail_task(&self, task: Task) -> Result<Task> {
        let now = self.ctx.clock.now();

        if task.retries_left > 0 {
            let attempt = (self.ctx.settings.task_retries - task.retries_left).max(0);
            let perform_at = now + retry_delay(attempt as u32);
            let retries_left = task.retries_left - 1;

            if self
                .ctx
                .store
                .reschedule_task(task.id, perform_at, retries_left, now)?
            {
                return Ok(Task {
                    state: TaskState::Pending,
                    perform_at,
                    retries_left,
                    updated_at: now,
                    ..task
                });
            }

            // Either a newer pending task already covers this work or the
            // task settled since it was read.
            if !self
                .ctx
                .store
                .release_task(task.id, TaskState::Skipped, now)?
            {
                return self.current(task);
            }
            return Ok(Task {
                state: TaskState::Skipped,
                updated_at: now,
                ..task
            });
        }

        if !self
            .ctx
            .store
            .release_task(task.id, TaskState::Failed, now)?
        {
            return self.current(task);
        }
        if task.task_type == TaskType::IndexRepo {
            if let Some(repository) = self.ctx.store.get_repository(task.zoekt_repository_id)? {
                if repository.state.can_transition_to(RepositoryState::Failed) {
                    self.ctx.store.set_repository_state(
                        repository.id,
                        RepositoryState::Failed,
                        now,
                    )?;
                }
            }
        }

        Ok(Task {
            state: TaskState::Failed,
            updated_at: now,
            ..task
        })
    }

    /// The stored row, for a task another caller settled first.
    fn current(&self, task: Task) -> Result<Task> {
        Ok(self.ctx.store.get_task(task.id)?.unwrap_or(task))
    }
}

fn retry_delay(attempt: u32) -> TimeDelta {
    let shift = attempt.min(MAX_BACKOFF_EXPONENT);
    let factor = 1_i64.checked_shl(shift).unwrap_or(i64::MAX);
    TimeDelta::seconds(
        RETRY_BASE_DELAY_SECS
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_SECS),
    )
}

fn failure_backoff(failures: i32) -> Duration {
    if failures <= 0 {
        return Duration::ZERO;
    }
    let shift = (failures as u32).min(MAX_BACKOFF_EXPONENT);
    let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
    TASK_PULL_FREQUENCY_DEFAULT
        .saturating_mul(factor)
        .min(MAX_PULL_FREQUENCY)
}

/// Iterator returned by [`TaskDispatcher::drain`].
///
/// Pages through due tasks and claims each one atomically, so concurrent
/// drainers never hand out the same task. Skipped tasks stay pending.
pub struct Drain<'a> {
    ctx: Context<'a>,
    node_id: Option<i64>,
    now: DateTime<Utc>,
    remaining: usize,
    cursor: Option<TaskCursor>,
    page: VecDeque<Task>,
    projects: HashSet<i64>,
    exhausted: bool,
}

impl<'a> Drain<'a> {
    fn new(ctx: Context<'a>, node_id: Option<i64>, limit: usize) -> Self {
        let remaining = if ctx.settings.dispatch_allowed() {
            limit
        } else {
            0
        };
        Self {
            ctx,
            node_id,
            now: ctx.clock.now(),
            remaining,
            cursor: None,
            page: VecDeque::new(),
            projects: HashSet::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let tasks =
            self.ctx
                .store
                .list_due_tasks(self.node_id, self.now, self.cursor, DRAIN_PAGE_SIZE)?;
        match tasks.last() {
            Some(last) => {
                self.cursor = Some(TaskCursor {
                    perform_at: last.perform_at,
                    id: last.id,
                });
                self.page.extend(tasks);
            }
            None => self.exhausted = true,
        }
        Ok(())
    }

    /// Claims the task unless it should be skipped.
    fn take(&mut self, task: Task) -> Result<Option<Task>> {
        if self.projects.contains(&task.project_identifier) {
            return Ok(None);
        }

        if self.ctx.store.get_project(task.project_identifier)?.is_none()
            && task.task_type == TaskType::IndexRepo
        {
            self.ctx.store.orphan_pending_tasks(
                task.zoekt_repository_id,
                TaskType::IndexRepo,
                self.now,
            )?;
            tracing::debug!(task_id = task.id, "Orphaned index task of deleted project");
            return Ok(None);
        }

        if !self.ctx.store.claim_task(task.id, self.now)? {
            return Ok(None);
        }

        self.projects.insert(task.project_identifier);
        Ok(Some(Task {
            state: TaskState::Processing,
            updated_at: self.now,
            ..task
        }))
    }
}

impl Iterator for Drain<'_> {
    type Item = Result<Task>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let Some(task) = self.page.pop_front() else {
                if self.exhausted {
                    return None;
                }
                if let Err(e) = self.fill() {
                    self.remaining = 0;
                    return Some(Err(e));
                }
                continue;
            };

            match self.take(task) {
                Ok(Some(task)) => {
                    self.remaining -= 1;
                    return Some(Ok(task));
                }
                Ok(None) => {}
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Clock;
    use crate::coordinator::testing::{Fixture, GIB};
    use crate::store::Store;
    use crate::types::{CallbackPayload, RepoStats};

    fn callback(task_id: i64, name: CallbackKind, success: bool) -> TaskCallback {
        TaskCallback {
            name,
            success,
            error: (!success).then(|| "boom".to_string()),
            payload: CallbackPayload {
                task_id,
                repo_stats: Some(RepoStats {
                    size_in_bytes: 1234,
                    index_file_count: 1,
                }),
            },
        }
    }

    fn setup(projects: &[i64]) -> (Fixture, Index) {
        let fx = Fixture::new();
        fx.root_namespace(1, projects);
        fx.node(100 * GIB, 0);
        let index = fx.enabled_index(1);
        (fx, index)
    }

    #[test]
    fn test_failed_repository_blocks_index_but_not_delete() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        let repo = ctx.repositories().create_or_find(10, &index).unwrap();
        ctx.repositories()
            .transition(repo.id, RepositoryState::Failed)
            .unwrap();
        let now = fx.clock.now();

        let outcome = ctx.tasks().enqueue(10, &index, TaskType::IndexRepo, now).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::FailedRepository));
        assert!(fx.store.list_tasks_for_repository(repo.id).unwrap().is_empty());

        let outcome = ctx.tasks().enqueue(10, &index, TaskType::DeleteRepo, now).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Created(_)));
    }

    #[test]
    fn test_duplicate_enqueue_keeps_one_pending_task() {
        let (fx, index) = setup(&[10]);
        let tasks = fx.ctx().tasks();
        let now = fx.clock.now();

        let first = tasks.enqueue(10, &index, TaskType::IndexRepo, now).unwrap();
        let second = tasks.enqueue(10, &index, TaskType::IndexRepo, now).unwrap();
        assert!(matches!(first, EnqueueOutcome::Created(_)));
        assert!(matches!(second, EnqueueOutcome::Duplicate));
    }

    #[test]
    fn test_concurrent_enqueue_converges() {
        let fx = Fixture::new();
        fx.root_namespace(1, &[10]);
        fx.node(100 * GIB, 0);
        let index = fx.enabled_index(1);
        let now = fx.clock.now();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    fx.ctx()
                        .tasks()
                        .enqueue(10, &index, TaskType::IndexRepo, now)
                        .unwrap();
                });
            }
        });

        let repo = fx.store.get_repository_by_project(index.id, 10).unwrap().unwrap();
        let pending = fx
            .store
            .list_tasks_for_repository(repo.id)
            .unwrap()
            .into_iter()
            .filter(|t| t.state == TaskState::Pending)
            .count();
        assert_eq!(pending, 1);
    }

    #[test]
    fn test_enqueue_disabled_when_indexing_off() {
        let (mut fx, index) = setup(&[10]);
        fx.settings.indexing_enabled = false;
        let outcome = fx
            .ctx()
            .tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Disabled));
    }

    #[test]
    fn test_drain_orders_and_dedupes_by_project() {
        let fx = Fixture::new();
        fx.root_namespace(1, &[10, 11]);
        fx.node(100 * GIB, 0);
        fx.node(100 * GIB, 0);
        let (_, replicas) = fx.ctx().planner().enable_namespace(1, 2).unwrap();
        let now = fx.clock.now();
        let tasks = fx.ctx().tasks();

        let a = tasks
            .enqueue(10, &replicas[0].1, TaskType::IndexRepo, now - TimeDelta::minutes(5))
            .unwrap()
            .task()
            .unwrap();
        let b = tasks
            .enqueue(10, &replicas[1].1, TaskType::IndexRepo, now - TimeDelta::minutes(1))
            .unwrap()
            .task()
            .unwrap();
        let c = tasks
            .enqueue(11, &replicas[0].1, TaskType::IndexRepo, now - TimeDelta::minutes(3))
            .unwrap()
            .task()
            .unwrap();
        // Not due yet.
        tasks
            .enqueue(11, &replicas[1].1, TaskType::IndexRepo, now + TimeDelta::minutes(3))
            .unwrap();

        let drained: Vec<i64> = tasks
            .drain(10)
            .map(|t| t.unwrap().id)
            .collect();
        assert_eq!(drained, vec![a.id, c.id]);

        // The skipped task is still pending and comes out next time.
        let drained: Vec<i64> = tasks.drain(10).map(|t| t.unwrap().id).collect();
        assert_eq!(drained, vec![b.id]);
        assert_eq!(tasks.drain(10).count(), 0);
    }

    #[test]
    fn test_drain_respects_limit_and_claims() {
        let (fx, index) = setup(&[10, 11, 12]);
        let tasks = fx.ctx().tasks();
        for project in [10, 11, 12] {
            tasks
                .enqueue(project, &index, TaskType::IndexRepo, fx.clock.now())
                .unwrap();
        }

        let first: Vec<Task> = tasks.drain(2).collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|t| t.state == TaskState::Processing));
        let stored = fx.store.get_task(first[0].id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Processing);

        let rest: Vec<Task> = tasks.drain(2).collect::<Result<_>>().unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_drain_orphans_index_tasks_of_deleted_projects() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        let now = fx.clock.now();
        let index_task = ctx
            .tasks()
            .enqueue(10, &index, TaskType::IndexRepo, now)
            .unwrap()
            .task()
            .unwrap();
        fx.store.delete_project(10).unwrap();

        assert_eq!(ctx.tasks().drain(10).count(), 0);
        assert_eq!(
            fx.store.get_task(index_task.id).unwrap().unwrap().state,
            TaskState::Orphaned
        );

        let repo = fx.store.get_repository(index_task.zoekt_repository_id).unwrap().unwrap();
        let delete_task = ctx
            .tasks()
            .enqueue_for_repository(&repo, index.zoekt_node_id, TaskType::DeleteRepo, now)
            .unwrap()
            .task()
            .unwrap();
        let drained: Vec<i64> = ctx.tasks().drain(10).map(|t| t.unwrap().id).collect();
        assert_eq!(drained, vec![delete_task.id]);
    }

    #[test]
    fn test_drain_for_node_respects_concurrency_and_switches() {
        let (mut fx, index) = setup(&[10, 11, 12]);
        let node_id = index.zoekt_node_id;
        fx.store
            .connection()
            .execute(
                "UPDATE zoekt_nodes SET metadata = '{\"name\":\"n\",\"concurrency_override\":2}'",
                [],
            )
            .unwrap();
        for project in [10, 11, 12] {
            fx.ctx()
                .tasks()
                .enqueue(project, &index, TaskType::IndexRepo, fx.clock.now())
                .unwrap();
        }
        let node = fx.store.get_node(node_id).unwrap().unwrap();

        fx.settings.indexing_paused = true;
        assert!(fx.ctx().tasks().drain_for_node(&node).unwrap().is_empty());

        fx.settings.indexing_paused = false;
        assert_eq!(fx.ctx().tasks().drain_for_node(&node).unwrap().len(), 2);
        // Both slots are busy now.
        assert!(fx.ctx().tasks().drain_for_node(&node).unwrap().is_empty());
    }

    #[test]
    fn test_successful_index_callback_marks_repository_ready() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let node = fx.store.get_node(index.zoekt_node_id).unwrap().unwrap();

        let settled = ctx
            .tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, true))
            .unwrap();
        assert_eq!(settled.state, TaskState::Done);

        let repo = fx.store.get_repository(task.zoekt_repository_id).unwrap().unwrap();
        assert_eq!(repo.state, RepositoryState::Ready);
        assert_eq!(repo.size_bytes, 1234);
        assert!(repo.indexed_at.is_some());
        assert_eq!(
            fx.store.get_index(index.id).unwrap().unwrap().used_storage_bytes,
            1234
        );

        // A repeated callback does nothing.
        let again = ctx
            .tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, true))
            .unwrap();
        assert_eq!(again.state, TaskState::Done);
    }

    #[test]
    fn test_payload_carries_index_and_namespace() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        let task = ctx
            .tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap()
            .task()
            .unwrap();

        let payload = ctx.tasks().payload(&task).unwrap();
        assert_eq!(payload.id, task.id);
        assert_eq!(payload.task_type, TaskType::IndexRepo);
        assert_eq!(payload.perform_at, task.perform_at);
        assert_eq!(payload.project_id, 10);
        assert_eq!(payload.index_id, index.id);
        assert_eq!(payload.namespace_id, 1);
    }

    #[test]
    fn test_delete_callback_removes_repository() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::DeleteRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let node = fx.store.get_node(index.zoekt_node_id).unwrap().unwrap();

        ctx.tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Delete, true))
            .unwrap();
        assert!(fx.store.get_repository(task.zoekt_repository_id).unwrap().is_none());
    }

    #[test]
    fn test_callback_from_other_node_is_rejected() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let stranger = fx.node(100, 0);

        let err = ctx
            .tasks()
            .record_result(&stranger, &callback(task.id, CallbackKind::Index, true))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_failures_retry_with_backoff_then_fail() {
        let (mut fx, index) = setup(&[10]);
        fx.settings.task_retries = 1;
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let node_id = index.zoekt_node_id;

        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let node = fx.store.get_node(node_id).unwrap().unwrap();
        let retried = ctx
            .tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, false))
            .unwrap();
        assert_eq!(retried.state, TaskState::Pending);
        assert_eq!(retried.retries_left, 0);
        assert_eq!(retried.perform_at, fx.clock.now() + TimeDelta::seconds(30));

        // Not due until the backoff elapses.
        assert_eq!(ctx.tasks().drain(1).count(), 0);
        fx.clock.advance(TimeDelta::seconds(30));

        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let failed = ctx
            .tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, false))
            .unwrap();
        assert_eq!(failed.state, TaskState::Failed);

        let repo = fx.store.get_repository(task.zoekt_repository_id).unwrap().unwrap();
        assert_eq!(repo.state, RepositoryState::Failed);
        assert_eq!(fx.store.get_node(node_id).unwrap().unwrap().task_failures, 2);
    }

    #[test]
    fn test_stale_processing_tasks_are_requeued() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();

        fx.clock.advance(TimeDelta::minutes(29));
        assert_eq!(ctx.tasks().requeue_stale_tasks(100).unwrap(), 0);

        fx.clock.advance(TimeDelta::minutes(2));
        assert_eq!(ctx.tasks().requeue_stale_tasks(100).unwrap(), 1);
        let task = fx.store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retries_left, 2);
    }

    #[test]
    fn test_stale_requeue_leaves_settled_task_alone() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let node = fx.store.get_node(index.zoekt_node_id).unwrap().unwrap();

        fx.clock.advance(TimeDelta::minutes(31));
        let cutoff = fx.clock.now() - fx.settings.indexing_timeout;
        let stale = fx
            .store
            .list_processing_tasks_updated_before(cutoff, 100)
            .unwrap();
        assert_eq!(stale.len(), 1);

        // The node reports success between the scan and the requeue.
        ctx.tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, true))
            .unwrap();

        let after = ctx.tasks().fail_task(stale[0].clone()).unwrap();
        assert_eq!(after.state, TaskState::Done);
        let stored = fx.store.get_task(task.id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Done);
        assert_eq!(stored.retries_left, task.retries_left);
        let repo = fx.store.get_repository(task.zoekt_repository_id).unwrap().unwrap();
        assert_eq!(repo.state, RepositoryState::Ready);
    }

    #[test]
    fn test_late_failure_does_not_touch_requeued_task() {
        let (fx, index) = setup(&[10]);
        let ctx = fx.ctx();
        ctx.tasks()
            .enqueue(10, &index, TaskType::IndexRepo, fx.clock.now())
            .unwrap();
        let task = ctx.tasks().drain(1).next().unwrap().unwrap();
        let node = fx.store.get_node(index.zoekt_node_id).unwrap().unwrap();

        fx.clock.advance(TimeDelta::minutes(31));
        assert_eq!(ctx.tasks().requeue_stale_tasks(100).unwrap(), 1);

        let after = ctx
            .tasks()
            .record_result(&node, &callback(task.id, CallbackKind::Index, false))
            .unwrap();
        assert_eq!(after.state, TaskState::Pending);
        assert_eq!(after.retries_left, 2);
    }

    #[test]
    fn test_task_pull_frequency() {
        let (fx, index) = setup(&[10, 11]);
        fx.store
            .connection()
            .execute(
                "UPDATE zoekt_nodes SET metadata = '{\"name\":\"n\",\"concurrency_override\":2}'",
                [],
            )
            .unwrap();
        let ctx = fx.ctx();
        let node = fx.store.get_node(index.zoekt_node_id).unwrap().unwrap();

        assert_eq!(
            ctx.tasks().task_pull_frequency(&node).unwrap(),
            TASK_PULL_FREQUENCY_DEFAULT
        );

        for project in [10, 11] {
            ctx.tasks()
                .enqueue(project, &index, TaskType::IndexRepo, fx.clock.now())
                .unwrap();
        }
        assert_eq!(
            ctx.tasks().task_pull_frequency(&node).unwrap(),
            TASK_PULL_FREQUENCY_INCREASED
        );

        let failing = Node {
            task_failures: 10,
            ..node
        };
        assert_eq!(
            ctx.tasks().task_pull_frequency(&failing).unwrap(),
            MAX_PULL_FREQUENCY
        );
    }

    #[test]
    fn test_backoff_helpers() {
        assert_eq!(retry_delay(0), TimeDelta::seconds(30));
        assert_eq!(retry_delay(2), TimeDelta::seconds(120));
        assert_eq!(retry_delay(40), TimeDelta::seconds(MAX_RETRY_DELAY_SECS));

        assert_eq!(failure_backoff(0), Duration::ZERO);
        assert_eq!(failure_backoff(1), Duration::from_secs(20));
        assert_eq!(failure_backoff(3), Duration::from_secs(80));
        assert_eq!(failure_backoff(i32::MAX), MAX_PULL_FREQUENCY);
    }
}
