//! The index-coordination engine.
//!
//! Every component borrows a [`Context`]: the store, a snapshot of the
//! settings and a clock. Components hold no state of their own, so any
//! number of worker processes may run the same operations concurrently;
//! cross-process invariants live in the store.

mod clock;
mod maintenance;
mod nodes;
mod partitions;
mod planner;
mod repositories;
mod storage;
mod tasks;

pub use clock::{Clock, ManualClock, WallClock};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use nodes::NodeRegistry;
pub use partitions::TaskPartitions;
pub use planner::ShardPlanner;
pub use repositories::RepositoryStateMachine;
pub use storage::{StorageAccountant, WatermarkTransition};
pub use tasks::{EnqueueOutcome, TaskDispatcher};

use crate::config::Settings;
use crate::store::Store;

#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub store: &'a dyn Store,
    pub settings: &'a Settings,
    pub clock: &'a dyn Clock,
}

impl<'a> Context<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, settings: &'a Settings, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            settings,
            clock,
        }
    }

    pub fn nodes(self) -> NodeRegistry<'a> {
        NodeRegistry::new(self)
    }

    pub fn storage(self) -> StorageAccountant<'a> {
        StorageAccountant::new(self)
    }

    pub fn planner(self) -> ShardPlanner<'a> {
        ShardPlanner::new(self)
    }

    pub fn repositories(self) -> RepositoryStateMachine<'a> {
        RepositoryStateMachine::new(self)
    }

    pub fn tasks(self) -> TaskDispatcher<'a> {
        TaskDispatcher::new(self)
    }

    pub fn partitions(self) -> TaskPartitions<'a> {
        TaskPartitions::new(self)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::store::SqliteStore;
    use crate::types::*;

    pub const GIB: i64 = 1024 * 1024 * 1024;

    pub fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    /// Store, settings and clock for one test.
    pub struct Fixture {
        pub store: SqliteStore,
        pub settings: Settings,
        pub clock: ManualClock,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                store: SqliteStore::in_memory().unwrap(),
                settings: Settings::default(),
                clock: ManualClock::new(epoch()),
            }
        }

        pub fn ctx(&self) -> Context<'_> {
            Context::new(&self.store, &self.settings, &self.clock)
        }

        pub fn node(&self, total: i64, used: i64) -> Node {
            self.store
                .upsert_node(
                    &NodeRegistration {
                        uuid: Uuid::new_v4(),
                        index_base_url: "http://zoekt:6060".to_string(),
                        search_base_url: "http://zoekt:6070".to_string(),
                        last_seen_at: self.clock.now(),
                        used_bytes: used,
                        total_bytes: total,
                        indexed_bytes: 0,
                        metadata: NodeMetadata::default(),
                    },
                    self.clock.now(),
                )
                .unwrap()
        }

        pub fn root_namespace(&self, id: i64, projects: &[i64]) {
            self.store
                .upsert_namespace(&Namespace {
                    id,
                    parent_id: None,
                    name: format!("group-{id}"),
                })
                .unwrap();
            for project in projects {
                self.store
                    .upsert_project(&Project {
                        id: *project,
                        namespace_id: id,
                        root_namespace_id: id,
                    })
                    .unwrap();
            }
        }

        /// Enables `root` with one replica and returns its only index.
        pub fn enabled_index(&self, root: i64) -> Index {
            let (_, replicas) = self.ctx().planner().enable_namespace(root, 1).unwrap();
            replicas.into_iter().next().unwrap().1
        }
    }
}
