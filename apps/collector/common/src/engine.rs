use crate::blued::BluedApi;
use crate::queue::JobQueue;
use crate::scheduler::TaskRegistry;
use sea_orm::DatabaseConnection;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timing and paging knobs for the live monitor.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub sync_interval: Duration,
    pub max_consume_pages: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            sync_interval: Duration::from_secs(30),
            max_consume_pages: 4,
        }
    }
}

/// Shared handle to the live monitor: the poller, the per-anchor sync tasks
/// and the subscription operations all hang off this type. Cloning is cheap.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) db: DatabaseConnection,
    pub(crate) api: Arc<dyn BluedApi>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) tasks: Arc<TaskRegistry>,
    pub(crate) settings: SyncSettings,
    /// Anchor uids whose live check is currently running.
    pub(crate) checking: Arc<Mutex<HashSet<i64>>>,
}

impl SyncEngine {
    pub fn new(
        db: DatabaseConnection,
        api: Arc<dyn BluedApi>,
        queue: Arc<dyn JobQueue>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            api,
            queue,
            tasks: Arc::new(TaskRegistry::new()),
            settings,
            checking: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }
}
