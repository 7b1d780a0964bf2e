//! Per-anchor sync task registry.
//!
//! Every live anchor owns exactly two periodic tasks, chat-sync and
//! consume-sync, keyed by `(anchor uid, kind)`. Registration is idempotent:
//! asking to start a task that already runs for the same session is a no-op,
//! and stopping a task that is not registered does nothing.

use crate::engine::SyncEngine;
use entity::anchor;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    Chat,
    Consume,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Chat, TaskKind::Consume];

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Chat => "sync-chat",
            TaskKind::Consume => "sync-consume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub anchor_uid: i64,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn new(anchor_uid: i64, kind: TaskKind) -> Self {
        Self { anchor_uid, kind }
    }

    /// Deterministic task name, e.g. `100-sync-chat`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.anchor_uid, self.kind.label())
    }
}

/// The session a sync task works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub anchor_uid: i64,
    pub anchor_name: String,
    pub lid: i64,
}

struct RegisteredTask {
    lid: i64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskKey, RegisteredTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task calling `tick` every `period` unless one is already
    /// running under `key` for the same session. A task left over from a
    /// different session is cancelled and replaced. Returns whether a task
    /// was spawned.
    pub async fn register<F, Fut>(&self, key: TaskKey, lid: i64, period: Duration, tick: F) -> bool
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.get(&key) {
            if existing.lid == lid && !existing.handle.is_finished() {
                return false;
            }
        }

        if let Some(stale) = tasks.remove(&key) {
            stale.token.cancel();
            info!(
                "Replacing task {} (session {} -> {})",
                key.name(),
                stale.lid,
                lid
            );
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(period, token.clone(), tick));
        tasks.insert(key, RegisteredTask { lid, token, handle });
        true
    }

    /// Cancels the task under `key`. Once this returns the task starts no
    /// further ticks; a tick already running finishes on its own.
    pub async fn deregister(&self, key: &TaskKey) -> bool {
        match self.tasks.lock().await.remove(key) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, key: &TaskKey) -> bool {
        self.tasks.lock().await.contains_key(key)
    }

    pub async fn session_of(&self, key: &TaskKey) -> Option<i64> {
        self.tasks.lock().await.get(key).map(|task| task.lid)
    }

    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().await.keys().map(TaskKey::name).collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (key, task) in tasks.drain() {
            debug!("Cancelling task {}", key.name());
            task.token.cancel();
        }
    }
}

async fn run_periodic<F, Fut>(period: Duration, token: CancellationToken, tick: F)
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        // Runs outside the select so a stop never aborts a write half-way.
        tick(token.clone()).await;
    }
}

impl SyncEngine {
    /// Ensures chat-sync and consume-sync run for `anchor` on session `lid`.
    pub async fn start_sync_tasks(&self, anchor: &anchor::Model, lid: i64) {
        let target = SyncTarget {
            anchor_uid: anchor.uid,
            anchor_name: anchor.name.clone(),
            lid,
        };

        for kind in TaskKind::ALL {
            let key = TaskKey::new(anchor.uid, kind);
            let engine = self.clone();
            let task_target = target.clone();

            let started = self
                .tasks
                .register(key, lid, self.settings.sync_interval, move |token| {
                    let engine = engine.clone();
                    let target = task_target.clone();
                    async move { engine.run_sync_tick(kind, &target, &token).await }
                })
                .await;

            if started {
                info!(
                    "Started task {} for {} (session {})",
                    key.name(),
                    anchor.name,
                    lid
                );
            }
        }
    }

    /// Stops both sync tasks of an anchor; a no-op when none are running.
    pub async fn stop_sync_tasks(&self, anchor_uid: i64, anchor_name: &str) {
        for kind in TaskKind::ALL {
            let key = TaskKey::new(anchor_uid, kind);
            if self.tasks.deregister(&key).await {
                info!("Stopped task {} for {}", key.name(), anchor_name);
            }
        }
    }

    /// One tick of a sync task. Errors stay here so the next tick still runs.
    async fn run_sync_tick(&self, kind: TaskKind, target: &SyncTarget, token: &CancellationToken) {
        match kind {
            TaskKind::Chat => match self.sync_chat(target, token).await {
                Ok(queued) => debug!("Queued {} chats for {}", queued, target.anchor_name),
                Err(e) => error!(
                    "Chat sync failed for {} (session {}): {}",
                    target.anchor_name, target.lid, e
                ),
            },
            TaskKind::Consume => match self.sync_consume(target, token).await {
                Ok(Some(beans)) => debug!("Session {} beans now {}", target.lid, beans),
                Ok(None) => debug!("Consume sync for {} stopped early", target.anchor_name),
                Err(e) => error!(
                    "Consume sync failed for {} (session {}): {}",
                    target.anchor_name, target.lid, e
                ),
            },
        }
    }
}
