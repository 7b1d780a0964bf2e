//! Shared fixtures for the in-crate tests: an in-memory database, a scripted
//! platform and row helpers.

use crate::blued::{AnchorInfo, BluedApi, EnterInfo, RawChat, RawConsume, SearchHit};
use crate::chat_log::ChatLog;
use crate::engine::{SyncEngine, SyncSettings};
use crate::error::SyncError;
use crate::queue::{IngestJob, LocalQueue};
use crate::scheduler::SyncTarget;
use crate::worker::IngestWorker;
use async_trait::async_trait;
use chrono::Utc;
use entity::{anchor, live};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub async fn test_db() -> DatabaseConnection {
    let opts = ConnectOptions::new("sqlite::memory:")
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false)
        .to_owned();
    let db = Database::connect(opts).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

#[derive(Default)]
struct FakeState {
    live: HashMap<i64, bool>,
    failing: HashSet<i64>,
    infos: HashMap<i64, AnchorInfo>,
    enter_beans: HashMap<i64, i64>,
    chats: HashMap<i64, Vec<RawChat>>,
    consume_pages: HashMap<i64, Vec<Vec<RawConsume>>>,
    cancel_after: Option<(u32, CancellationToken)>,
    search_hits: Vec<SearchHit>,
    renamed: Vec<String>,
}

/// Scripted stand-in for the platform.
#[derive(Default)]
pub struct FakeBlued {
    state: Mutex<FakeState>,
    pub status_calls: AtomicUsize,
    pub enter_calls: AtomicUsize,
    pub leave_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub consume_calls: AtomicUsize,
}

impl FakeBlued {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_live(&self, uid: i64, is_live: bool) {
        self.state().live.insert(uid, is_live);
    }

    pub fn fail_status(&self, uid: i64) {
        self.state().failing.insert(uid);
    }

    pub fn set_info(&self, uid: i64, info: AnchorInfo) {
        self.state().infos.insert(uid, info);
    }

    pub fn set_enter_beans(&self, lid: i64, beans: i64) {
        self.state().enter_beans.insert(lid, beans);
    }

    pub fn set_chats(&self, lid: i64, chats: Vec<RawChat>) {
        self.state().chats.insert(lid, chats);
    }

    pub fn set_consume_pages(&self, lid: i64, pages: Vec<Vec<RawConsume>>) {
        self.state().consume_pages.insert(lid, pages);
    }

    /// Cancels `token` right after serving consume page `page`.
    pub fn cancel_after_consume_page(&self, page: u32, token: CancellationToken) {
        self.state().cancel_after = Some((page, token));
    }

    pub fn set_search_hits(&self, hits: Vec<SearchHit>) {
        self.state().search_hits = hits;
    }

    pub fn renamed(&self) -> Vec<String> {
        self.state().renamed.clone()
    }
}

#[async_trait]
impl BluedApi for FakeBlued {
    async fn check_live_status(&self, uid: i64) -> Result<bool, SyncError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing.contains(&uid) {
            return Err(SyncError::Transport("connection reset".to_string()));
        }
        Ok(state.live.get(&uid).copied().unwrap_or(false))
    }

    async fn get_anchor_info(&self, uid: i64) -> Result<Option<AnchorInfo>, SyncError> {
        Ok(self.state().infos.get(&uid).cloned())
    }

    async fn enter_session(&self, lid: i64) -> Result<EnterInfo, SyncError> {
        self.enter_calls.fetch_add(1, Ordering::SeqCst);
        Ok(EnterInfo {
            cumulative_contributions: self.state().enter_beans.get(&lid).copied().unwrap_or(0),
        })
    }

    async fn leave_session(&self, _lid: i64) -> Result<(), SyncError> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_recent_chat(&self, lid: i64) -> Result<Vec<RawChat>, SyncError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().chats.get(&lid).cloned().unwrap_or_default())
    }

    async fn fetch_consume_page(
        &self,
        _uid: i64,
        lid: i64,
        page: u32,
    ) -> Result<Vec<RawConsume>, SyncError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();

        if let Some((after, token)) = &state.cancel_after {
            if *after == page {
                token.cancel();
            }
        }

        Ok(state
            .consume_pages
            .get(&lid)
            .and_then(|pages| pages.get(page as usize - 1))
            .cloned()
            .unwrap_or_default())
    }

    async fn search_users(&self, _query: &str) -> Result<Vec<SearchHit>, SyncError> {
        Ok(self.state().search_hits.clone())
    }

    async fn rotate_display_name(&self, name: &str) -> Result<(), SyncError> {
        self.state().renamed.push(name.to_string());
        Ok(())
    }
}

/// Engine wired to `api` and an in-process queue. Sync tasks use an hour
/// long period so they never tick on their own during a test.
pub fn test_engine(
    db: DatabaseConnection,
    api: Arc<FakeBlued>,
) -> (SyncEngine, UnboundedReceiver<IngestJob>) {
    let (queue, jobs) = LocalQueue::new();
    let settings = SyncSettings {
        poll_interval: Duration::from_secs(3600),
        sync_interval: Duration::from_secs(3600),
        max_consume_pages: 4,
    };
    (SyncEngine::new(db, api, Arc::new(queue), settings), jobs)
}

pub fn test_worker(db: DatabaseConnection) -> IngestWorker {
    let chat_log = ChatLog::new(slog::Logger::root(slog::Discard, slog::o!()));
    IngestWorker::new(db, Arc::new(chat_log))
}

/// Stores every job waiting in `jobs`.
pub async fn drain_jobs(worker: &IngestWorker, jobs: &mut UnboundedReceiver<IngestJob>) {
    while let Ok(job) = jobs.try_recv() {
        worker.handle(&job).await.unwrap();
    }
}

pub async fn insert_anchor(db: &DatabaseConnection, uid: i64, name: &str) -> anchor::Model {
    let now = Utc::now();
    anchor::ActiveModel {
        uid: Set(uid),
        name: Set(name.to_string()),
        avatar: Set(None),
        is_live: Set(false),
        deleted: Set(false),
        total_beans: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

pub async fn insert_live(db: &DatabaseConnection, anchor: &anchor::Model, lid: i64) -> live::Model {
    let now = Utc::now();
    live::ActiveModel {
        lid: Set(lid),
        link: Set(format!("https://live.example/{}", lid)),
        beans: Set(0),
        anchor_id: Set(anchor.id),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

pub async fn reload_anchor(db: &DatabaseConnection, id: i32) -> anchor::Model {
    anchor::Entity::find_by_id(id).one(db).await.unwrap().unwrap()
}

pub async fn find_live(db: &DatabaseConnection, lid: i64) -> live::Model {
    live::Entity::find()
        .filter(live::Column::Lid.eq(lid))
        .one(db)
        .await
        .unwrap()
        .unwrap()
}

pub fn live_info(name: &str, lid: i64, elapsed: &str) -> AnchorInfo {
    AnchorInfo {
        display_name: name.to_string(),
        avatar: None,
        live_session_id: Some(lid),
        session_elapsed: Some(elapsed.to_string()),
        live_link: Some(format!("https://live.example/{}", lid)),
    }
}

pub fn offline_info(name: &str) -> AnchorInfo {
    AnchorInfo {
        display_name: name.to_string(),
        avatar: None,
        live_session_id: None,
        session_elapsed: None,
        live_link: None,
    }
}

pub fn raw_chat(sender_id: i64, sender_name: &str, content: &str, timestamp: i64) -> RawChat {
    RawChat {
        sender_id,
        sender_name: sender_name.to_string(),
        content: content.to_string(),
        timestamp,
        rich_level: 1,
    }
}

pub fn raw_consume(user_id: i64, user_name: &str, amount: i64) -> RawConsume {
    RawConsume {
        user_id,
        user_name: user_name.to_string(),
        amount,
    }
}

pub fn target_for(anchor: &anchor::Model, lid: i64) -> SyncTarget {
    SyncTarget {
        anchor_uid: anchor.uid,
        anchor_name: anchor.name.clone(),
        lid,
    }
}
