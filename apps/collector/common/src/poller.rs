use crate::blued::AnchorInfo;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use chrono::{Duration, Utc};
use entity::{anchor, live};
use futures::future::join_all;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parses the platform's `hh:mm:ss` session age. `mm:ss` is accepted too.
/// Values that do not fit a `Duration` are rejected.
pub fn parse_elapsed(value: &str) -> Option<Duration> {
    let parts = value
        .trim()
        .split(':')
        .map(|part| part.trim().parse::<i64>().ok().filter(|v| *v >= 0))
        .collect::<Option<Vec<i64>>>()?;

    let seconds = match parts.as_slice() {
        [h, m, s] => h
            .checked_mul(3600)?
            .checked_add(m.checked_mul(60)?)?
            .checked_add(*s)?,
        [m, s] => m.checked_mul(60)?.checked_add(*s)?,
        _ => return None,
    };
    Duration::try_seconds(seconds)
}

fn lock_checking(checking: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    checking.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An anchor's claim on `SyncEngine::checking`, released on drop.
struct CheckSlot<'a> {
    checking: &'a Mutex<HashSet<i64>>,
    uid: i64,
}

impl Drop for CheckSlot<'_> {
    fn drop(&mut self) {
        lock_checking(self.checking).remove(&self.uid);
    }
}

impl SyncEngine {
    /// Runs the live check cycle every `poll_interval` until `shutdown`
    /// fires. Cycles still running are awaited before every sync task is
    /// cancelled, so none can start a task after shutdown.
    pub async fn run_poller(&self, shutdown: CancellationToken) {
        let mut cycles = JoinSet::new();
        let mut check_interval = tokio::time::interval(self.settings.poll_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Live poller started (every {:?})",
            self.settings.poll_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check_interval.tick() => {
                    while cycles.try_join_next().is_some() {}

                    // Spawned so a slow cycle never delays the next tick.
                    let engine = self.clone();
                    cycles.spawn(async move {
                        if let Err(e) = engine.poll_once().await {
                            error!("Live check cycle failed: {}", e);
                        }
                    });
                }
            }
        }

        if !cycles.is_empty() {
            info!("Waiting for {} live check cycle(s) to finish", cycles.len());
        }
        while cycles.join_next().await.is_some() {}

        self.tasks.shutdown().await;
        info!("Live poller stopped");
    }

    /// One pass over the registry. Anchors are checked concurrently and a
    /// failure for one never affects the others.
    pub async fn poll_once(&self) -> Result<(), SyncError> {
        let (deleted, tracked): (Vec<_>, Vec<_>) = anchor::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .partition(|anchor| anchor.deleted);

        for anchor in &deleted {
            self.stop_sync_tasks(anchor.uid, &anchor.name).await;
        }

        info!("Starting live check cycle for {} anchors", tracked.len());
        join_all(tracked.iter().map(|anchor| self.check_anchor(anchor))).await;

        Ok(())
    }

    /// Claims `uid` for one live check. `None` while an earlier cycle is
    /// still checking the same anchor.
    fn claim_check(&self, uid: i64) -> Option<CheckSlot<'_>> {
        lock_checking(&self.checking)
            .insert(uid)
            .then(|| CheckSlot {
                checking: &self.checking,
                uid,
            })
    }

    async fn check_anchor(&self, anchor: &anchor::Model) {
        let Some(_slot) = self.claim_check(anchor.uid) else {
            debug!("Previous check of {} still running, skipping", anchor.name);
            return;
        };

        let is_live = self.check_live_status(anchor).await;
        debug!("Checked status for {}: is_live={}", anchor.name, is_live);

        if is_live {
            if let Err(e) = self.handle_live_anchor(anchor).await {
                error!("Failed to handle live anchor {}: {}", anchor.name, e);
            }
        } else {
            self.stop_sync_tasks(anchor.uid, &anchor.name).await;
        }
    }

    /// Asks the platform and records a changed status. A failed check counts
    /// as offline for this cycle only and leaves the stored flag untouched.
    async fn check_live_status(&self, anchor: &anchor::Model) -> bool {
        let is_live = match self.api.check_live_status(anchor.uid).await {
            Ok(is_live) => is_live,
            Err(e) => {
                warn!("Failed to check live status of {}: {}", anchor.name, e);
                return false;
            }
        };

        if anchor.is_live != is_live {
            let mut model: anchor::ActiveModel = anchor.clone().into();
            model.is_live = Set(is_live);
            model.updated_at = Set(Utc::now());
            if let Err(e) = model.update(&self.db).await {
                warn!("Failed to store live status of {}: {}", anchor.name, e);
            }
        }

        is_live
    }

    async fn handle_live_anchor(&self, anchor: &anchor::Model) -> Result<(), SyncError> {
        let info = self
            .api
            .get_anchor_info(anchor.uid)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("anchor {}", anchor.uid)))?;

        let Some(lid) = info.live_session_id else {
            debug!("{} is live but reports no session yet", anchor.name);
            return Ok(());
        };

        let known = live::Entity::find()
            .filter(live::Column::Lid.eq(lid))
            .one(&self.db)
            .await?;
        if known.is_none() {
            self.open_session(anchor, lid, &info).await?;
        }

        // The anchor may have been unsubscribed while we were talking to
        // the platform.
        let current = anchor::Entity::find_by_id(anchor.id).one(&self.db).await?;
        if current.is_none_or(|a| a.deleted) {
            self.stop_sync_tasks(anchor.uid, &anchor.name).await;
            return Ok(());
        }

        self.start_sync_tasks(anchor, lid).await;
        Ok(())
    }

    /// First sighting of a session: snapshot the anchor's lifetime beans and
    /// create the Live row back-dated to the session start.
    async fn open_session(
        &self,
        anchor: &anchor::Model,
        lid: i64,
        info: &AnchorInfo,
    ) -> Result<(), SyncError> {
        match self.capture_total_beans(lid).await {
            Ok(total_beans) => {
                let mut model: anchor::ActiveModel = anchor.clone().into();
                model.total_beans = Set(Some(total_beans));
                model.updated_at = Set(Utc::now());
                model.update(&self.db).await?;
            }
            Err(e) => error!("Failed to enter {}'s live room: {}", anchor.name, e),
        }

        let elapsed = info
            .session_elapsed
            .as_deref()
            .and_then(parse_elapsed)
            .unwrap_or_else(|| {
                warn!(
                    "Unreadable session age {:?} for {}, using now",
                    info.session_elapsed, anchor.name
                );
                Duration::zero()
            });

        let now = Utc::now();
        let started_at = now.checked_sub_signed(elapsed).unwrap_or_else(|| {
            warn!(
                "Session age {:?} for {} is out of range, using now",
                info.session_elapsed, anchor.name
            );
            now
        });

        let session = live::ActiveModel {
            lid: Set(lid),
            link: Set(info.live_link.clone().unwrap_or_default()),
            beans: Set(0),
            anchor_id: Set(anchor.id),
            created_at: Set(started_at),
            updated_at: Set(now),
            ..Default::default()
        };

        let inserted = live::Entity::insert(session)
            .on_conflict(OnConflict::column(live::Column::Lid).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        if inserted > 0 {
            info!("🎉 {} went live (session {})", anchor.name, lid);
        }
        Ok(())
    }

    async fn capture_total_beans(&self, lid: i64) -> Result<i64, SyncError> {
        let enter = self.api.enter_session(lid).await?;
        if let Err(e) = self.api.leave_session(lid).await {
            warn!("Failed to leave live room {}: {}", lid, e);
        }
        Ok(enter.cumulative_contributions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TaskKey, TaskKind};
    use crate::test_support::*;
    use sea_orm::PaginatorTrait;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_parse_elapsed() {
        assert_eq!(parse_elapsed("01:02:03"), Some(Duration::seconds(3723)));
        assert_eq!(parse_elapsed("05:07"), Some(Duration::seconds(307)));
        assert_eq!(parse_elapsed("00:00:00"), Some(Duration::zero()));
        assert_eq!(parse_elapsed("abc"), None);
        assert_eq!(parse_elapsed("1:-2:3"), None);
        assert_eq!(parse_elapsed(""), None);
        assert_eq!(parse_elapsed("9999999999999999:00:00"), None);
        assert_eq!(parse_elapsed("00:9223372036854775807:00"), None);
        assert_eq!(parse_elapsed("0:0:9223372036854775807"), None);
        assert_eq!(
            parse_elapsed("2777777777:00:00"),
            Some(Duration::seconds(9_999_999_997_200))
        );
    }

    #[tokio::test]
    async fn test_live_offline_live_creates_session_once() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        let anchor = insert_anchor(&db, 100, "anchor").await;

        api.set_live(100, true);
        api.set_info(100, live_info("anchor", 5000, "00:10:00"));
        api.set_enter_beans(5000, 12345);

        engine.poll_once().await.unwrap();

        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 1);
        assert_eq!(api.enter_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.leave_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.tasks().len().await, 2);

        let stored = reload_anchor(&db, anchor.id).await;
        assert!(stored.is_live);
        assert_eq!(stored.total_beans, Some(12345));

        let session = find_live(&db, 5000).await;
        let age = Utc::now() - session.created_at;
        assert!(age >= Duration::minutes(10) && age < Duration::minutes(11));

        api.set_live(100, false);
        engine.poll_once().await.unwrap();
        assert!(engine.tasks().is_empty().await);
        assert!(!reload_anchor(&db, anchor.id).await.is_live);

        api.set_live(100, true);
        engine.poll_once().await.unwrap();
        engine.poll_once().await.unwrap();

        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 1);
        assert_eq!(api.enter_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.tasks().len().await, 2);
        assert!(engine.tasks().is_registered(&TaskKey::new(100, TaskKind::Chat)).await);
        assert!(engine.tasks().is_registered(&TaskKey::new(100, TaskKind::Consume)).await);
    }

    #[tokio::test]
    async fn test_existing_session_skips_enter() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        let anchor = insert_anchor(&db, 100, "anchor").await;
        insert_live(&db, &anchor, 5000).await;

        api.set_live(100, true);
        api.set_info(100, live_info("anchor", 5000, "00:10:00"));

        engine.poll_once().await.unwrap();

        assert_eq!(api.enter_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.leave_calls.load(Ordering::SeqCst), 0);
        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 1);
        assert_eq!(engine.tasks().len().await, 2);
    }

    #[tokio::test]
    async fn test_deleted_anchor_loses_tasks_within_one_cycle() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        let anchor = insert_anchor(&db, 100, "anchor").await;

        api.set_live(100, true);
        engine.start_sync_tasks(&anchor, 5000).await;
        assert_eq!(engine.tasks().len().await, 2);

        let mut model: anchor::ActiveModel = anchor.into();
        model.deleted = Set(true);
        model.update(&db).await.unwrap();

        engine.poll_once().await.unwrap();

        assert!(engine.tasks().is_empty().await);
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_failure_is_isolated() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());

        let failing = insert_anchor(&db, 1, "failing").await;
        let mut model: anchor::ActiveModel = failing.clone().into();
        model.is_live = Set(true);
        model.update(&db).await.unwrap();
        insert_anchor(&db, 2, "healthy").await;

        api.fail_status(1);
        api.set_live(2, true);
        api.set_info(2, live_info("healthy", 7000, "00:00:30"));

        engine.poll_once().await.unwrap();

        assert!(!engine.tasks().is_registered(&TaskKey::new(1, TaskKind::Chat)).await);
        assert!(engine.tasks().is_registered(&TaskKey::new(2, TaskKind::Chat)).await);
        // The failed check must not overwrite the stored status.
        assert!(reload_anchor(&db, failing.id).await.is_live);
    }

    #[tokio::test]
    async fn test_live_without_session_starts_nothing() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        insert_anchor(&db, 100, "anchor").await;

        api.set_live(100, true);
        api.set_info(100, offline_info("anchor"));

        engine.poll_once().await.unwrap();

        assert!(engine.tasks().is_empty().await);
        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_session_age_is_isolated() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        insert_anchor(&db, 1, "ancient").await;
        insert_anchor(&db, 2, "healthy").await;

        api.set_live(1, true);
        api.set_info(1, live_info("ancient", 6000, "2777777777:00:00"));
        api.set_live(2, true);
        api.set_info(2, live_info("healthy", 7000, "00:00:30"));

        engine.poll_once().await.unwrap();

        let session = find_live(&db, 6000).await;
        assert!(Utc::now() - session.created_at < Duration::minutes(1));
        assert!(engine.tasks().is_registered(&TaskKey::new(1, TaskKind::Chat)).await);
        assert!(engine.tasks().is_registered(&TaskKey::new(2, TaskKind::Chat)).await);
        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_cycles_enter_once() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        insert_anchor(&db, 100, "anchor").await;

        api.set_live(100, true);
        api.set_info(100, live_info("anchor", 5000, "00:10:00"));

        let (first, second) = tokio::join!(engine.poll_once(), engine.poll_once());
        first.unwrap();
        second.unwrap();

        assert_eq!(api.enter_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.leave_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live::Entity::find().count(&db).await.unwrap(), 1);
        assert_eq!(engine.tasks().len().await, 2);

        // The claim is released once the cycle is done.
        api.set_live(100, false);
        engine.poll_once().await.unwrap();
        assert!(engine.tasks().is_empty().await);
    }

    #[tokio::test]
    async fn test_poller_shutdown_waits_for_running_cycle() {
        let db = test_db().await;
        let api = FakeBlued::new();
        let (engine, _jobs) = test_engine(db.clone(), api.clone());
        insert_anchor(&db, 100, "anchor").await;

        api.set_live(100, true);
        api.set_info(100, live_info("anchor", 5000, "00:10:00"));

        let shutdown = CancellationToken::new();
        let poller = tokio::spawn({
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            async move { engine.run_poller(shutdown).await }
        });

        // Stop while the first cycle is mid-way through the anchor.
        while api.status_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        poller.await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(engine.tasks().is_empty().await);
    }
}
