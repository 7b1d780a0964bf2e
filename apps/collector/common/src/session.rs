use crate::error::SyncError;
use async_trait::async_trait;
use chrono::Utc;
use entity::system_setting;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle of the shared platform session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active(String),
    Invalid,
}

/// Where a fresh auth token comes from when the session is (re-)established.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn load_token(&self) -> Result<Option<String>, SyncError>;
}

/// Reads the token from `system_settings`, falling back to a static token.
pub struct SettingsTokenSource {
    db: DatabaseConnection,
    key: String,
    fallback: Option<String>,
}

impl SettingsTokenSource {
    pub fn new(db: DatabaseConnection, key: String, fallback: Option<String>) -> Self {
        Self { db, key, fallback }
    }
}

#[async_trait]
impl TokenSource for SettingsTokenSource {
    async fn load_token(&self) -> Result<Option<String>, SyncError> {
        let setting = system_setting::Entity::find()
            .filter(system_setting::Column::Key.eq(self.key.as_str()))
            .one(&self.db)
            .await?;

        Ok(setting.map(|s| s.value).or_else(|| self.fallback.clone()))
    }
}

/// Stores `token` under `key`, replacing any previous value.
pub async fn set_auth_token(
    db: &DatabaseConnection,
    key: &str,
    token: &str,
) -> Result<(), SyncError> {
    let setting = system_setting::ActiveModel {
        key: Set(key.to_string()),
        value: Set(token.to_string()),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };

    system_setting::Entity::insert(setting)
        .on_conflict(
            OnConflict::column(system_setting::Column::Key)
                .update_columns([
                    system_setting::Column::Value,
                    system_setting::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

/// Owns the single authenticated session shared by every platform call.
///
/// The token is loaded lazily. The state lock is held while loading, so
/// concurrent callers that find the session missing wait for one load
/// instead of each starting their own.
pub struct SessionManager {
    state: Mutex<SessionState>,
    source: Arc<dyn TokenSource>,
}

impl SessionManager {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            source,
        }
    }

    pub async fn token(&self) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;

        match &*state {
            SessionState::Active(token) => return Ok(token.clone()),
            SessionState::Invalid => info!("Re-establishing platform session"),
            SessionState::Uninitialized => info!("Initializing platform session"),
        }

        match self.source.load_token().await? {
            Some(token) if !token.trim().is_empty() => {
                *state = SessionState::Active(token.clone());
                Ok(token)
            }
            _ => Err(SyncError::SessionInvalid(
                "no platform auth token configured".to_string(),
            )),
        }
    }

    /// Marks the session invalid if `stale` is still the active token.
    /// Returns false when another caller already replaced or dropped it.
    pub async fn invalidate(&self, stale: &str) -> bool {
        let mut state = self.state.lock().await;
        match &*state {
            SessionState::Active(token) if token == stale => {
                warn!("Platform rejected the session token, marking session invalid");
                *state = SessionState::Invalid;
                true
            }
            _ => false,
        }
    }

    /// Drops the current token so the next call reloads it.
    pub async fn reset(&self) {
        *self.state.lock().await = SessionState::Uninitialized;
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        loads: AtomicUsize,
        token: std::sync::Mutex<Option<String>>,
    }

    impl CountingSource {
        fn new(token: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                token: std::sync::Mutex::new(token.map(str::to_string)),
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn load_token(&self) -> Result<Option<String>, SyncError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.token.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let source = CountingSource::new(Some("token-a"));
        let session = Arc::new(SessionManager::new(source.clone()));

        let calls = (0..8).map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.token().await })
        });
        for call in futures::future::join_all(calls).await {
            assert_eq!(call.unwrap().unwrap(), "token-a");
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_triggers_reload() {
        let source = CountingSource::new(Some("token-a"));
        let session = SessionManager::new(source.clone());

        let token = session.token().await.unwrap();
        *source.token.lock().unwrap() = Some("token-b".to_string());

        assert!(session.invalidate(&token).await);
        assert_eq!(session.state().await, SessionState::Invalid);
        assert_eq!(session.token().await.unwrap(), "token-b");
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_invalidation_keeps_fresh_token() {
        let source = CountingSource::new(Some("token-a"));
        let session = SessionManager::new(source.clone());

        let stale = session.token().await.unwrap();
        assert!(session.invalidate(&stale).await);
        *source.token.lock().unwrap() = Some("token-b".to_string());
        session.token().await.unwrap();

        // A late failure carrying the old token must not drop the new one.
        assert!(!session.invalidate(&stale).await);
        assert_eq!(
            session.state().await,
            SessionState::Active("token-b".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_session_error() {
        let session = SessionManager::new(CountingSource::new(None));
        assert!(matches!(
            session.token().await,
            Err(SyncError::SessionInvalid(_))
        ));
        assert_eq!(session.state().await, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_settings_source_prefers_stored_token() {
        let db = test_db().await;
        let source = SettingsTokenSource::new(
            db.clone(),
            "blued-auth".to_string(),
            Some("from-config".to_string()),
        );
        assert_eq!(source.load_token().await.unwrap().as_deref(), Some("from-config"));

        set_auth_token(&db, "blued-auth", "first").await.unwrap();
        set_auth_token(&db, "blued-auth", "second").await.unwrap();
        assert_eq!(source.load_token().await.unwrap().as_deref(), Some("second"));

        let rows = system_setting::Entity::find().all(&db).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
