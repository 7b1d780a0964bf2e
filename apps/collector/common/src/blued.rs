use crate::error::SyncError;
use crate::recovery::RecoveryManager;
use crate::session::SessionManager;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Envelope codes the platform uses for an expired or revoked token.
const SESSION_INVALID_CODES: [i64; 3] = [401, 403, 40301];

/// Broadcaster profile as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorInfo {
    pub display_name: String,
    pub avatar: Option<String>,
    /// Present only while the anchor is broadcasting.
    pub live_session_id: Option<i64>,
    /// Time since the session started, `hh:mm:ss`.
    pub session_elapsed: Option<String>,
    pub live_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterInfo {
    /// Lifetime contribution count of the anchor.
    pub cumulative_contributions: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChat {
    pub sender_id: i64,
    pub sender_name: String,
    pub content: String,
    /// Epoch seconds.
    pub timestamp: i64,
    pub rich_level: i32,
}

/// Cumulative contribution of one viewer in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConsume {
    pub user_id: i64,
    pub user_name: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub name: String,
    pub avatar: Option<String>,
    pub is_anchor: bool,
    pub is_live: bool,
}

/// Operations the sync engine needs from the live-streaming platform.
#[async_trait]
pub trait BluedApi: Send + Sync {
    async fn check_live_status(&self, uid: i64) -> Result<bool, SyncError>;

    /// `Ok(None)` when the platform has no such user.
    async fn get_anchor_info(&self, uid: i64) -> Result<Option<AnchorInfo>, SyncError>;

    async fn enter_session(&self, lid: i64) -> Result<EnterInfo, SyncError>;

    async fn leave_session(&self, lid: i64) -> Result<(), SyncError>;

    async fn fetch_recent_chat(&self, lid: i64) -> Result<Vec<RawChat>, SyncError>;

    /// Pages start at 1. An empty page means there is nothing further.
    async fn fetch_consume_page(
        &self,
        uid: i64,
        lid: i64,
        page: u32,
    ) -> Result<Vec<RawConsume>, SyncError>;

    async fn search_users(&self, query: &str) -> Result<Vec<SearchHit>, SyncError>;

    async fn rotate_display_name(&self, name: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default, alias = "msg")]
    message: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn is_session_invalid(&self) -> bool {
        SESSION_INVALID_CODES.contains(&self.code)
    }

    fn into_data(self, path: &str) -> Result<Option<T>, SyncError> {
        if self.is_session_invalid() {
            return Err(SyncError::SessionInvalid(format!(
                "{} rejected token: {}",
                path, self.message
            )));
        }
        if self.code != 200 {
            return Err(SyncError::Transport(format!(
                "{} returned code {}: {}",
                path, self.code, self.message
            )));
        }
        Ok(self.data)
    }
}

#[derive(Debug, Deserialize)]
struct IsLiveData {
    #[serde(deserialize_with = "lenient::flag")]
    islive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnchorInfoData {
    user_info: UserInfoData,
    live_info: Option<LiveInfoData>,
}

#[derive(Debug, Deserialize)]
struct UserInfoData {
    name: String,
    avatar: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    live: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveInfoData {
    init_time: String,
    live_url: String,
}

impl From<AnchorInfoData> for AnchorInfo {
    fn from(data: AnchorInfoData) -> Self {
        let session = data
            .live_info
            .zip(data.user_info.live.filter(|lid| *lid > 0));

        let (live_session_id, session_elapsed, live_link) = match session {
            Some((live, lid)) => (
                Some(lid),
                Some(live.init_time),
                Some(normalize_link(&live.live_url)),
            ),
            None => (None, None, None),
        };

        AnchorInfo {
            display_name: data.user_info.name,
            avatar: data.user_info.avatar,
            live_session_id,
            session_elapsed,
            live_link,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnterData {
    #[serde(deserialize_with = "lenient::int")]
    beans_count: i64,
}

#[derive(Debug, Deserialize)]
struct ChatData {
    #[serde(deserialize_with = "lenient::int")]
    from_id: i64,
    from_nick_name: String,
    msg_content: String,
    #[serde(deserialize_with = "lenient::int")]
    msg_time: i64,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    from_rich_level: Option<i64>,
}

impl From<ChatData> for RawChat {
    fn from(data: ChatData) -> Self {
        RawChat {
            sender_id: data.from_id,
            sender_name: data.from_nick_name,
            content: data.msg_content,
            timestamp: data.msg_time,
            rich_level: data
                .from_rich_level
                .and_then(|level| i32::try_from(level).ok())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConsumeData {
    #[serde(deserialize_with = "lenient::int")]
    uid: i64,
    name: String,
    #[serde(deserialize_with = "lenient::int")]
    beans: i64,
}

impl From<ConsumeData> for RawConsume {
    fn from(data: ConsumeData) -> Self {
        RawConsume {
            user_id: data.uid,
            user_name: data.name,
            amount: data.beans,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(deserialize_with = "lenient::int")]
    uid: i64,
    name: String,
    avatar: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    anchor: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    live: bool,
}

impl From<SearchData> for SearchHit {
    fn from(data: SearchData) -> Self {
        SearchHit {
            id: data.uid,
            name: data.name,
            avatar: data.avatar,
            is_anchor: data.anchor,
            is_live: data.live,
        }
    }
}

/// The platform hands out protocol-relative stream links.
fn normalize_link(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{}", url)
    } else {
        url.to_string()
    }
}

/// HTTP adapter for the platform API.
pub struct BluedClient {
    client: Client,
    base_url: String,
    session: Arc<SessionManager>,
    recovery: RecoveryManager,
}

impl BluedClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        session: Arc<SessionManager>,
        recovery: RecoveryManager,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            recovery,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    async fn call<T: DeserializeOwned + Send>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>, SyncError> {
        self.recovery
            .execute(|| self.call_once(method.clone(), path, query, body))
            .await
    }

    async fn call_once<T: DeserializeOwned + Send>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>, SyncError> {
        let token = self.session.token().await?;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, &url)
            .header(AUTHORIZATION, format!("Basic {}", token))
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session.invalidate(&token).await;
            return Err(SyncError::SessionInvalid(format!(
                "{} returned {}",
                path, status
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SyncError::Transport(format!("{} returned {}", path, status)));
        }

        let envelope: Envelope<T> = response.json().await?;
        if envelope.is_session_invalid() {
            self.session.invalidate(&token).await;
        }
        envelope.into_data(path)
    }
}

#[async_trait]
impl BluedApi for BluedClient {
    async fn check_live_status(&self, uid: i64) -> Result<bool, SyncError> {
        // Public endpoint, no session needed.
        let path = format!("/live/islive/{}", uid);
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }

        let envelope: Envelope<IsLiveData> = response.json().await?;
        Ok(envelope
            .into_data(&path)?
            .map(|data| data.islive)
            .unwrap_or(false))
    }

    async fn get_anchor_info(&self, uid: i64) -> Result<Option<AnchorInfo>, SyncError> {
        let data: Option<Vec<AnchorInfoData>> = self
            .call(Method::GET, &format!("/users/{}/basic", uid), &[], None)
            .await?;

        Ok(data
            .and_then(|items| items.into_iter().next())
            .map(AnchorInfo::from))
    }

    async fn enter_session(&self, lid: i64) -> Result<EnterInfo, SyncError> {
        let data: Option<Vec<EnterData>> = self
            .call(Method::POST, &format!("/live/{}/enter", lid), &[], None)
            .await?;

        data.and_then(|items| items.into_iter().next())
            .map(|enter| EnterInfo {
                cumulative_contributions: enter.beans_count,
            })
            .ok_or_else(|| SyncError::NotFound(format!("live session {}", lid)))
    }

    async fn leave_session(&self, lid: i64) -> Result<(), SyncError> {
        self.call::<serde_json::Value>(Method::POST, &format!("/live/{}/leave", lid), &[], None)
            .await?;
        Ok(())
    }

    async fn fetch_recent_chat(&self, lid: i64) -> Result<Vec<RawChat>, SyncError> {
        let data: Option<Vec<ChatData>> = self
            .call(Method::GET, &format!("/live/{}/chats", lid), &[], None)
            .await?;

        Ok(data
            .unwrap_or_default()
            .into_iter()
            .map(RawChat::from)
            .collect())
    }

    async fn fetch_consume_page(
        &self,
        uid: i64,
        lid: i64,
        page: u32,
    ) -> Result<Vec<RawConsume>, SyncError> {
        let query = [("anchor", uid.to_string()), ("page", page.to_string())];
        let data: Option<Vec<ConsumeData>> = self
            .call(Method::GET, &format!("/live/{}/consumes", lid), &query, None)
            .await?;

        Ok(data
            .unwrap_or_default()
            .into_iter()
            .map(RawConsume::from)
            .collect())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<SearchHit>, SyncError> {
        let params = [("keyword", query.to_string())];
        let data: Option<Vec<SearchData>> = self
            .call(Method::GET, "/users/search", &params, None)
            .await?;

        Ok(data
            .unwrap_or_default()
            .into_iter()
            .map(SearchHit::from)
            .collect())
    }

    async fn rotate_display_name(&self, name: &str) -> Result<(), SyncError> {
        let body = serde_json::json!({ "name": name });
        self.call::<serde_json::Value>(Method::PUT, "/users/profile", &[], Some(&body))
            .await?;
        Ok(())
    }
}

/// The platform is inconsistent about numbers: ids and amounts arrive as
/// either JSON numbers or numeric strings, flags as bools or 0/1.
mod lenient {
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Int(i64),
        Float(f64),
        Str(String),
        Bool(bool),
    }

    fn to_i64<E: Error>(value: NumOrStr) -> Result<i64, E> {
        match value {
            NumOrStr::Int(v) => Ok(v),
            NumOrStr::Float(v) => Ok(v as i64),
            NumOrStr::Bool(v) => Ok(v as i64),
            NumOrStr::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                    .map_err(|_| E::custom(format!("expected a number, got {:?}", s)))
            }
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        to_i64(NumOrStr::deserialize(d)?)
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Option::<NumOrStr>::deserialize(d)?
            .map(to_i64)
            .transpose()
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(to_i64(NumOrStr::deserialize(d)?)? != 0)
    }
}
