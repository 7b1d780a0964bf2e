//! Subscription HTTP API.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::session::{SessionManager, set_auth_token};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct ApiState {
    pub engine: SyncEngine,
    pub session: Arc<SessionManager>,
    /// Settings key of the platform token; callers of `/blued-auth` must
    /// present it.
    pub auth_key: String,
}

impl ResponseError for SyncError {
    fn status_code(&self) -> StatusCode {
        match self {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Forbidden(_) => StatusCode::FORBIDDEN,
            SyncError::SessionInvalid(_) | SyncError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[derive(Debug, Deserialize)]
pub struct AddAnchorQuery {
    pub uid: Option<i64>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub auth: String,
    pub key: String,
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": Utc::now()
    }))
}

async fn add_anchor(
    state: web::Data<ApiState>,
    query: web::Query<AddAnchorQuery>,
) -> Result<HttpResponse, SyncError> {
    let anchor = match (query.uid, query.name.as_deref()) {
        (Some(uid), _) => state.engine.add_anchor_by_uid(uid).await?,
        (None, Some(name)) => state.engine.add_anchor_by_name(name).await?,
        (None, None) => {
            return Err(SyncError::Validation(
                "either uid or name is required".to_string(),
            ));
        }
    };
    Ok(HttpResponse::Ok().json(anchor))
}

async fn list_anchors(state: web::Data<ApiState>) -> Result<HttpResponse, SyncError> {
    Ok(HttpResponse::Ok().json(state.engine.list_anchors().await?))
}

async fn anchor_detail(
    state: web::Data<ApiState>,
    uid: web::Path<i64>,
) -> Result<HttpResponse, SyncError> {
    Ok(HttpResponse::Ok().json(state.engine.anchor_detail(uid.into_inner()).await?))
}

async fn remove_anchor(
    state: web::Data<ApiState>,
    uid: web::Path<i64>,
) -> Result<HttpResponse, SyncError> {
    Ok(HttpResponse::Ok().json(state.engine.remove_anchor(uid.into_inner()).await?))
}

async fn consume_summary(
    state: web::Data<ApiState>,
    lid: web::Path<i64>,
) -> Result<HttpResponse, SyncError> {
    Ok(HttpResponse::Ok().json(state.engine.consume_summary(lid.into_inner()).await?))
}

async fn set_auth(
    state: web::Data<ApiState>,
    body: web::Json<AuthRequest>,
) -> Result<HttpResponse, SyncError> {
    if body.key != state.auth_key {
        return Err(SyncError::Forbidden("invalid key".to_string()));
    }
    if body.auth.trim().is_empty() {
        return Err(SyncError::Validation("auth must not be empty".to_string()));
    }

    set_auth_token(state.engine.db(), &state.auth_key, body.auth.trim()).await?;
    state.session.reset().await;
    info!("Platform auth token updated");

    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

/// Registers every route. `/blued/anchors` has to come before `/blued/{uid}`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/blued-auth", web::post().to(set_auth))
        .service(
            web::scope("/blued")
                .route("", web::get().to(add_anchor))
                .route("/anchors", web::get().to(list_anchors))
                .route("/consume/{lid}", web::get().to(consume_summary))
                .route("/{uid}", web::get().to(anchor_detail))
                .route("/{uid}", web::delete().to(remove_anchor)),
        );
}
