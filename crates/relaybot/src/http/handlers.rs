use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use relaycore::presence::PresenceEntry;
use relaycore::{RelayEvent, UserId, UserSnapshot, WebAppSubmission};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::error::ApiError;
use super::AppState;

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Query string of the delivery endpoints (`?user_id=`).
#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

impl UserQuery {
    /// Parsed user id, `None` when the parameter is absent or blank.
    pub fn user(&self) -> Result<Option<UserId>, ApiError> {
        match self.user_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Ok(Some(raw.parse()?)),
        }
    }

    pub fn require_user(&self) -> Result<UserId, ApiError> {
        self.user()?.ok_or_else(|| ApiError::BadRequest("no user_id".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    #[serde(default)]
    pub data: Value,
}

#[derive(Serialize)]
struct PollBody {
    user_id: UserId,
    items: Vec<RelayEvent>,
}

#[derive(Serialize)]
struct ActiveBody {
    count: usize,
    active: usize,
    users: Vec<PresenceEntry>,
}

/// Wraps a serializable body as `{"ok": true, ...fields}`.
fn ok<T: Serialize>(body: T) -> ApiResult {
    let mut value = serde_json::to_value(body).map_err(|e| ApiError::Internal(e.to_string()))?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("ok".to_string(), Value::Bool(true));
            Ok(Json(value))
        }
        None => Ok(Json(json!({ "ok": true, "data": value }))),
    }
}

fn user_from_path(raw: &str) -> Result<UserId, ApiError> {
    Ok(raw.parse::<UserId>()?)
}

// ==================== Service ====================

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "time": Utc::now().to_rfc3339(),
        "mode": state.mode,
    }))
}

/// GET /miniapp-url
pub async fn miniapp_url(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "url": state.links.url,
        "api": state.links.api,
        "static": state.links.static_url,
    }))
}

// ==================== Ingestion ====================

/// POST /webapp-data - Mini App submission
pub async fn webapp_data(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WebAppSubmission>, JsonRejection>,
) -> ApiResult {
    let Json(submission) = body?;
    let receipt = state.relay.ingest_webapp(submission).await?;
    ok(receipt)
}

/// POST /api/data/{category} - bot batch, single record or scalar
pub async fn ingest_category(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
    body: Result<Json<IngestBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let receipt = state.relay.ingest_bot_data(&category, body.data)?;
    ok(receipt)
}

/// POST /api/users/{user_id}/snapshot
pub async fn post_snapshot(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    body: Result<Json<UserSnapshot>, JsonRejection>,
) -> ApiResult {
    let user = user_from_path(&user_id)?;
    let Json(snapshot) = body?;
    ok(state.relay.ingest_user_snapshot(user, snapshot))
}

// ==================== Queries ====================

/// GET /api/data - every category plus stats
pub async fn dump(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.relay.dump())
}

/// GET /api/data/{category}
pub async fn get_category(State(state): State<Arc<AppState>>, Path(category): Path<String>) -> ApiResult {
    ok(state.relay.category(&category)?)
}

/// GET /api/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult {
    ok(state.relay.stats())
}

/// GET /api/users/{user_id}/snapshot - 404 when missing or stale
pub async fn get_snapshot(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult {
    let user = user_from_path(&user_id)?;
    let snapshot = state
        .relay
        .cached_snapshot(user)
        .ok_or_else(|| ApiError::NotFound(format!("no fresh snapshot for user {}", user)))?;
    ok(json!({ "user_id": user, "snapshot": snapshot }))
}

/// GET /api/users/active
pub async fn active_users(State(state): State<Arc<AppState>>) -> ApiResult {
    let users = state.relay.active_users();
    ok(ActiveBody {
        count: users.len(),
        active: users.iter().filter(|u| u.is_active).count(),
        users,
    })
}

// ==================== Commands ====================

/// POST /api/users/{user_id}/register
pub async fn register(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult {
    let user = user_from_path(&user_id)?;
    state.relay.register(user);
    ok(json!({ "user_id": user, "active": true }))
}

/// POST /api/users/{user_id}/heartbeat - unknown users are not an error
pub async fn heartbeat(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult {
    let user = user_from_path(&user_id)?;
    let known = state.relay.heartbeat(user);
    ok(json!({ "user_id": user, "known": known }))
}

/// DELETE /api/data
pub async fn clear_all(State(state): State<Arc<AppState>>) -> ApiResult {
    state.relay.clear(None)?;
    info!("cache cleared via API");
    ok(json!({ "cleared": "all" }))
}

/// DELETE /api/data/{category}
pub async fn clear_category(State(state): State<Arc<AppState>>, Path(category): Path<String>) -> ApiResult {
    state.relay.clear(Some(&category))?;
    ok(json!({ "cleared": category }))
}

// ==================== Delivery ====================

/// GET /poll?user_id= - drains the pending queue
pub async fn poll(State(state): State<Arc<AppState>>, query: Result<Query<UserQuery>, QueryRejection>) -> ApiResult {
    let Query(query) = query?;
    let user = query.require_user()?;
    let items = state.relay.poll(user);
    ok(PollBody {
        user_id: user,
        items,
    })
}
