//! HTTP request handlers
//!
//! Thin controllers: parse the request, call into the monitor/pool/repos and
//! wrap the result in the JSON envelope. The proxy endpoint is the one
//! exception with real logic — it resolves the client path against the
//! manager's current stream URL and streams the upstream body back.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::str::FromStr;
use tracing::{debug, info};

use crate::errors::{AppError, StreamError};
use crate::models::{
    ConfigUpdateRequest, Platform, Room, RoomAddRequest, RoomUpdateRequest,
};
use crate::streamers;

use super::responses::{ok, ok_message};
use super::AppState;

/// Proxy playlist path handed out for every new room; `{id}` is filled in by
/// the repository once the row id exists.
const PROXY_PATH_TEMPLATE: &str = "/proxy/{id}/index.m3u8";

pub async fn list_rooms(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let rooms = state.room_repo.list_rooms().await?;
    Ok(ok(rooms))
}

pub async fn add_room(
    State(state): State<AppState>,
    Json(request): Json<RoomAddRequest>,
) -> Result<impl IntoResponse, AppError> {
    let platform = Platform::from_str(&request.platform)
        .map_err(|_| StreamError::InvalidPlatform(request.platform.clone()))?;

    let info = streamers::room_add_info(&state.fetcher, platform, &request.rid).await?;
    if let Some(existing) = state.room_repo.find_room(platform, &info.real_id).await? {
        return Err(AppError::validation(format!(
            "room already exists, proxy URL: {}",
            existing.proxy_url
        )));
    }

    let template = format!("{}{}", state.config.web.base_url, PROXY_PATH_TEMPLATE);
    let room = state
        .room_repo
        .insert_room(&info, request.record_enabled, &template)
        .await?;
    info!("room {} added ({} {})", room.id, room.platform, room.real_id);

    // Let the monitor pick the room up without waiting for the next tick.
    state.monitor.trigger_scan();
    Ok(ok(room))
}

pub async fn update_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    Json(request): Json<RoomUpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let room = require_room(&state, room_id).await?;
    state
        .room_repo
        .update_room_flags(room.id, request.enabled, request.record_enabled)
        .await?;

    if request.enabled == Some(false) {
        if let Some(manager) = state.pool.get(room_id) {
            manager.stop_auto_refresh();
        }
    }
    Ok(ok_message("room updated"))
}

pub async fn delete_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let room = require_room(&state, room_id).await?;
    if let Some(manager) = state.pool.get(room.id) {
        manager.stop_auto_refresh();
    }
    state.room_repo.delete_room(room.id).await?;
    Ok(ok_message("room deleted"))
}

pub async fn start_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state.monitor.start_manager(room_id).await?;
    Ok(ok_message(format!("room {room_id} started")))
}

pub async fn stop_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let manager = state
        .pool
        .get(room_id)
        .ok_or_else(|| AppError::not_found("manager", room_id.to_string()))?;
    manager.stop_auto_refresh();
    state.pool.remove(room_id);
    Ok(ok_message(format!("room {room_id} stopped")))
}

pub async fn refresh_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let manager = state
        .pool
        .get(room_id)
        .ok_or_else(|| AppError::not_found("manager", room_id.to_string()))?;
    manager.trigger_refresh();
    Ok(ok_message(format!("refresh of room {room_id} triggered")))
}

pub async fn list_managers(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(ok(state.monitor.manager_list().await?))
}

pub async fn monitor_start(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.start(&state.root_cancel);
    ok_message("monitor started")
}

pub async fn monitor_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.stop();
    ok_message("monitor stopped")
}

pub async fn monitor_restart(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.restart(&state.root_cancel).await;
    ok_message("monitor restarted")
}

pub async fn monitor_scan(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.trigger_scan();
    ok_message("scan triggered")
}

pub async fn list_configs(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(ok(state.config_repo.list_configs().await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    Json(request): Json<ConfigUpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.key.trim().is_empty() {
        return Err(AppError::validation("config key must not be empty"));
    }

    state
        .config_repo
        .upsert_config(&request.key, &request.value)
        .await?;
    // Persist first, then notify subscribers (cookie hot-reload).
    state.settings.set(&request.key, &request.value);
    Ok(ok_message("configuration updated"))
}

/// Proxy a client playlist or segment request to the upstream CDN.
pub async fn proxy_stream(
    State(state): State<AppState>,
    Path((room_id, file)): Path<(i64, String)>,
) -> Result<Response, AppError> {
    let filename = file.trim_start_matches('/');

    let manager = state
        .pool
        .get(room_id)
        .ok_or_else(|| AppError::not_found("live room", room_id.to_string()))?;

    let target = manager.resolve_target_url(filename)?;
    debug!("proxying {} -> {}", filename, target);

    let upstream = manager.fetch(&state.root_cancel, &target, &[]).await?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);

    // Copy upstream headers; the m3u8 content type in particular must
    // survive. Hop-by-hop and length headers are managed by the server.
    for (name, value) in upstream.headers() {
        let name = name.as_str();
        if matches!(
            name,
            "connection" | "transfer-encoding" | "content-length" | "keep-alive"
        ) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_str(name),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response = response.header(name, value);
        }
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| AppError::internal(format!("response build failed: {e}")))
}

async fn require_room(state: &AppState, room_id: i64) -> Result<Room, AppError> {
    state
        .room_repo
        .get_room_by_id(room_id)
        .await?
        .ok_or_else(|| AppError::not_found("room", room_id.to_string()))
}
