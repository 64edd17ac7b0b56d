use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use liveroom_proxy::config::{Config, RuntimeSettings};
use liveroom_proxy::database::Database;
use liveroom_proxy::fetcher::Fetcher;
use liveroom_proxy::monitor::Monitor;
use liveroom_proxy::pool::ManagerPool;
use liveroom_proxy::repositories::{SqliteConfigRepository, SqliteRoomRepository};
use liveroom_proxy::web::{AppState, WebServer};

async fn test_app() -> Router {
    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();

    let database = Database::new(&config.database).await.expect("database");
    database.migrate().await.expect("migrate");

    let room_repo = Arc::new(SqliteRoomRepository::new(database.pool().clone()));
    let config_repo = Arc::new(SqliteConfigRepository::new(database.pool().clone()));
    let settings = Arc::new(RuntimeSettings::new(Default::default()));
    let fetcher = Arc::new(Fetcher::new(&config.proxy).expect("client"));
    let pool = Arc::new(ManagerPool::new());

    let monitor = Monitor::new(
        Arc::clone(&pool),
        room_repo.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&settings),
        config.recorder.clone(),
    );

    WebServer::create_router(AppState {
        config: Arc::new(config),
        pool,
        monitor,
        fetcher,
        settings,
        room_repo,
        config_repo,
        root_cancel: CancellationToken::new(),
    })
}

// Helper function to send requests to the app
async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request_builder = Request::builder().method(method).uri(uri);

    let request = if let Some(body) = body {
        request_builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

#[tokio::test]
async fn room_list_starts_empty() {
    let app = test_app().await;
    let (status, body) = send_request(&app, Method::GET, "/api/v1/rooms", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn manager_list_starts_empty() {
    let app = test_app().await;
    let (status, body) = send_request(&app, Method::GET, "/api/v1/managers", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn proxying_an_unknown_room_is_not_found() {
    let app = test_app().await;
    let (status, body) =
        send_request(&app, Method::GET, "/proxy/99/index.m3u8", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 1);
}

#[tokio::test]
async fn adding_a_room_with_an_unknown_platform_is_rejected() {
    let app = test_app().await;
    let (status, body) = send_request(
        &app,
        Method::POST,
        "/api/v1/rooms",
        Some(json!({"platform": "twitch", "rid": "123"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 1);
}

#[tokio::test]
async fn config_update_round_trips_through_the_api() {
    let app = test_app().await;

    let (status, _) = send_request(
        &app,
        Method::PUT,
        "/api/v1/configs",
        Some(json!({"key": "bilibili.cookie", "value": "SESSDATA=abc"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_request(&app, Method::GET, "/api/v1/configs", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], "bilibili.cookie");
    assert_eq!(entries[0]["value"], "SESSDATA=abc");
}

#[tokio::test]
async fn empty_config_key_is_rejected() {
    let app = test_app().await;
    let (status, _) = send_request(
        &app,
        Method::PUT,
        "/api/v1/configs",
        Some(json!({"key": "  ", "value": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn monitor_control_endpoints_flip_the_scan_loop() {
    let app = test_app().await;

    let (status, _) = send_request(&app, Method::POST, "/api/v1/monitor/start", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_request(&app, Method::POST, "/api/v1/monitor/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn starting_an_unknown_room_is_not_found() {
    let app = test_app().await;
    let (status, _) = send_request(&app, Method::POST, "/api/v1/rooms/5/start", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stopping_a_room_without_a_manager_is_not_found() {
    let app = test_app().await;
    let (status, _) = send_request(&app, Method::POST, "/api/v1/rooms/5/stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
