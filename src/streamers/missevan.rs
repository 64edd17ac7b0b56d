//! Missevan audio-live streamer
//!
//! One API call carries everything: room status, open time and the pull URLs.
//! Only the HLS pull URL is retained; there is no multi-line set and no
//! quality ladder to negotiate. Segment requests additionally need a `Host`
//! header naming the CDN origin, which the fetcher transports as the
//! request's virtual host.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, COOKIE, HOST, ORIGIN, REFERER, USER_AGENT};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::config::ConfigSubscriber;
use crate::errors::StreamError;
use crate::fetcher::Fetcher;
use crate::models::{Platform, RoomAddInfo, StreamInfo};
use crate::streamers::Streamer;

const LIVE_API_BASE: &str = "https://fm.missevan.com/api/v2/live/";
const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";
const ROOM_URL_PREFIX: &str = "https://fm.missevan.com/live/";
const ORIGIN_URL: &str = "https://fm.missevan.com";

/// The single HLS line this platform serves
const HLS_LINE: &str = "hls";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    info: Option<LiveInfo>,
}

#[derive(Debug, Deserialize)]
struct LiveInfo {
    room: RoomData,
    creator: Option<CreatorData>,
}

#[derive(Debug, Deserialize)]
struct RoomData {
    room_id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    cover_url: String,
    channel: ChannelData,
    status: StatusData,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelData {
    #[serde(default)]
    hls_pull_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusData {
    /// 0: offline, 1: live
    #[serde(default)]
    open: i32,
    /// Epoch milliseconds
    #[serde(default)]
    open_time: i64,
}

#[derive(Debug, Deserialize)]
struct CreatorData {
    user_id: i64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    iconurl: String,
}

#[derive(Debug, Default)]
struct RoomState {
    real_id: String,
    room_url: String,
    live_status: i32,
    open_time: i64,
    stream_info: StreamInfo,
}

pub struct MissevanStreamer {
    fetcher: Arc<Fetcher>,
    headers: RwLock<HeaderMap>,
    state: RwLock<RoomState>,
}

impl MissevanStreamer {
    pub fn new(real_id: String, fetcher: Arc<Fetcher>, cookie: Option<String>) -> Self {
        let state = RoomState {
            room_url: format!("{ROOM_URL_PREFIX}{real_id}"),
            real_id: real_id.clone(),
            ..RoomState::default()
        };

        Self {
            fetcher,
            headers: RwLock::new(default_headers(&real_id, cookie.as_deref())),
            state: RwLock::new(state),
        }
    }

    async fn room_info(&self) -> Result<RoomData, StreamError> {
        let id = self.real_id();
        let (room, _) = fetch_room_info(&self.fetcher, &id, Some(&self.headers())).await?;
        Ok(room)
    }

    fn record_room(&self, room: &RoomData) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.real_id = room.room_id.to_string();
        state.room_url = format!("{ROOM_URL_PREFIX}{}", room.room_id);
        state.live_status = i32::from(room.status.open == 1);
        if room.status.open_time > 0 {
            // The API reports milliseconds; epoch seconds everywhere else.
            state.open_time = room.status.open_time / 1000;
        }
    }
}

#[async_trait]
impl Streamer for MissevanStreamer {
    fn platform(&self) -> Platform {
        Platform::Missevan
    }

    fn real_id(&self) -> String {
        self.state.read().expect("state lock poisoned").real_id.clone()
    }

    fn room_url(&self) -> String {
        self.state.read().expect("state lock poisoned").room_url.clone()
    }

    async fn init_room(&self) -> Result<(), StreamError> {
        let room = self.room_info().await?;
        self.record_room(&room);

        if room.status.open != 1 {
            return Err(StreamError::RoomOffline);
        }
        info!("missevan room {} initialized (live)", room.room_id);
        Ok(())
    }

    async fn is_live(&self) -> Result<bool, StreamError> {
        let room = self.room_info().await?;
        self.record_room(&room);
        Ok(room.status.open == 1)
    }

    async fn fetch_stream_info(
        &self,
        _requested_qn: i32,
        _certain_qn: bool,
    ) -> Result<StreamInfo, StreamError> {
        let room = self.room_info().await?;
        self.record_room(&room);

        if room.status.open != 1 {
            return Err(StreamError::RoomOffline);
        }
        if room.channel.hls_pull_url.is_empty() {
            return Err(StreamError::parse("room info carried no hls_pull_url"));
        }

        // Segment hosts expect the CDN origin as virtual host.
        if let Some(host) = cdn_host(&room.channel.hls_pull_url) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                self.headers
                    .write()
                    .expect("header lock poisoned")
                    .insert(HOST, value);
            }
        }

        let mut state = self.state.write().expect("state lock poisoned");
        state.stream_info.stream_urls =
            BTreeMap::from([(HLS_LINE.to_string(), room.channel.hls_pull_url)]);
        Ok(state.stream_info.clone())
    }

    fn stream_info(&self) -> StreamInfo {
        self.state.read().expect("state lock poisoned").stream_info.clone()
    }

    fn headers(&self) -> HeaderMap {
        self.headers.read().expect("header lock poisoned").clone()
    }

    fn open_time(&self) -> i64 {
        self.state.read().expect("state lock poisoned").open_time
    }
}

impl ConfigSubscriber for MissevanStreamer {
    fn on_config_update(&self, key: &str, value: &str) {
        if key != Platform::Missevan.cookie_key() {
            return;
        }
        info!("missevan cookie updated");
        let mut headers = self.headers.write().expect("header lock poisoned");
        let trimmed = value.trim();
        if trimmed.is_empty() {
            headers.remove(COOKIE);
        } else if let Ok(value) = HeaderValue::from_str(trimmed) {
            headers.insert(COOKIE, value);
        } else {
            warn!("cookie value contains invalid header characters, ignoring");
        }
    }
}

fn default_headers(real_id: &str, cookie: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DESKTOP_USER_AGENT));
    if let Ok(referer) = HeaderValue::from_str(&format!("{ROOM_URL_PREFIX}{real_id}")) {
        headers.insert(REFERER, referer);
    }
    headers.insert(ORIGIN, HeaderValue::from_static(ORIGIN_URL));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    if let Some(cookie) = cookie {
        let trimmed = cookie.trim();
        if !trimmed.is_empty() {
            if let Ok(value) = HeaderValue::from_str(trimmed) {
                headers.insert(COOKIE, value);
            }
        }
    }
    headers
}

fn cdn_host(hls_url: &str) -> Option<String> {
    Url::parse(hls_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

async fn fetch_room_info(
    fetcher: &Fetcher,
    real_id: &str,
    headers: Option<&HeaderMap>,
) -> Result<(RoomData, Option<CreatorData>), StreamError> {
    let fallback = default_headers(real_id, None);
    let headers = headers.unwrap_or(&fallback);

    let body = fetcher
        .fetch_body(&format!("{LIVE_API_BASE}{real_id}"), &[], Some(headers))
        .await?;

    let response: ApiResponse = serde_json::from_slice(&body)
        .map_err(|e| StreamError::parse(format!("missevan response: {e}")))?;

    if response.code != 0 {
        return Err(StreamError::parse(format!(
            "missevan api error {}",
            response.code
        )));
    }
    let info = response
        .info
        .ok_or_else(|| StreamError::parse("missevan response missing info"))?;
    Ok((info.room, info.creator))
}

/// Resolve numeric ids and room URLs to a room id.
pub async fn check_and_get_rid(_fetcher: &Fetcher, input: &str) -> Result<String, StreamError> {
    let numeric = Regex::new(r"^\d+$").map_err(|e| StreamError::parse(e.to_string()))?;
    let long_url = Regex::new(r"(?:https?://)?fm\.missevan\.com/live/(\d+)")
        .map_err(|e| StreamError::parse(e.to_string()))?;

    let input = input.trim();
    if input.is_empty() {
        return Err(StreamError::invalid_room(input));
    }
    if numeric.is_match(input) {
        return Ok(input.to_string());
    }
    if let Some(captures) = long_url.captures(input) {
        return Ok(captures[1].to_string());
    }
    Err(StreamError::invalid_room(input))
}

/// Liveness probe used by the monitor scan: 0 offline, 1 live.
pub async fn room_live_status(fetcher: &Fetcher, real_id: &str) -> Result<i32, StreamError> {
    let (room, _) = fetch_room_info(fetcher, real_id, None).await?;
    Ok(i32::from(room.status.open == 1))
}

/// Room + anchor metadata for persisting a new room.
pub async fn room_add_info(fetcher: &Fetcher, rid: &str) -> Result<RoomAddInfo, StreamError> {
    let real_id = check_and_get_rid(fetcher, rid).await?;
    let (room, creator) = fetch_room_info(fetcher, &real_id, None).await?;

    let creator = creator.ok_or_else(|| StreamError::parse("missevan response missing creator"))?;

    Ok(RoomAddInfo {
        platform: Platform::Missevan,
        real_id: room.room_id.to_string(),
        short_id: None,
        name: room.name,
        url: format!("{ROOM_URL_PREFIX}{}", room.room_id),
        cover_url: (!room.cover_url.is_empty()).then_some(room.cover_url),
        anchor_id: Some(creator.user_id.to_string()),
        anchor_name: creator.username,
        anchor_avatar: (!creator.iconurl.is_empty()).then_some(creator.iconurl),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[tokio::test]
    async fn rid_resolution_accepts_numeric_and_long_urls() {
        let fetcher = Fetcher::new(&ProxyConfig::default()).expect("client");

        assert_eq!(
            check_and_get_rid(&fetcher, "30165838").await.expect("rid"),
            "30165838"
        );
        assert_eq!(
            check_and_get_rid(&fetcher, "https://fm.missevan.com/live/30165838")
                .await
                .expect("rid"),
            "30165838"
        );
        assert_eq!(
            check_and_get_rid(&fetcher, "fm.missevan.com/live/42")
                .await
                .expect("rid"),
            "42"
        );
    }

    #[tokio::test]
    async fn rid_resolution_rejects_other_hosts() {
        let fetcher = Fetcher::new(&ProxyConfig::default()).expect("client");
        let err = check_and_get_rid(&fetcher, "https://example.com/live/42")
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidRoom { .. }));
    }

    #[test]
    fn cdn_host_extracts_the_stream_host() {
        assert_eq!(
            cdn_host("https://d1-missevan.example.com/live/123.m3u8?expires=1"),
            Some("d1-missevan.example.com".to_string())
        );
        assert_eq!(cdn_host("not a url"), None);
    }
}
