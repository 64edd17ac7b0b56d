//! Bilibili live streamer
//!
//! Talks to the bilibili live APIs: `room_init` for liveness and id
//! resolution, `getRoomPlayInfo` for quality negotiation and signed HLS URLs,
//! `get_info`/`Master/info` for room metadata when adding a room.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::ConfigSubscriber;
use crate::errors::StreamError;
use crate::fetcher::Fetcher;
use crate::models::{Platform, RoomAddInfo, StreamInfo};
use crate::streamers::Streamer;

/// qn ladder (descending): 30000 Dolby, 20000 4K, 15000 2K, 10000 original,
/// 400 blu-ray, 250 super-HD, 150 HD, 80 smooth.
const DEFAULT_QN: i32 = 10000;

// The H5/app endpoints are more stable under a mobile UA than the web ones.
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPod; CPU iPhone OS 14_5 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/87.0.4280.163 Mobile/15E148 Safari/604.1";
const REFERER_URL: &str = "https://live.bilibili.com";

const ROOM_INIT_API: &str = "https://api.live.bilibili.com/room/v1/Room/room_init";
const ROOM_INFO_API: &str = "https://api.live.bilibili.com/room/v1/Room/get_info";
const ANCHOR_INFO_API: &str = "https://api.live.bilibili.com/live_user/v1/Master/info";
const PLAY_INFO_API: &str = "https://api.live.bilibili.com/xlive/web-room/v2/index/getRoomPlayInfo";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default, alias = "msg")]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RoomInitData {
    room_id: i64,
    live_status: i32,
    #[serde(default)]
    live_time: i64,
}

#[derive(Debug, Deserialize)]
struct RoomInfoData {
    room_id: i64,
    #[serde(default)]
    short_id: i64,
    #[serde(default)]
    uid: i64,
    live_status: i32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    user_cover: String,
}

#[derive(Debug, Deserialize)]
struct AnchorInfoData {
    info: AnchorInfo,
}

#[derive(Debug, Deserialize)]
struct AnchorInfo {
    uid: i64,
    uname: String,
    #[serde(default)]
    face: String,
}

#[derive(Debug, Deserialize)]
struct PlayInfoData {
    live_status: i32,
    #[serde(default)]
    playurl_info: Option<PlayUrlInfo>,
}

#[derive(Debug, Deserialize)]
struct PlayUrlInfo {
    #[serde(default)]
    playurl: Option<PlayUrl>,
}

#[derive(Debug, Default, Deserialize)]
struct PlayUrl {
    #[serde(default)]
    stream: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    #[serde(default)]
    format: Vec<FormatEntry>,
}

#[derive(Debug, Deserialize)]
struct FormatEntry {
    format_name: String,
    #[serde(default)]
    codec: Vec<CodecEntry>,
}

#[derive(Debug, Deserialize)]
struct CodecEntry {
    base_url: String,
    #[serde(default)]
    url_info: Vec<UrlInfo>,
    #[serde(default)]
    accept_qn: Vec<i32>,
    current_qn: i32,
}

#[derive(Debug, Deserialize)]
struct UrlInfo {
    host: String,
    extra: String,
}

#[derive(Debug, Default)]
struct RoomState {
    real_id: String,
    room_url: String,
    live_status: i32,
    open_time: i64,
    stream_info: StreamInfo,
}

pub struct BilibiliStreamer {
    fetcher: Arc<Fetcher>,
    headers: RwLock<HeaderMap>,
    state: RwLock<RoomState>,
}

impl BilibiliStreamer {
    pub fn new(real_id: String, fetcher: Arc<Fetcher>, cookie: Option<String>) -> Self {
        let state = RoomState {
            room_url: format!("{REFERER_URL}/{real_id}"),
            real_id,
            stream_info: StreamInfo {
                selected_qn: DEFAULT_QN,
                ..StreamInfo::default()
            },
            ..RoomState::default()
        };

        Self {
            fetcher,
            headers: RwLock::new(default_headers(cookie.as_deref())),
            state: RwLock::new(state),
        }
    }

    async fn api<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, StreamError> {
        api_call(&self.fetcher, url, query, Some(&self.headers())).await
    }

    async fn room_init(&self) -> Result<RoomInitData, StreamError> {
        let id = self.real_id();
        self.api(ROOM_INIT_API, &[("id".to_string(), id)]).await
    }

    async fn play_info(&self, qn: i32) -> Result<PlayInfoData, StreamError> {
        let query = vec![
            ("room_id".to_string(), self.real_id()),
            // 0: http_stream, 1: http_hls
            ("protocol".to_string(), "0,1".to_string()),
            // 0: flv, 1: ts, 2: fmp4
            ("format".to_string(), "0,1,2".to_string()),
            // 0: AVC, 1: HEVC
            ("codec".to_string(), "0,1".to_string()),
            ("qn".to_string(), qn.to_string()),
            ("platform".to_string(), "html5".to_string()),
            ("ptype".to_string(), "8".to_string()),
            ("dolby".to_string(), "5".to_string()),
        ];

        let data: PlayInfoData = self.api(PLAY_INFO_API, &query).await?;
        if data.live_status != 1 {
            self.state.write().expect("state lock poisoned").live_status = 0;
            return Err(StreamError::RoomOffline);
        }
        Ok(data)
    }
}

#[async_trait]
impl Streamer for BilibiliStreamer {
    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn real_id(&self) -> String {
        self.state.read().expect("state lock poisoned").real_id.clone()
    }

    fn room_url(&self) -> String {
        self.state.read().expect("state lock poisoned").room_url.clone()
    }

    async fn init_room(&self) -> Result<(), StreamError> {
        let data = self.room_init().await?;

        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.real_id = data.room_id.to_string();
            state.room_url = format!("{REFERER_URL}/{}", data.room_id);
            state.live_status = data.live_status;
            state.open_time = data.live_time;
        }

        if data.live_status != 1 {
            return Err(StreamError::RoomOffline);
        }
        info!("bilibili room {} initialized (live)", data.room_id);
        Ok(())
    }

    async fn is_live(&self) -> Result<bool, StreamError> {
        let data = self.room_init().await?;
        let live = data.live_status == 1;
        let mut state = self.state.write().expect("state lock poisoned");
        state.real_id = data.room_id.to_string();
        state.live_status = i32::from(live);
        Ok(live)
    }

    async fn fetch_stream_info(
        &self,
        requested_qn: i32,
        certain_qn: bool,
    ) -> Result<StreamInfo, StreamError> {
        let requested_qn = if requested_qn <= 0 {
            debug!("substituting default quality {DEFAULT_QN}");
            DEFAULT_QN
        } else {
            requested_qn
        };

        let mut data = self.play_info(requested_qn).await?;

        let accept_qns = first_accept_qns(&data);
        if let Some(refetch_qn) = refetch_quality(&accept_qns, requested_qn, certain_qn) {
            info!(
                "requested quality {} unavailable or upgradable, refetching at {}",
                requested_qn, refetch_qn
            );
            data = self.play_info(refetch_qn).await?;
        }

        let mut state = self.state.write().expect("state lock poisoned");
        state.stream_info.accept_qns = accept_qns;
        state.stream_info.selected_qn = requested_qn;

        if let Some(codec) = first_hls_codec(&data) {
            state.stream_info.actual_qn = codec.current_qn;
            state.stream_info.stream_urls = build_stream_urls(codec);
            debug!(
                "negotiated quality {} (requested {}), {} lines",
                codec.current_qn,
                requested_qn,
                state.stream_info.stream_urls.len()
            );
        } else {
            warn!("play info carried no HLS format for room {}", state.real_id);
        }

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

impl ConfigSubscriber for BilibiliStreamer {
    fn on_config_update(&self, key: &str, value: &str) {
        if key != Platform::Bilibili.cookie_key() {
            return;
        }
        info!("bilibili cookie updated");
        set_cookie(&mut self.headers.write().expect("header lock poisoned"), value);
    }
}

fn default_headers(cookie: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(MOBILE_USER_AGENT));
    headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
    if let Some(cookie) = cookie {
        set_cookie(&mut headers, cookie);
    }
    headers
}

fn set_cookie(headers: &mut HeaderMap, value: &str) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        headers.remove(COOKIE);
    } else if let Ok(value) = HeaderValue::from_str(trimmed) {
        headers.insert(COOKIE, value);
    } else {
        warn!("cookie value contains invalid header characters, ignoring");
    }
}

/// Quality ladder advertised by the first (stream, format, codec) triple.
fn first_accept_qns(data: &PlayInfoData) -> Vec<i32> {
    data.playurl_info
        .as_ref()
        .and_then(|info| info.playurl.as_ref())
        .and_then(|playurl| playurl.stream.first())
        .and_then(|stream| stream.format.first())
        .and_then(|format| format.codec.first())
        .map(|codec| codec.accept_qn.clone())
        .unwrap_or_default()
}

/// Decide whether a second fetch at a different quality is needed.
///
/// Refetch at the maximum advertised quality when the requested one is not
/// offered at all, or when the caller accepts upgrades (`certain_qn == false`)
/// and something strictly better exists.
fn refetch_quality(accept_qns: &[i32], requested_qn: i32, certain_qn: bool) -> Option<i32> {
    let max_qn = accept_qns.iter().copied().max().unwrap_or(0);
    let requested_available = accept_qns.contains(&requested_qn);

    if !requested_available || (!certain_qn && max_qn > requested_qn) {
        (max_qn > 0).then_some(max_qn)
    } else {
        None
    }
}

/// First HLS-family codec (fmp4 preferred by API order, ts accepted).
fn first_hls_codec(data: &PlayInfoData) -> Option<&CodecEntry> {
    let playurl = data.playurl_info.as_ref()?.playurl.as_ref()?;
    for stream in &playurl.stream {
        for format in &stream.format {
            if matches!(format.format_name.as_str(), "fmp4" | "ts") {
                if let Some(codec) = format.codec.first() {
                    return Some(codec);
                }
            }
        }
    }
    None
}

/// One fully-signed URL per advertised line: `host ++ base_url ++ extra`.
fn build_stream_urls(codec: &CodecEntry) -> BTreeMap<String, String> {
    codec
        .url_info
        .iter()
        .enumerate()
        .map(|(index, info)| {
            (
                format!("线路{}", index + 1),
                format!("{}{}{}", info.host, codec.base_url, info.extra),
            )
        })
        .collect()
}

async fn api_call<T: DeserializeOwned>(
    fetcher: &Fetcher,
    url: &str,
    query: &[(String, String)],
    headers: Option<&HeaderMap>,
) -> Result<T, StreamError> {
    let body = fetcher.fetch_body(url, query, headers).await?;
    let response: ApiResponse<T> = serde_json::from_slice(&body)
        .map_err(|e| StreamError::parse(format!("bilibili response: {e}")))?;

    if response.code != 0 {
        return Err(StreamError::parse(format!(
            "bilibili api error {}: {}",
            response.code, response.message
        )));
    }
    response
        .data
        .ok_or_else(|| StreamError::parse("bilibili response missing data"))
}

/// Resolve numeric ids, room URLs and `b23.tv` short links to a room id.
pub async fn check_and_get_rid(fetcher: &Fetcher, input: &str) -> Result<String, StreamError> {
    let numeric = Regex::new(r"^\d+$").map_err(|e| StreamError::parse(e.to_string()))?;
    let long_url = Regex::new(r"(?:https?://)?live\.bilibili\.com/(?:h5/)?(\d+)")
        .map_err(|e| StreamError::parse(e.to_string()))?;
    let short_url =
        Regex::new(r"b23\.tv/[A-Za-z0-9]+").map_err(|e| StreamError::parse(e.to_string()))?;

    let mut current = input.trim().to_string();
    if current.is_empty() {
        return Err(StreamError::invalid_room(input));
    }

    // A short link resolves to a long URL, which then matches below; one
    // resolution pass is enough.
    for _ in 0..2 {
        if numeric.is_match(&current) {
            return Ok(current);
        }
        if let Some(captures) = long_url.captures(&current) {
            return Ok(captures[1].to_string());
        }
        if let Some(matched) = short_url.find(&current) {
            current = resolve_short_url(fetcher, &format!("https://{}", matched.as_str())).await?;
            continue;
        }
        break;
    }

    Err(StreamError::invalid_room(input))
}

/// Follow `b23.tv` redirects (≤ 5 hops) to the final long URL. Some short
/// links only redirect under a mobile UA.
async fn resolve_short_url(fetcher: &Fetcher, short_url: &str) -> Result<String, StreamError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X)"),
    );

    let mut current = short_url.to_string();
    for _ in 0..5 {
        match fetcher.resolve_redirect(&current, Some(&headers)).await? {
            Some(next) => current = next,
            None => return Ok(current),
        }
    }
    Err(StreamError::parse(format!(
        "too many redirects resolving {short_url}"
    )))
}

/// Liveness probe used by the monitor scan: 0 offline, 1 live.
pub async fn room_live_status(fetcher: &Fetcher, real_id: &str) -> Result<i32, StreamError> {
    let data: RoomInfoData = api_call(
        fetcher,
        ROOM_INFO_API,
        &[("room_id".to_string(), real_id.to_string())],
        Some(&default_headers(None)),
    )
    .await?;
    Ok(i32::from(data.live_status == 1))
}

/// Room + anchor metadata for persisting a new room. The anchor detail lives
/// behind a second API keyed on the room owner's uid.
pub async fn room_add_info(fetcher: &Fetcher, rid: &str) -> Result<RoomAddInfo, StreamError> {
    let room_id = check_and_get_rid(fetcher, rid).await?;

    let room: RoomInfoData = api_call(
        fetcher,
        ROOM_INFO_API,
        &[("room_id".to_string(), room_id.clone())],
        Some(&default_headers(None)),
    )
    .await?;

    let anchor: AnchorInfoData = api_call(
        fetcher,
        ANCHOR_INFO_API,
        &[("uid".to_string(), room.uid.to_string())],
        Some(&default_headers(None)),
    )
    .await?;

    Ok(RoomAddInfo {
        platform: Platform::Bilibili,
        real_id: room.room_id.to_string(),
        short_id: (room.short_id != 0).then(|| room.short_id.to_string()),
        name: room.title,
        url: format!("{REFERER_URL}/{}", room.room_id),
        cover_url: (!room.user_cover.is_empty()).then_some(room.user_cover),
        anchor_id: Some(anchor.info.uid.to_string()),
        anchor_name: anchor.info.uname,
        anchor_avatar: (!anchor.info.face.is_empty()).then_some(anchor.info.face),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_info(accept: Vec<i32>, current: i32, lines: Vec<(&str, &str)>) -> PlayInfoData {
        PlayInfoData {
            live_status: 1,
            playurl_info: Some(PlayUrlInfo {
                playurl: Some(PlayUrl {
                    stream: vec![StreamEntry {
                        format: vec![FormatEntry {
                            format_name: "fmp4".to_string(),
                            codec: vec![CodecEntry {
                                base_url: "/live-bvc/stream.m3u8?".to_string(),
                                url_info: lines
                                    .into_iter()
                                    .map(|(host, extra)| UrlInfo {
                                        host: host.to_string(),
                                        extra: extra.to_string(),
                                    })
                                    .collect(),
                                accept_qn: accept,
                                current_qn: current,
                            }],
                        }],
                    }],
                }),
            }),
        }
    }

    #[test]
    fn refetches_at_max_when_requested_quality_is_not_offered() {
        let accept = vec![80, 150, 250, 400, 10000];
        assert_eq!(refetch_quality(&accept, 4000, true), Some(10000));
    }

    #[test]
    fn refetches_at_max_when_upgrades_are_allowed() {
        let accept = vec![80, 150, 250, 400, 10000];
        assert_eq!(refetch_quality(&accept, 400, false), Some(10000));
    }

    #[test]
    fn keeps_requested_quality_when_certain_and_available() {
        let accept = vec![80, 150, 250, 400, 10000];
        assert_eq!(refetch_quality(&accept, 400, true), None);
        assert_eq!(refetch_quality(&accept, 10000, false), None);
    }

    #[test]
    fn no_refetch_when_upstream_advertises_nothing() {
        assert_eq!(refetch_quality(&[], 4000, false), None);
    }

    #[test]
    fn builds_one_labelled_line_per_url_info() {
        let data = play_info(
            vec![10000],
            10000,
            vec![
                ("https://d1.example.com", "expires=1&sig=a"),
                ("https://d2.example.com", "expires=1&sig=a"),
            ],
        );
        let codec = first_hls_codec(&data).expect("codec");
        let urls = build_stream_urls(codec);

        assert_eq!(urls.len(), 2);
        assert_eq!(
            urls.get("线路1").map(String::as_str),
            Some("https://d1.example.com/live-bvc/stream.m3u8?expires=1&sig=a")
        );
        assert_eq!(
            urls.get("线路2").map(String::as_str),
            Some("https://d2.example.com/live-bvc/stream.m3u8?expires=1&sig=a")
        );
    }

    #[test]
    fn first_hls_codec_skips_flv_formats() {
        let mut data = play_info(vec![10000], 10000, vec![("https://d1.example.com", "e")]);
        if let Some(playurl) = data
            .playurl_info
            .as_mut()
            .and_then(|info| info.playurl.as_mut())
        {
            playurl.stream[0].format.insert(
                0,
                FormatEntry {
                    format_name: "flv".to_string(),
                    codec: vec![],
                },
            );
        }
        let codec = first_hls_codec(&data).expect("codec");
        assert_eq!(codec.current_qn, 10000);
    }

    #[tokio::test]
    async fn rid_resolution_accepts_numeric_and_long_urls() {
        let fetcher = Fetcher::new(&crate::config::ProxyConfig::default()).expect("client");

        assert_eq!(
            check_and_get_rid(&fetcher, "22109408").await.expect("rid"),
            "22109408"
        );
        assert_eq!(
            check_and_get_rid(&fetcher, "https://live.bilibili.com/22109408?from=search")
                .await
                .expect("rid"),
            "22109408"
        );
        assert_eq!(
            check_and_get_rid(&fetcher, "live.bilibili.com/h5/654321")
                .await
                .expect("rid"),
            "654321"
        );
    }

    #[tokio::test]
    async fn rid_resolution_rejects_garbage() {
        let fetcher = Fetcher::new(&crate::config::ProxyConfig::default()).expect("client");
        let err = check_and_get_rid(&fetcher, "not-a-room").await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidRoom { .. }));
    }
}
