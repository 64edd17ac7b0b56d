use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upstream platform tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bilibili,
    Missevan,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Bilibili => write!(f, "bilibili"),
            Platform::Missevan => write!(f, "missevan"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bilibili" | "bili" => Ok(Platform::Bilibili),
            "missevan" => Ok(Platform::Missevan),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

impl Platform {
    /// Configuration key carrying this platform's cookie string
    pub fn cookie_key(&self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili.cookie",
            Platform::Missevan => "missevan.cookie",
        }
    }
}

/// A monitored live room as persisted in the rooms table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Room {
    pub id: i64,
    pub platform: Platform,
    /// Platform-native canonical room identifier
    pub real_id: String,
    pub short_id: Option<String>,
    pub name: String,
    pub url: String,
    pub cover_url: Option<String>,
    pub anchor_id: Option<String>,
    pub anchor_name: String,
    pub anchor_avatar: Option<String>,
    /// Local proxy playlist URL handed to players
    pub proxy_url: String,
    pub enabled: bool,
    pub record_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stream metadata negotiated with the upstream
///
/// `stream_urls` maps a stable line label onto a fully-signed upstream URL.
/// A `BTreeMap` keeps iteration order deterministic so "first line" selection
/// is stable across refreshes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Quality levels the upstream currently offers
    pub accept_qns: Vec<i32>,
    /// Quality the caller asked for
    pub selected_qn: i32,
    /// Quality the upstream actually granted
    pub actual_qn: i32,
    /// Line label -> fully-signed upstream URL
    pub stream_urls: BTreeMap<String, String>,
}

impl StreamInfo {
    /// First line's URL, if any stream has been negotiated yet.
    pub fn first_url(&self) -> Option<&str> {
        self.stream_urls.values().next().map(String::as_str)
    }
}

/// Room metadata gathered when adding a room by user-supplied identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomAddInfo {
    pub platform: Platform,
    pub real_id: String,
    pub short_id: Option<String>,
    pub name: String,
    pub url: String,
    pub cover_url: Option<String>,
    pub anchor_id: Option<String>,
    pub anchor_name: String,
    pub anchor_avatar: Option<String>,
}

/// Point-in-time snapshot of a running recorder's output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordProgress {
    pub filename: String,
    pub filesize: u64,
    pub duration_secs: f64,
}

/// Runtime state snapshot of one room, joined from the repository and the
/// manager pool for the handler layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerView {
    pub room_id: i64,
    pub platform: Platform,
    pub real_id: String,
    pub name: String,
    pub cover_url: Option<String>,
    pub anchor_id: Option<String>,
    pub anchor_name: String,
    pub anchor_avatar: Option<String>,
    /// 0: offline, 1: live
    pub live_status: i32,
    pub url: String,
    pub proxy_url: String,
    pub current_url: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub expire_time: Option<DateTime<Utc>>,
    /// 0: not recording, 1: recording
    pub record_status: i32,
    pub record_file: Option<String>,
    pub record_size: u64,
    pub record_size_str: String,
    pub record_duration: f64,
    pub record_duration_str: String,
}

/// Request body for adding a room
#[derive(Debug, Clone, Deserialize)]
pub struct RoomAddRequest {
    pub platform: String,
    /// Numeric id, room URL or short link, resolved per platform
    pub rid: String,
    #[serde(default)]
    pub record_enabled: bool,
}

/// Request body for updating room flags
#[derive(Debug, Clone, Deserialize)]
pub struct RoomUpdateRequest {
    pub enabled: Option<bool>,
    pub record_enabled: Option<bool>,
}

/// One persisted configuration entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Request body for updating a configuration entry
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdateRequest {
    pub key: String,
    pub value: String,
}
