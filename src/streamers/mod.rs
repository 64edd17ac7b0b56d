//! Upstream platform streamers
//!
//! A [`Streamer`] knows how to talk to one platform: resolve a room
//! identifier, detect live status, negotiate stream quality, build the header
//! set upstream expects and read the expiry baked into a signed stream URL.
//! Two platforms are supported; both are selected by the [`Platform`] tag at
//! manager construction.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::sync::{Arc, Weak};
use url::Url;

use crate::config::{ConfigSubscriber, RuntimeSettings};
use crate::errors::StreamError;
use crate::fetcher::Fetcher;
use crate::models::{Platform, RoomAddInfo, StreamInfo};

pub mod bilibili;
pub mod missevan;

/// Platform capability set used by the per-room manager.
///
/// Implementations keep interior state behind locks: the manager shares them
/// as `Arc<dyn Streamer>` and the configuration facade may update headers
/// concurrently with a refresh.
#[async_trait]
pub trait Streamer: Send + Sync {
    fn platform(&self) -> Platform;

    /// Canonical platform-native room id (after `init_room` resolution)
    fn real_id(&self) -> String;

    fn room_url(&self) -> String;

    /// Resolve the supplied identifier to the canonical room id, confirm the
    /// room is live and record open-time and room URL. Idempotent.
    async fn init_room(&self) -> Result<(), StreamError>;

    /// Single round-trip against the room-info endpoint.
    async fn is_live(&self) -> Result<bool, StreamError>;

    /// Negotiate quality and fetch the current set of signed stream URLs.
    async fn fetch_stream_info(
        &self,
        requested_qn: i32,
        certain_qn: bool,
    ) -> Result<StreamInfo, StreamError>;

    /// Snapshot of the last negotiated stream info.
    fn stream_info(&self) -> StreamInfo;

    /// Cloned header set for upstream requests (UA, Referer, Cookie, ...).
    fn headers(&self) -> HeaderMap;

    /// Stream open time as epoch seconds, for recorder filename templating.
    fn open_time(&self) -> i64;

    fn parse_expiration(&self, stream_url: &str) -> Result<DateTime<Utc>, StreamError> {
        parse_expires(stream_url)
    }
}

/// Build the streamer for a platform and register it for cookie updates.
pub fn build(
    platform: Platform,
    real_id: String,
    fetcher: Arc<Fetcher>,
    settings: &RuntimeSettings,
) -> Arc<dyn Streamer> {
    match platform {
        Platform::Bilibili => {
            let streamer = Arc::new(bilibili::BilibiliStreamer::new(
                real_id,
                fetcher,
                settings.get(platform.cookie_key()),
            ));
            let subscriber: Weak<dyn ConfigSubscriber> =
                Arc::downgrade(&(streamer.clone() as Arc<dyn ConfigSubscriber>));
            settings.add_subscriber(subscriber);
            streamer
        }
        Platform::Missevan => {
            let streamer = Arc::new(missevan::MissevanStreamer::new(
                real_id,
                fetcher,
                settings.get(platform.cookie_key()),
            ));
            let subscriber: Weak<dyn ConfigSubscriber> =
                Arc::downgrade(&(streamer.clone() as Arc<dyn ConfigSubscriber>));
            settings.add_subscriber(subscriber);
            streamer
        }
    }
}

/// Lightweight liveness probe without constructing a streamer. Returns 0|1.
pub async fn room_live_status(
    fetcher: &Fetcher,
    platform: Platform,
    real_id: &str,
) -> Result<i32, StreamError> {
    match platform {
        Platform::Bilibili => bilibili::room_live_status(fetcher, real_id).await,
        Platform::Missevan => missevan::room_live_status(fetcher, real_id).await,
    }
}

/// Resolve a user-supplied identifier and gather the metadata needed to
/// persist a new room.
pub async fn room_add_info(
    fetcher: &Fetcher,
    platform: Platform,
    rid: &str,
) -> Result<RoomAddInfo, StreamError> {
    match platform {
        Platform::Bilibili => bilibili::room_add_info(fetcher, rid).await,
        Platform::Missevan => missevan::room_add_info(fetcher, rid).await,
    }
}

/// Extract the `expires` query parameter (unix seconds) from a signed URL.
///
/// Both platforms embed expiry this way; nothing more general is guaranteed.
pub fn parse_expires(stream_url: &str) -> Result<DateTime<Utc>, StreamError> {
    let parsed = Url::parse(stream_url)
        .map_err(|e| StreamError::parse(format!("malformed stream URL: {e}")))?;

    let expires = parsed
        .query_pairs()
        .find(|(key, _)| key == "expires")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| StreamError::parse("stream URL has no expires parameter"))?;

    let seconds: i64 = expires
        .parse()
        .map_err(|_| StreamError::parse(format!("invalid expires timestamp: {expires}")))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| StreamError::parse(format!("expires out of range: {seconds}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_expires_reads_unix_seconds() {
        let url = "https://cdn.example.com/live/stream.m3u8?sig=abc&expires=1759675460&qn=10000";
        let expiry = parse_expires(url).expect("expiry");
        assert_eq!(expiry.timestamp(), 1759675460);
    }

    #[test]
    fn parse_expires_rejects_missing_parameter() {
        let err = parse_expires("https://cdn.example.com/live/stream.m3u8?sig=abc").unwrap_err();
        assert!(matches!(err, StreamError::Parse { .. }));
    }

    #[test]
    fn parse_expires_rejects_garbage_timestamp() {
        let err =
            parse_expires("https://cdn.example.com/live/stream.m3u8?expires=soon").unwrap_err();
        assert!(matches!(err, StreamError::Parse { .. }));
    }
}
