//! Per-room manager
//!
//! One [`Manager`] supervises everything a live room needs: an auto-refresh
//! loop that renews the signed stream URL ahead of its expiry, the proxy
//! fetch path used by the web layer (with transparent refresh on auth
//! failures), URL resolution for manifest and segment requests, and the
//! recorder lifecycle. Cancellation flows monitor → manager → recorder; the
//! stop callback flows back up to the pool exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Response};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{RecorderConfig, RuntimeSettings};
use crate::errors::{ResolveError, StreamError};
use crate::fetcher::{Fetcher, Refresher};
use crate::models::{Room, StreamInfo};
use crate::streamers::{self, Streamer};

mod recording;

pub use recording::RecorderHandle;

/// Gap kept between the URL's actual expiry and the scheduled refresh point
const SAFETY_EXPIRE_INTERVAL: Duration = Duration::from_secs(60);
/// Extra lead subtracted again when computing the loop's wait time
const REFRESH_SAFETY_MARGIN: Duration = Duration::from_secs(60);

const MAX_REFRESH_ATTEMPTS: usize = 10;
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(2);
/// First refresh after startup happens almost immediately
const FIRST_REFRESH_DELAY: Duration = Duration::from_secs(5);
/// Fallback cadence once the URL is already past its safety point
const EXPIRED_RETRY_DELAY: Duration = Duration::from_secs(3);

const AUTO_REFRESH_ATTEMPTS: usize = 10;
const PROXY_REFRESH_ATTEMPTS: usize = 5;

#[derive(Debug, Default)]
struct RefreshState {
    current_url: String,
    stream_urls: BTreeMap<String, String>,
    actual_expire_time: Option<DateTime<Utc>>,
    safety_expire_time: Option<DateTime<Utc>>,
    last_refresh_time: Option<DateTime<Utc>>,
}

pub struct Manager {
    room: Room,
    streamer: Arc<dyn Streamer>,
    fetcher: Arc<Fetcher>,
    recorder_config: RecorderConfig,
    state: RwLock<RefreshState>,
    record_status: AtomicBool,
    recorder: Mutex<Option<RecorderHandle>>,
    cancel: CancellationToken,
    refresh_tx: mpsc::Sender<()>,
    refresh_rx: Mutex<Option<mpsc::Receiver<()>>>,
    started: AtomicBool,
    initialized: AtomicBool,
    on_stop: Mutex<Option<Box<dyn FnOnce(i64) + Send>>>,
}

impl Manager {
    /// Build a manager for a room. Selects the streamer by platform tag and
    /// registers it for cookie updates; performs no network I/O.
    pub fn new(
        room: Room,
        fetcher: Arc<Fetcher>,
        recorder_config: RecorderConfig,
        settings: &RuntimeSettings,
        on_stop: impl FnOnce(i64) + Send + 'static,
    ) -> Arc<Self> {
        let streamer = streamers::build(
            room.platform,
            room.real_id.clone(),
            fetcher.clone(),
            settings,
        );
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        Arc::new(Self {
            record_status: AtomicBool::new(room.record_enabled),
            room,
            streamer,
            fetcher,
            recorder_config,
            state: RwLock::new(RefreshState::default()),
            recorder: Mutex::new(None),
            cancel: CancellationToken::new(),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            on_stop: Mutex::new(Some(Box::new(on_stop))),
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn room_id(&self) -> i64 {
        self.room.id
    }

    pub fn streamer(&self) -> &Arc<dyn Streamer> {
        &self.streamer
    }

    pub fn current_url(&self) -> Option<String> {
        let state = self.state.read().expect("state lock poisoned");
        (!state.current_url.is_empty()).then(|| state.current_url.clone())
    }

    pub fn actual_expire_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("state lock poisoned").actual_expire_time
    }

    pub fn last_refresh_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("state lock poisoned").last_refresh_time
    }

    pub fn record_status(&self) -> bool {
        self.record_status.load(Ordering::SeqCst)
    }

    /// Launch the auto-refresh loop. Idempotent: a second call warns and
    /// returns without spawning anything.
    pub fn start_auto_refresh(self: &Arc<Self>, parent: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("room {}: auto-refresh already running", self.room.id);
            return;
        }

        info!("room {}: starting auto-refresh", self.room.id);
        // Prime the loop so the first refresh happens without waiting.
        let _ = self.refresh_tx.try_send(());
        tokio::spawn(Arc::clone(self).auto_refresh_loop(parent.clone()));
    }

    /// Ask the loop for an immediate refresh. Non-blocking: when a trigger is
    /// already pending the extra one is dropped.
    pub fn trigger_refresh(&self) {
        match self.refresh_tx.try_send(()) {
            Ok(()) => info!("room {}: refresh triggered", self.room.id),
            Err(_) => debug!("room {}: refresh already pending, trigger dropped", self.room.id),
        }
    }

    /// Cancel the manager's lifecycle. Idempotent; the loop notices on its
    /// next select, tears the recorder down and fires the stop callback.
    pub fn stop_auto_refresh(&self) {
        self.cancel.cancel();
    }

    async fn auto_refresh_loop(self: Arc<Self>, parent: CancellationToken) {
        let receiver = self.refresh_rx.lock().expect("refresh lock poisoned").take();
        let Some(mut receiver) = receiver else {
            warn!("room {}: refresh loop already consumed", self.room.id);
            return;
        };

        loop {
            let wait = self.next_wait();

            tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                received = receiver.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("room {}: immediate refresh requested", self.room.id);
                }
                _ = tokio::time::sleep(wait) => {
                    info!("room {}: refresh interval elapsed", self.room.id);
                }
            }

            let refreshed = tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                result = self.refresh(&self.cancel, AUTO_REFRESH_ATTEMPTS) => result,
            };

            match refreshed {
                Ok(()) => {}
                Err(e) if e.is_offline() => {
                    info!("room {}: upstream reports offline, stopping", self.room.id);
                    break;
                }
                Err(e) => {
                    warn!("room {}: refresh failed, retrying next cycle: {}", self.room.id, e);
                }
            }
        }

        drop(receiver);
        self.teardown();
        info!("room {}: auto-refresh stopped", self.room.id);
    }

    /// Wait before the next scheduled refresh:
    /// safety expiry minus now minus the safety margin, clamped to a short
    /// delay when the URL is already (almost) expired, and to a small startup
    /// delay before the first refresh ever ran.
    fn next_wait(&self) -> Duration {
        let (safety, last_refresh) = {
            let state = self.state.read().expect("state lock poisoned");
            (state.safety_expire_time, state.last_refresh_time)
        };

        if last_refresh.is_none() {
            return FIRST_REFRESH_DELAY;
        }
        let Some(safety) = safety else {
            return EXPIRED_RETRY_DELAY;
        };

        let lead = safety - Utc::now();
        match lead.to_std() {
            Ok(lead) if lead > REFRESH_SAFETY_MARGIN => lead - REFRESH_SAFETY_MARGIN,
            _ => {
                warn!(
                    "room {}: stream URL expired or expiring, retrying in {:?}",
                    self.room.id, EXPIRED_RETRY_DELAY
                );
                EXPIRED_RETRY_DELAY
            }
        }
    }

    /// Common refresh: bounded retries around one stream-info fetch plus
    /// expiry parsing, then an atomic state update. `RoomOffline` bypasses
    /// the retries entirely.
    pub async fn refresh(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        attempts: usize,
    ) -> Result<(), StreamError> {
        let attempts = attempts.clamp(1, MAX_REFRESH_ATTEMPTS);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    _ = tokio::time::sleep(REFRESH_RETRY_DELAY) => {}
                }
                warn!("room {}: refresh retry {}/{}", self.room.id, attempt + 1, attempts);
            }

            match self.refresh_once().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_offline() => return Err(e),
                Err(e) => {
                    warn!("room {}: refresh attempt failed: {}", self.room.id, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StreamError::parse("refresh failed")))
    }

    async fn refresh_once(self: &Arc<Self>) -> Result<(), StreamError> {
        // Resolve the canonical room id once; init_room is idempotent, so a
        // failed attempt simply retries on the next refresh.
        if !self.initialized.load(Ordering::SeqCst) {
            self.streamer.init_room().await?;
            self.initialized.store(true, Ordering::SeqCst);
        }

        let selected_qn = self.streamer.stream_info().selected_qn;
        let info = self.streamer.fetch_stream_info(selected_qn, true).await?;

        let selected = self.first_parsable_url(&info);
        let Some((url, expire)) = selected else {
            return Err(StreamError::parse("no stream URL with a parsable expiry"));
        };

        self.store_refresh_result(url, info.stream_urls.clone(), expire);
        info!(
            "room {}: stream URL refreshed, expires at {}",
            self.room.id, expire
        );

        if self.record_status() {
            tokio::spawn(Arc::clone(self).update_recorder(info.stream_urls));
        }
        Ok(())
    }

    fn first_parsable_url(&self, info: &StreamInfo) -> Option<(String, DateTime<Utc>)> {
        for (line, url) in &info.stream_urls {
            match self.streamer.parse_expiration(url) {
                Ok(expire) => return Some((url.clone(), expire)),
                Err(e) => warn!("room {}: line {} expiry unreadable: {}", self.room.id, line, e),
            }
        }
        None
    }

    fn store_refresh_result(
        &self,
        current_url: String,
        stream_urls: BTreeMap<String, String>,
        actual_expire: DateTime<Utc>,
    ) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.current_url = current_url;
        state.stream_urls = stream_urls;
        state.actual_expire_time = Some(actual_expire);
        state.safety_expire_time = Some(
            actual_expire
                - chrono::Duration::from_std(SAFETY_EXPIRE_INTERVAL)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        );
        state.last_refresh_time = Some(Utc::now());
    }

    /// Map a proxied client path onto the upstream URL.
    ///
    /// Manifest requests get the currently-selected stream URL verbatim;
    /// segment requests resolve relative to the manifest's directory and keep
    /// its signed query string.
    pub fn resolve_target_url(&self, filename: &str) -> Result<String, ResolveError> {
        let current = {
            let state = self.state.read().expect("state lock poisoned");
            state.current_url.clone()
        };
        if current.is_empty() {
            return Err(ResolveError::EmptyStream);
        }

        if filename.is_empty() || filename.ends_with(".m3u8") {
            return Ok(current);
        }

        if filename.ends_with(".ts") || filename.ends_with(".m4s") {
            let base = Url::parse(&current)?;
            // join() resolves the segment against the manifest's directory;
            // the signed token must survive the hop.
            let mut target = base.join(filename)?;
            target.set_query(base.query());
            return Ok(target.to_string());
        }

        Err(ResolveError::UnsupportedType {
            filename: filename.to_string(),
        })
    }

    /// Proxy one upstream request. Headers are re-read from the streamer on
    /// every attempt (cookies may have been hot-updated), and an auth-expired
    /// status transparently triggers one refresh mid-retry.
    pub async fn fetch(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Response, StreamError> {
        self.fetcher
            .fetch_with_refresh(cancel, self, || self.fetch_once(url, query))
            .await
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Response, StreamError> {
        let headers = self.streamer.headers();
        self.fetcher
            .fetch(Method::GET, url, query, Some(&headers))
            .await
    }

    fn teardown(self: &Arc<Self>) {
        self.cancel.cancel();
        self.stop_recorder();

        let on_stop = self.on_stop.lock().expect("stop lock poisoned").take();
        if let Some(on_stop) = on_stop {
            on_stop(self.room.id);
        }
    }
}

#[async_trait]
impl Refresher for Arc<Manager> {
    async fn refresh(&self, cancel: &CancellationToken) -> Result<(), StreamError> {
        Manager::refresh(self, cancel, PROXY_REFRESH_ATTEMPTS).await
    }
}
