//! Global room monitor
//!
//! Periodically scans enabled rooms, probes which are live and starts a
//! manager for each newly-live room. The scan loop is a single task;
//! per-room liveness probes run sequentially within a scan. Managers live on
//! their own tasks afterwards, parented to the monitor's cancellation token.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RecorderConfig, RuntimeSettings};
use crate::errors::AppError;
use crate::fetcher::Fetcher;
use crate::manager::Manager;
use crate::models::{ManagerView, Room};
use crate::pool::ManagerPool;
use crate::repositories::RoomRepository;
use crate::streamers;
use crate::utils::{format_duration, format_filesize};

const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const RESTART_PAUSE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct MonitorState {
    running: bool,
    cancel: Option<CancellationToken>,
    scan_tx: Option<mpsc::Sender<()>>,
}

pub struct Monitor {
    pool: Arc<ManagerPool>,
    room_repo: Arc<dyn RoomRepository>,
    fetcher: Arc<Fetcher>,
    settings: Arc<RuntimeSettings>,
    recorder_config: RecorderConfig,
    inner: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new(
        pool: Arc<ManagerPool>,
        room_repo: Arc<dyn RoomRepository>,
        fetcher: Arc<Fetcher>,
        settings: Arc<RuntimeSettings>,
        recorder_config: RecorderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            room_repo,
            fetcher,
            settings,
            recorder_config,
            inner: Mutex::new(MonitorState::default()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().expect("monitor lock poisoned").running
    }

    /// Start the scan loop. Idempotent: a second call warns and returns.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if inner.running {
            warn!("monitor already running");
            return;
        }

        let cancel = parent.child_token();
        let (scan_tx, scan_rx) = mpsc::channel(1);
        inner.running = true;
        inner.cancel = Some(cancel.clone());
        inner.scan_tx = Some(scan_tx);
        drop(inner);

        info!("monitor started");
        tokio::spawn(Arc::clone(self).scan_loop(cancel, scan_rx));
    }

    /// Stop the scan loop. Managers already started keep running until their
    /// parent token (the monitor's) is cancelled, which this does.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if !inner.running {
            warn!("monitor is not running");
            return;
        }
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        inner.scan_tx = None;
        inner.running = false;
        info!("monitor stopped");
    }

    /// Stop, short pause, start again against the same parent.
    pub async fn restart(self: &Arc<Self>, parent: &CancellationToken) {
        self.stop();
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(parent);
    }

    /// Request an immediate scan. Non-blocking; dropped when one is pending.
    pub fn trigger_scan(&self) {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        match inner.scan_tx.as_ref() {
            Some(tx) => {
                if tx.try_send(()).is_ok() {
                    info!("scan triggered");
                }
            }
            None => warn!("scan trigger ignored, monitor is not running"),
        }
    }

    async fn scan_loop(self: Arc<Self>, cancel: CancellationToken, mut scan_rx: mpsc::Receiver<()>) {
        // First scan runs right away so startup does not wait a full tick.
        self.scan_rooms().await;
        let mut ticker = interval_at(Instant::now() + SCAN_INTERVAL, SCAN_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = scan_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("running triggered scan");
                }
                _ = ticker.tick() => {
                    info!("running scheduled scan");
                }
            }
            self.scan_rooms().await;
        }

        info!("monitor scan loop exited");
    }

    async fn scan_rooms(self: &Arc<Self>) {
        let rooms = match self.room_repo.get_enabled_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                error!("failed to list enabled rooms: {}", e);
                return;
            }
        };

        for room in rooms {
            if self.pool.contains(room.id) {
                continue;
            }

            match streamers::room_live_status(&self.fetcher, room.platform, &room.real_id).await {
                Ok(1) => {
                    info!(
                        "room {} ({}) went live, starting manager",
                        room.id, room.anchor_name
                    );
                    if let Err(e) = self.start_manager(room.id).await {
                        error!("failed to start manager for room {}: {}", room.id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("liveness probe failed for room {}: {}", room.id, e);
                }
            }
        }
    }

    /// Construct a manager for a room, insert it into the pool and start its
    /// auto-refresh loop. Also the manual path used by the handler layer.
    pub async fn start_manager(self: &Arc<Self>, room_id: i64) -> Result<(), AppError> {
        if room_id <= 0 {
            return Err(AppError::validation("room id must be positive"));
        }
        if self.pool.contains(room_id) {
            return Err(AppError::validation("room is already running"));
        }

        let room = self
            .room_repo
            .get_room_by_id(room_id)
            .await?
            .ok_or_else(|| AppError::not_found("room", room_id.to_string()))?;
        if !room.enabled {
            return Err(AppError::validation("room is disabled"));
        }

        let pool = Arc::clone(&self.pool);
        let manager = Manager::new(
            room,
            Arc::clone(&self.fetcher),
            self.recorder_config.clone(),
            &self.settings,
            move |id| {
                info!("manager for room {} stopped, removing from pool", id);
                pool.remove(id);
            },
        );

        self.pool.add(room_id, Arc::clone(&manager));
        info!("manager for room {} added to pool", room_id);

        let parent = self
            .inner
            .lock()
            .expect("monitor lock poisoned")
            .cancel
            .clone()
            .unwrap_or_default();
        manager.start_auto_refresh(&parent);
        Ok(())
    }

    /// Enabled rooms joined with current pool state for the handler layer.
    pub async fn manager_list(&self) -> Result<Vec<ManagerView>, AppError> {
        let rooms = self.room_repo.get_enabled_rooms().await?;
        let snapshot = self.pool.snapshot();

        Ok(rooms
            .into_iter()
            .map(|room| {
                let manager = snapshot.get(&room.id);
                build_view(room, manager.map(|manager| &**manager))
            })
            .collect())
    }
}

fn build_view(room: Room, manager: Option<&Manager>) -> ManagerView {
    let progress = manager.and_then(Manager::record_progress);
    let recording = progress.is_some();

    ManagerView {
        room_id: room.id,
        platform: room.platform,
        real_id: room.real_id,
        name: room.name,
        cover_url: room.cover_url,
        anchor_id: room.anchor_id,
        anchor_name: room.anchor_name,
        anchor_avatar: room.anchor_avatar,
        live_status: i32::from(manager.is_some()),
        url: room.url,
        proxy_url: room.proxy_url,
        current_url: manager.and_then(Manager::current_url),
        last_refresh: manager.and_then(Manager::last_refresh_time),
        expire_time: manager.and_then(Manager::actual_expire_time),
        record_status: i32::from(recording),
        record_file: progress.as_ref().map(|p| p.filename.clone()),
        record_size: progress.as_ref().map(|p| p.filesize).unwrap_or(0),
        record_size_str: format_filesize(progress.as_ref().map(|p| p.filesize).unwrap_or(0)),
        record_duration: progress.as_ref().map(|p| p.duration_secs).unwrap_or(0.0),
        record_duration_str: format_duration(
            progress.as_ref().map(|p| p.duration_secs).unwrap_or(0.0),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::models::{Platform, RoomAddInfo};
    use async_trait::async_trait;
    use chrono::Utc;

    struct EmptyRoomRepository;

    #[async_trait]
    impl RoomRepository for EmptyRoomRepository {
        async fn get_enabled_rooms(&self) -> Result<Vec<Room>, AppError> {
            Ok(Vec::new())
        }
        async fn get_room_by_id(&self, _id: i64) -> Result<Option<Room>, AppError> {
            Ok(None)
        }
        async fn find_room(
            &self,
            _platform: Platform,
            _real_id: &str,
        ) -> Result<Option<Room>, AppError> {
            Ok(None)
        }
        async fn list_rooms(&self) -> Result<Vec<Room>, AppError> {
            Ok(Vec::new())
        }
        async fn insert_room(
            &self,
            _info: &RoomAddInfo,
            _record_enabled: bool,
            _proxy_url_template: &str,
        ) -> Result<Room, AppError> {
            Err(AppError::internal("not supported"))
        }
        async fn update_room_flags(
            &self,
            _id: i64,
            _enabled: Option<bool>,
            _record_enabled: Option<bool>,
        ) -> Result<(), AppError> {
            Ok(())
        }
        async fn delete_room(&self, _id: i64) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn monitor() -> Arc<Monitor> {
        Monitor::new(
            Arc::new(ManagerPool::new()),
            Arc::new(EmptyRoomRepository),
            Arc::new(Fetcher::new(&ProxyConfig::default()).expect("client")),
            Arc::new(RuntimeSettings::new(Default::default())),
            RecorderConfig {
                output_dir: "/tmp".into(),
                filename_pattern: "rec_{Sequence}.{Ext}".to_string(),
                max_filesize: 0,
                max_duration: 0,
                ffmpeg_command: "ffmpeg".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let monitor = monitor();
        let parent = CancellationToken::new();

        monitor.start(&parent);
        monitor.start(&parent);
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn trigger_without_running_monitor_is_a_noop() {
        let monitor = monitor();
        monitor.trigger_scan();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn start_manager_validates_its_input() {
        let monitor = monitor();
        assert!(matches!(
            monitor.start_manager(0).await,
            Err(AppError::Validation { .. })
        ));
        assert!(matches!(
            monitor.start_manager(42).await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn manager_list_is_empty_without_rooms() {
        let monitor = monitor();
        assert!(monitor.manager_list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn restart_leaves_the_monitor_running() {
        let monitor = monitor();
        let parent = CancellationToken::new();
        monitor.start(&parent);
        monitor.restart(&parent).await;
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[test]
    fn view_of_an_unmanaged_room_is_offline() {
        let room = Room {
            id: 9,
            platform: Platform::Bilibili,
            real_id: "1".to_string(),
            short_id: None,
            name: "room".to_string(),
            url: String::new(),
            cover_url: None,
            anchor_id: None,
            anchor_name: "anchor".to_string(),
            anchor_avatar: None,
            proxy_url: String::new(),
            enabled: true,
            record_enabled: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let view = build_view(room, None);
        assert_eq!(view.live_status, 0);
        assert_eq!(view.record_status, 0);
        assert!(view.current_url.is_none());
    }
}
