//! Recorder reconciliation
//!
//! After every successful refresh with recording enabled, the manager brings
//! its recorder in line with the fresh URL set: spawn one when none exists,
//! leave a running one alone when nothing changed, hot-update its lines when
//! they did, and replace a stale stopped instance.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::RecordProgress;
use crate::recorder::Recorder;

use super::Manager;

/// A recorder owned by one manager, with the cancel token for its task
pub struct RecorderHandle {
    pub(super) recorder: Arc<Recorder>,
    pub(super) cancel: CancellationToken,
}

impl Manager {
    pub(super) async fn update_recorder(self: Arc<Self>, stream_urls: BTreeMap<String, String>) {
        let mut guard = self.recorder.lock().expect("recorder lock poisoned");

        if let Some(handle) = guard.take() {
            if handle.recorder.is_running() {
                if handle.recorder.urls_match(&stream_urls) {
                    debug!("room {}: recorder URLs unchanged", self.room.id);
                } else {
                    info!("room {}: recorder URLs updated", self.room.id);
                    handle.recorder.update_stream_urls(&stream_urls);
                }
                *guard = Some(handle);
                return;
            }

            warn!("room {}: found a stopped recorder instance, respawning", self.room.id);
            handle.cancel.cancel();
        }

        let open_time = self.streamer.open_time();
        let recorder = match Recorder::new(
            self.recorder_config.clone(),
            &stream_urls,
            &self.room,
            open_time,
        ) {
            Ok(recorder) => Arc::new(recorder),
            Err(e) => {
                error!("room {}: recorder init failed: {}", self.room.id, e);
                return;
            }
        };

        info!("room {}: starting recorder", self.room.id);
        let cancel = self.cancel.child_token();
        *guard = Some(RecorderHandle {
            recorder: Arc::clone(&recorder),
            cancel: cancel.clone(),
        });
        drop(guard);

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = recorder.start(cancel).await {
                error!(
                    "room {}: recording task exited with error: {}",
                    manager.room.id, e
                );
                // A fresh URL set usually fixes a dead or stalled stream.
                manager.trigger_refresh();
            }
        });
    }

    /// Cancel and release the recorder, if any.
    pub(super) fn stop_recorder(&self) {
        let handle = self.recorder.lock().expect("recorder lock poisoned").take();
        if let Some(handle) = handle {
            info!("room {}: stopping recorder", self.room.id);
            handle.cancel.cancel();
        }
    }

    /// Progress of the running recorder, for the manager list view.
    pub fn record_progress(&self) -> Option<RecordProgress> {
        let guard = self.recorder.lock().expect("recorder lock poisoned");
        guard
            .as_ref()
            .filter(|handle| handle.recorder.is_running())
            .map(|handle| handle.recorder.progress())
    }
}
