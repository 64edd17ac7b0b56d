//! Stream recorder
//!
//! Drives an external muxer (`ffmpeg`) that copies the selected CDN line's
//! stream to stdout; the recorder pumps stdout into rotated TS files. A
//! watchdog kills the subprocess when no bytes arrive for a minute, and fast
//! repeated subprocess failures rotate through the available CDN lines before
//! the recorder gives up and surfaces the failure to its manager.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::errors::RecorderError;
use crate::models::{RecordProgress, Room};

pub mod output;

use output::{cleanup, should_switch_file, OutputFile, OutputRotation};

const STALL_TIMEOUT: Duration = Duration::from_secs(60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
/// A subprocess dying faster than this counts as a rapid failure
const RAPID_FAIL_WINDOW: Duration = Duration::from_secs(10);
const ALL_LINES_COOLOFF: Duration = Duration::from_secs(60);
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(2);
const READ_BUFFER_SIZE: usize = 32 * 1024;

const MUXER_USER_AGENT: &str = "Mozilla/5.0 (iPod; CPU iPhone OS 14_5 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/87.0.4280.163 Mobile/15E148 Safari/604.1";

/// What to do after the muxer subprocess exits
#[derive(Debug, PartialEq, Eq)]
enum RestartAction {
    /// Fast failure with lines left to try: rotate and restart
    SwitchLine,
    /// Every line failed in quick succession: cool off, then give up
    CoolOffAndFail,
    /// The stream ran for a while: surface the error to the manager
    Surface,
}

fn restart_action(run_duration: Duration, rapid_fail_count: usize, line_count: usize) -> RestartAction {
    if run_duration >= RAPID_FAIL_WINDOW {
        return RestartAction::Surface;
    }
    if rapid_fail_count > line_count {
        RestartAction::CoolOffAndFail
    } else {
        RestartAction::SwitchLine
    }
}

struct LineSet {
    urls: Vec<String>,
    index: usize,
}

struct OutputState {
    rotation: OutputRotation,
    file: Option<OutputFile>,
}

pub struct Recorder {
    config: RecorderConfig,
    lines: Mutex<LineSet>,
    output: tokio::sync::Mutex<OutputState>,
    current_path: RwLock<String>,
    /// Bytes written to the current file
    filesize: AtomicU64,
    /// Cumulative muxer progress, parsed from stderr `time=` tokens
    total_duration_ms: AtomicU64,
    /// Progress value at the moment the current file was opened
    duration_offset_ms: AtomicU64,
    last_activity_unix: AtomicI64,
    running: AtomicBool,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        stream_urls: &BTreeMap<String, String>,
        room: &Room,
        open_time: i64,
    ) -> Result<Self, RecorderError> {
        if stream_urls.is_empty() {
            return Err(RecorderError::muxer("stream url set is empty"));
        }

        let rotation = OutputRotation::new(&config, &room.anchor_name, &room.real_id, open_time);

        Ok(Self {
            config,
            lines: Mutex::new(LineSet {
                urls: stream_urls.values().cloned().collect(),
                index: 0,
            }),
            output: tokio::sync::Mutex::new(OutputState {
                rotation,
                file: None,
            }),
            current_path: RwLock::new(String::new()),
            filesize: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            duration_offset_ms: AtomicU64::new(0),
            last_activity_unix: AtomicI64::new(0),
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replace the line set; takes effect on the next subprocess restart.
    pub fn update_stream_urls(&self, stream_urls: &BTreeMap<String, String>) {
        let mut lines = self.lines.lock().expect("line lock poisoned");
        lines.urls = stream_urls.values().cloned().collect();
        lines.index = 0;
        info!("recorder line set replaced ({} lines)", lines.urls.len());
    }

    /// True when the given URL set matches the recorder's current lines.
    pub fn urls_match(&self, stream_urls: &BTreeMap<String, String>) -> bool {
        let lines = self.lines.lock().expect("line lock poisoned");
        let incoming: Vec<&String> = stream_urls.values().collect();
        lines.urls.len() == incoming.len()
            && lines.urls.iter().zip(incoming).all(|(a, b)| a == b)
    }

    pub fn progress(&self) -> RecordProgress {
        let total = self.total_duration_ms.load(Ordering::SeqCst);
        let offset = self.duration_offset_ms.load(Ordering::SeqCst);
        RecordProgress {
            filename: self.current_path.read().expect("path lock poisoned").clone(),
            filesize: self.filesize.load(Ordering::SeqCst),
            duration_secs: total.saturating_sub(offset) as f64 / 1000.0,
        }
    }

    fn current_url(&self) -> String {
        let mut lines = self.lines.lock().expect("line lock poisoned");
        if lines.urls.is_empty() {
            return String::new();
        }
        if lines.index >= lines.urls.len() {
            lines.index = 0;
        }
        lines.urls[lines.index].clone()
    }

    fn line_count(&self) -> usize {
        self.lines.lock().expect("line lock poisoned").urls.len()
    }

    fn switch_next_line(&self) {
        let mut lines = self.lines.lock().expect("line lock poisoned");
        if lines.urls.len() <= 1 {
            lines.index = 0;
            return;
        }
        lines.index = (lines.index + 1) % lines.urls.len();
        info!("recorder switched to line {}: {}", lines.index + 1, lines.urls[lines.index]);
    }

    /// Run the recording loop until cancellation or an unrecoverable failure.
    ///
    /// Blocks on the calling task; the manager runs it on a dedicated task and
    /// reacts to the returned error by triggering its own refresh.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), RecorderError> {
        self.open_next_file().await?;
        self.running.store(true, Ordering::SeqCst);
        let mut rapid_fail_count = 0usize;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let url = self.current_url();
            info!("starting muxer for {}", url);

            let mut child = match self.spawn_muxer(&url) {
                Ok(child) => child,
                Err(e) => {
                    warn!("failed to spawn muxer: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(SPAWN_RETRY_DELAY) => continue,
                    }
                }
            };

            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(Arc::clone(self).parse_stderr(stderr));
            }

            let started = Instant::now();
            let pipe_result = self.read_pipe(&cancel, &mut child).await;
            let _ = child.wait().await;

            if cancel.is_cancelled() {
                info!("recording stopped");
                break Ok(());
            }

            let run_duration = started.elapsed();
            let error = pipe_result.err().unwrap_or_else(|| {
                RecorderError::muxer("muxer exited without error detail")
            });
            warn!(
                "recording interrupted after {:.1}s: {}",
                run_duration.as_secs_f64(),
                error
            );

            if run_duration < RAPID_FAIL_WINDOW {
                rapid_fail_count += 1;
            } else {
                rapid_fail_count = 0;
            }

            match restart_action(run_duration, rapid_fail_count, self.line_count()) {
                RestartAction::SwitchLine => {
                    self.switch_next_line();
                    continue;
                }
                RestartAction::CoolOffAndFail => {
                    error!("every stream line failed in quick succession, cooling off");
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(ALL_LINES_COOLOFF) => {}
                    }
                    break Err(RecorderError::AllLinesFailed);
                }
                RestartAction::Surface => break Err(error),
            }
        };

        self.running.store(false, Ordering::SeqCst);
        let mut output = self.output.lock().await;
        if let Some(file) = output.file.take() {
            if let Err(e) = cleanup(file).await {
                warn!("cleanup on recorder exit failed: {}", e);
            }
        }
        result
    }

    fn spawn_muxer(&self, url: &str) -> Result<Child, RecorderError> {
        let mut command = Command::new(&self.config.ffmpeg_command);
        command
            .args(["-y", "-hide_banner", "-loglevel", "error", "-stats"])
            // Reconnect flags must precede -i
            .args(["-reconnect", "1"])
            .args(["-reconnect_at_eof", "1"])
            .args(["-reconnect_streamed", "1"])
            .args(["-reconnect_delay_max", "5"])
            .args(["-user_agent", MUXER_USER_AGENT])
            .args(["-i", url])
            .args(["-c", "copy"])
            .args(["-f", "mpegts"])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command.spawn()?)
    }

    /// Pump stdout into the current file while a watchdog checks for stalls.
    async fn read_pipe(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        child: &mut Child,
    ) -> Result<(), RecorderError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecorderError::muxer("muxer stdout not captured"))?;

        self.touch_activity();
        let mut pump = tokio::spawn(Arc::clone(self).pump_stdout(stdout));
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    pump.abort();
                    return Ok(());
                }
                joined = &mut pump => {
                    let _ = child.start_kill();
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(RecorderError::muxer(format!("pump task failed: {e}"))),
                    };
                }
                _ = ticker.tick() => {
                    let last = self.last_activity_unix.load(Ordering::SeqCst);
                    let idle = chrono::Utc::now().timestamp().saturating_sub(last);
                    if idle > STALL_TIMEOUT.as_secs() as i64 {
                        error!(
                            "no bytes from muxer for {}s, killing subprocess ({})",
                            idle,
                            self.current_url()
                        );
                        let _ = child.start_kill();
                        pump.abort();
                        return Err(RecorderError::Stalled(idle as u64));
                    }
                }
            }
        }
    }

    async fn pump_stdout(self: Arc<Self>, mut stdout: ChildStdout) -> Result<(), RecorderError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                return Err(RecorderError::muxer("muxer stream ended"));
            }
            self.touch_activity();
            self.append(&buf[..n]).await?;
        }
    }

    async fn append(&self, chunk: &[u8]) -> Result<(), RecorderError> {
        let mut output = self.output.lock().await;
        let file = output
            .file
            .as_mut()
            .ok_or_else(|| RecorderError::muxer("no output file open"))?;
        file.file.write_all(chunk).await?;

        let filesize = self
            .filesize
            .fetch_add(chunk.len() as u64, Ordering::SeqCst)
            + chunk.len() as u64;

        let duration_secs = self.progress().duration_secs;
        if should_switch_file(
            filesize,
            duration_secs,
            self.config.max_filesize * 1024 * 1024,
            self.config.max_duration * 60,
        ) {
            drop(output);
            self.open_next_file().await?;
            info!(
                "max filesize or duration exceeded, rotated to {}",
                self.current_path.read().expect("path lock poisoned")
            );
        }
        Ok(())
    }

    async fn open_next_file(&self) -> Result<(), RecorderError> {
        let mut output = self.output.lock().await;
        let previous = output.file.take();
        let next = output.rotation.next_file(previous).await?;

        *self.current_path.write().expect("path lock poisoned") =
            next.path.to_string_lossy().into_owned();
        self.filesize.store(0, Ordering::SeqCst);
        self.duration_offset_ms
            .store(self.total_duration_ms.load(Ordering::SeqCst), Ordering::SeqCst);
        output.file = Some(next);
        Ok(())
    }

    fn touch_activity(&self) {
        self.last_activity_unix
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Read muxer progress off stderr. Progress lines carry a cumulative
    /// `time=HH:MM:SS.cs` token and are `\r`-terminated; everything else is
    /// diagnostics worth keeping at debug level.
    async fn parse_stderr(self: Arc<Self>, stderr: ChildStderr) {
        let progress = match regex::Regex::new(r"time=(\d+):(\d{2}):(\d{2})\.(\d+)") {
            Ok(re) => re,
            Err(e) => {
                warn!("progress pattern failed to compile: {}", e);
                return;
            }
        };

        let mut reader = BufReader::new(stderr);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\r', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }

            for piece in raw.split(|byte| *byte == b'\n' || *byte == b'\r') {
                let line = String::from_utf8_lossy(piece);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(ms) = parse_progress_ms(&progress, line) {
                    self.total_duration_ms.store(ms, Ordering::SeqCst);
                } else {
                    debug!("muxer: {}", line);
                }
            }
        }
    }
}

fn parse_progress_ms(pattern: &regex::Regex, line: &str) -> Option<u64> {
    let captures = pattern.captures(line)?;
    let hours: u64 = captures[1].parse().ok()?;
    let minutes: u64 = captures[2].parse().ok()?;
    let seconds: u64 = captures[3].parse().ok()?;
    let centis: u64 = captures[4].parse().ok()?;
    Some(((hours * 3600 + minutes * 60 + seconds) * 100 + centis) * 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn room() -> Room {
        Room {
            id: 1,
            platform: crate::models::Platform::Bilibili,
            real_id: "22109408".to_string(),
            short_id: None,
            name: "test room".to_string(),
            url: "https://live.bilibili.com/22109408".to_string(),
            cover_url: None,
            anchor_id: None,
            anchor_name: "anchor".to_string(),
            anchor_avatar: None,
            proxy_url: String::new(),
            enabled: true,
            record_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn recorder(lines: &[&str]) -> Arc<Recorder> {
        let urls: BTreeMap<String, String> = lines
            .iter()
            .enumerate()
            .map(|(i, url)| (format!("线路{}", i + 1), url.to_string()))
            .collect();
        let config = RecorderConfig {
            output_dir: PathBuf::from("/tmp"),
            filename_pattern: "rec_{Sequence}.{Ext}".to_string(),
            max_filesize: 0,
            max_duration: 0,
            ffmpeg_command: "ffmpeg".to_string(),
        };
        Arc::new(Recorder::new(config, &urls, &room(), 0).expect("recorder"))
    }

    #[test]
    fn empty_url_set_is_rejected() {
        let config = RecorderConfig {
            output_dir: PathBuf::from("/tmp"),
            filename_pattern: "rec_{Sequence}.{Ext}".to_string(),
            max_filesize: 0,
            max_duration: 0,
            ffmpeg_command: "ffmpeg".to_string(),
        };
        assert!(Recorder::new(config, &BTreeMap::new(), &room(), 0).is_err());
    }

    #[test]
    fn line_rotation_wraps_and_single_line_stays_put() {
        let rec = recorder(&["http://a", "http://b", "http://c"]);
        assert_eq!(rec.current_url(), "http://a");
        rec.switch_next_line();
        assert_eq!(rec.current_url(), "http://b");
        rec.switch_next_line();
        rec.switch_next_line();
        assert_eq!(rec.current_url(), "http://a");

        let single = recorder(&["http://only"]);
        single.switch_next_line();
        assert_eq!(single.current_url(), "http://only");
    }

    #[test]
    fn url_update_resets_the_line_index() {
        let rec = recorder(&["http://a", "http://b"]);
        rec.switch_next_line();
        assert_eq!(rec.current_url(), "http://b");

        let fresh: BTreeMap<String, String> =
            BTreeMap::from([("线路1".to_string(), "http://new".to_string())]);
        rec.update_stream_urls(&fresh);
        assert_eq!(rec.current_url(), "http://new");
        assert!(rec.urls_match(&fresh));
    }

    #[test]
    fn urls_match_detects_changed_sets() {
        let rec = recorder(&["http://a", "http://b"]);
        let same: BTreeMap<String, String> = BTreeMap::from([
            ("线路1".to_string(), "http://a".to_string()),
            ("线路2".to_string(), "http://b".to_string()),
        ]);
        let different: BTreeMap<String, String> = BTreeMap::from([
            ("线路1".to_string(), "http://a".to_string()),
            ("线路2".to_string(), "http://z".to_string()),
        ]);
        assert!(rec.urls_match(&same));
        assert!(!rec.urls_match(&different));
    }

    #[test]
    fn rapid_failures_rotate_then_exhaust_lines() {
        let lines = 3;
        // Failures at 3s, 2s, 1s: counts 1..=3 still rotate.
        for count in 1..=lines {
            assert_eq!(
                restart_action(Duration::from_secs(3), count, lines),
                RestartAction::SwitchLine
            );
        }
        // The fourth fast failure exceeds the line count.
        assert_eq!(
            restart_action(Duration::from_secs(1), lines + 1, lines),
            RestartAction::CoolOffAndFail
        );
    }

    #[test]
    fn long_runs_surface_to_the_manager() {
        assert_eq!(
            restart_action(Duration::from_secs(45), 0, 3),
            RestartAction::Surface
        );
    }

    #[test]
    fn progress_token_parses_to_milliseconds() {
        let re = regex::Regex::new(r"time=(\d+):(\d{2}):(\d{2})\.(\d+)").expect("regex");
        let line = "frame= 1000 fps= 30 size=  10240kB time=00:01:05.50 bitrate=1290.0kbits/s";
        assert_eq!(parse_progress_ms(&re, line), Some(65_500));
        assert_eq!(parse_progress_ms(&re, "no progress here"), None);
    }
}
