//! Recorder output files
//!
//! Filenames are rendered from a user template with `{Username}`, `{Year}`,
//! `{Month}`, `{Day}`, `{Hour}`, `{Minute}`, `{Second}`, `{Sequence}`,
//! `{RoomRealId}` and `{Ext}` tokens. `{Sequence}` keeps parallel or resumed
//! recordings from clobbering each other and is appended to the template when
//! missing, as is `{Ext}`.

use chrono::{Local, TimeZone};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tracing::warn;

use crate::config::RecorderConfig;
use crate::errors::RecorderError;

const SEQUENCE_TOKEN: &str = "{Sequence}";
const EXT_TOKEN: &str = "{Ext}";
const SEQUENCE_PROBE_LIMIT: u32 = 1000;

/// One open output file
pub struct OutputFile {
    pub file: File,
    pub path: PathBuf,
}

/// Filename state for one recording session
pub struct OutputRotation {
    dir: PathBuf,
    pattern: String,
    username: String,
    room_real_id: String,
    /// Stream open time, epoch seconds; all date tokens derive from it
    stream_at: i64,
    ext: String,
    sequence: u32,
}

impl OutputRotation {
    pub fn new(config: &RecorderConfig, username: &str, room_real_id: &str, stream_at: i64) -> Self {
        Self {
            dir: config.output_dir.clone(),
            pattern: normalize_pattern(&config.filename_pattern),
            username: username.to_string(),
            room_real_id: room_real_id.to_string(),
            stream_at,
            ext: "ts".to_string(),
            sequence: 0,
        }
    }

    fn render(&self, sequence: u32) -> PathBuf {
        let time = Local
            .timestamp_opt(self.stream_at, 0)
            .single()
            .unwrap_or_else(Local::now);

        let rendered = self
            .pattern
            .replace("{Username}", &self.username)
            .replace("{Year}", &time.format("%Y").to_string())
            .replace("{Month}", &time.format("%m").to_string())
            .replace("{Day}", &time.format("%d").to_string())
            .replace("{Hour}", &time.format("%H").to_string())
            .replace("{Minute}", &time.format("%M").to_string())
            .replace("{Second}", &time.format("%S").to_string())
            .replace("{RoomRealId}", &self.room_real_id)
            .replace(SEQUENCE_TOKEN, &sequence.to_string())
            .replace(EXT_TOKEN, &self.ext);

        self.dir.join(rendered)
    }

    /// Smallest sequence whose rendered path does not exist yet. Bounded
    /// linear probe so a pathological directory cannot spin forever.
    async fn probe_sequence(&mut self) -> Result<(), RecorderError> {
        for candidate in self.sequence..self.sequence + SEQUENCE_PROBE_LIMIT {
            let path = self.render(candidate);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            self.sequence = candidate;
            return Ok(());
        }
        Err(RecorderError::pattern(
            "no free sequence number within probe limit",
        ))
    }

    /// Close out `previous` (if any) and open the next output file.
    pub async fn next_file(
        &mut self,
        previous: Option<OutputFile>,
    ) -> Result<OutputFile, RecorderError> {
        if let Some(previous) = previous {
            if let Err(e) = cleanup(previous).await {
                warn!("cleanup of previous output file failed: {}", e);
            }
        }

        self.probe_sequence().await?;
        let path = self.render(self.sequence);
        self.sequence += 1;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(OutputFile { file, path })
    }
}

/// Sync and close an output file, removing it when nothing was written.
pub async fn cleanup(output: OutputFile) -> Result<(), RecorderError> {
    let OutputFile { file, path } = output;
    file.sync_all().await?;
    drop(file);

    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.len() == 0 => {
            tokio::fs::remove_file(&path).await?;
        }
        _ => {}
    }
    Ok(())
}

fn normalize_pattern(pattern: &str) -> String {
    let mut pattern = pattern.to_string();
    if !pattern.contains(SEQUENCE_TOKEN) {
        pattern.push_str("_{Sequence}");
    }
    if !pattern.contains(EXT_TOKEN) {
        pattern.push_str(".{Ext}");
    }
    pattern
}

/// Rotation decision: either threshold of 0 disables its side.
pub fn should_switch_file(
    filesize: u64,
    duration_secs: f64,
    max_filesize_bytes: u64,
    max_duration_secs: u64,
) -> bool {
    (max_duration_secs > 0 && duration_secs >= max_duration_secs as f64)
        || (max_filesize_bytes > 0 && filesize >= max_filesize_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(dir: &Path, pattern: &str) -> RecorderConfig {
        RecorderConfig {
            output_dir: dir.to_path_buf(),
            filename_pattern: pattern.to_string(),
            max_filesize: 0,
            max_duration: 0,
            ffmpeg_command: "ffmpeg".to_string(),
        }
    }

    #[test]
    fn pattern_gains_sequence_and_ext_when_missing() {
        assert_eq!(normalize_pattern("{Username}"), "{Username}_{Sequence}.{Ext}");
        assert_eq!(
            normalize_pattern("{Username}_{Sequence}.{Ext}"),
            "{Username}_{Sequence}.{Ext}"
        );
    }

    #[test]
    fn render_substitutes_all_tokens() {
        let rotation = OutputRotation::new(
            &config(
                &PathBuf::from("/tmp/records"),
                "{Username}/{RoomRealId}_{Year}{Month}{Day}_{Sequence}.{Ext}",
            ),
            "anchor",
            "22109408",
            0,
        );
        let path = rotation.render(3);
        let rendered = path.to_string_lossy();
        assert!(rendered.starts_with("/tmp/records/anchor/22109408_"));
        assert!(rendered.ends_with("_3.ts"));
        assert!(!rendered.contains('{'));
    }

    #[tokio::test]
    async fn sequence_probe_skips_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rotation = OutputRotation::new(
            &config(dir.path(), "rec_{Sequence}.{Ext}"),
            "anchor",
            "1",
            0,
        );

        tokio::fs::write(dir.path().join("rec_0.ts"), b"x")
            .await
            .expect("seed file");
        tokio::fs::write(dir.path().join("rec_1.ts"), b"x")
            .await
            .expect("seed file");

        let output = rotation.next_file(None).await.expect("next file");
        assert_eq!(output.path, dir.path().join("rec_2.ts"));
    }

    #[tokio::test]
    async fn cleanup_removes_zero_byte_files_and_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rotation =
            OutputRotation::new(&config(dir.path(), "rec_{Sequence}.{Ext}"), "a", "1", 0);

        let empty = rotation.next_file(None).await.expect("file");
        let empty_path = empty.path.clone();
        cleanup(empty).await.expect("cleanup");
        assert!(!empty_path.exists());

        let mut full = rotation.next_file(None).await.expect("file");
        use tokio::io::AsyncWriteExt;
        full.file.write_all(b"payload").await.expect("write");
        let full_path = full.path.clone();
        cleanup(full).await.expect("cleanup");
        assert!(full_path.exists());
    }

    #[test]
    fn rotation_thresholds_respect_zero_disables() {
        assert!(!should_switch_file(u64::MAX, f64::MAX, 0, 0));
        assert!(should_switch_file(100, 0.0, 100, 0));
        assert!(!should_switch_file(99, 0.0, 100, 0));
        assert!(should_switch_file(0, 60.0, 0, 60));
        assert!(!should_switch_file(0, 59.0, 0, 60));
    }
}
