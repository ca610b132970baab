//! Static configuration.
//!
//! Loaded once at startup from a JSON file and shared through an `Arc`.
//! A missing file is created with defaults; relative paths resolve against
//! the directory holding the config file.

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils::fs;
use crate::{Error, Result};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "LOOPCAST_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "loopcast.json";

/// Transcoder encoding parameters, used only in re-encode mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// x264 preset.
    pub preset: String,
    /// Target video bitrate; also the `maxrate`, with a buffer of twice this.
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base ingest URL; the stream key is appended as the last path segment.
    pub stream_url: String,
    /// Recognized media extensions, with or without the leading dot.
    pub video_extensions: Vec<String>,
    /// File holding the stream key, relative to `working_dir`.
    pub credential_file: PathBuf,
    /// Total transcoder attempts per start, including the first.
    pub retry_limit: u32,
    /// Append-only sink for transcoder output.
    pub transcoder_log: PathBuf,
    /// IANA timezone used for log delimiters and clock-time schedules.
    pub timezone: String,
    pub encoding: EncodingConfig,
    /// Directory the transcoder reads its input from (holds the handoff link).
    pub working_dir: PathBuf,
    /// Media library.
    pub media_dir: PathBuf,
    pub lock_file: PathBuf,
    pub state_file: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub min_schedule_delay_secs: u64,
    /// How long `stop` waits after signalling before dropping the lock.
    pub stop_grace_secs: u64,
    /// Application log directory.
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            stream_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            video_extensions: [".mp4", ".mkv", ".avi", ".mov", ".flv", ".webm"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            credential_file: PathBuf::from("keystream.txt"),
            retry_limit: 5,
            transcoder_log: PathBuf::from("ffmpeg_log.txt"),
            timezone: "Asia/Makassar".to_string(),
            encoding: EncodingConfig::default(),
            working_dir: PathBuf::from("stream"),
            media_dir: PathBuf::from("uploaded_videos"),
            lock_file: PathBuf::from("stream_process.pid"),
            state_file: PathBuf::from("session_state.json"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            min_schedule_delay_secs: 10,
            stop_grace_secs: 2,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    /// Resolve the config path from the environment.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the config file, creating it with defaults if it does not exist.
    ///
    /// The returned config is validated and has absolute-ish paths (resolved
    /// against the config file's directory).
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let mut config = match fs::read_optional_sync(path)? {
            Some(raw) => {
                let config: Self = serde_json::from_str(&raw).map_err(|e| {
                    Error::config(format!("malformed JSON in {}: {}", path.display(), e))
                })?;
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            None => {
                let config = Self::default();
                config.persist(path)?;
                info!(path = %path.display(), "Configuration file not found, wrote defaults");
                config
            }
        };

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.normalize();
        config.resolve_paths(&base);
        config.validate()?;
        Ok(config)
    }

    /// Write the config to disk.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write_atomic_sync(path, &json)
    }

    fn normalize(&mut self) {
        let trimmed = self.stream_url.trim().trim_end_matches('/');
        if trimmed.len() != self.stream_url.len() {
            self.stream_url = trimmed.to_string();
        }
        if !self.stream_url.starts_with("rtmp://") && !self.stream_url.starts_with("rtmps://") {
            warn!(url = %self.stream_url, "stream_url does not look like an RTMP endpoint");
        }
    }

    /// Make every relative path relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.transcoder_log,
            &mut self.working_dir,
            &mut self.media_dir,
            &mut self.lock_file,
            &mut self.state_file,
            &mut self.log_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Check invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.stream_url.is_empty() {
            return Err(Error::config("stream_url must not be empty"));
        }
        if self.retry_limit == 0 {
            return Err(Error::config("retry_limit must be at least 1"));
        }
        if self.encoding.video_bitrate_kbps == 0 || self.encoding.audio_bitrate_kbps == 0 {
            return Err(Error::config("bitrates must be positive"));
        }
        if self.encoding.preset.trim().is_empty() {
            return Err(Error::config("encoding.preset must not be empty"));
        }
        if self.extensions().is_empty() {
            return Err(Error::config("video_extensions must list at least one extension"));
        }
        if self.credential_file.as_os_str().is_empty() {
            return Err(Error::config("credential_file must not be empty"));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|e| Error::config(format!("invalid timezone {:?}: {}", self.timezone, e)))?;
        Ok(())
    }

    /// Configured timezone (UTC if it somehow fails to parse after validation).
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Recognized extensions, lower-cased and without the leading dot.
    pub fn extensions(&self) -> Vec<String> {
        self.video_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Full path of the stream key file.
    pub fn credential_path(&self) -> PathBuf {
        self.working_dir.join(&self.credential_file)
    }

    /// Ingest URL for a stream key.
    pub fn destination_url(&self, key: &str) -> String {
        format!("{}/{}", self.stream_url.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.encoding.video_bitrate_kbps, 2500);
        assert_eq!(config.min_schedule_delay_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopcast.json");

        let config = AppConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.lock_file, dir.path().join("stream_process.pid"));
        assert_eq!(config.working_dir, dir.path().join("stream"));

        // The file on disk keeps relative paths.
        let raw: AppConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.lock_file, PathBuf::from("stream_process.pid"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopcast.json");
        std::fs::write(
            &path,
            r#"{"stream_url": "rtmp://live.example.com/app/", "retry_limit": 2}"#,
        )
        .unwrap();

        let config = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(config.stream_url, "rtmp://live.example.com/app");
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.encoding.preset, "veryfast");
        assert_eq!(
            config.destination_url("abcd"),
            "rtmp://live.example.com/app/abcd"
        );
    }

    #[test]
    fn test_malformed_json_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopcast.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = AppConfig::load_or_create(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.retry_limit = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        let mut config = AppConfig::default();
        config.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        let mut config = AppConfig::default();
        config.video_extensions = vec![".".to_string(), " ".to_string()];
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_extensions_are_normalized() {
        let mut config = AppConfig::default();
        config.video_extensions = vec![".MP4".to_string(), "mkv".to_string()];
        assert_eq!(config.extensions(), vec!["mp4", "mkv"]);
    }
}
