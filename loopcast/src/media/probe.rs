//! Codec inspection through ffprobe.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use process_utils::tokio_command;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Codec names of the first video and first audio stream.
///
/// `None` means the stream could not be identified (missing, or the probe
/// failed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCodecs {
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl MediaCodecs {
    pub fn new(video: Option<&str>, audio: Option<&str>) -> Self {
        Self {
            video: video.map(str::to_string),
            audio: audio.map(str::to_string),
        }
    }
}

/// Stream selector passed to the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn selector(self) -> &'static str {
        match self {
            Self::Video => "v:0",
            Self::Audio => "a:0",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// Reports the codecs of a media file.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Probe both streams. Never fails: an unidentified stream is `None`.
    async fn probe(&self, path: &Path) -> MediaCodecs;
}

/// [`MediaProber`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary_path: String,
}

impl FfprobeProber {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Probe a single stream.
    pub async fn probe_stream(&self, path: &Path, kind: StreamKind) -> Result<String> {
        let failed = |reason: String| Error::ProbeFailed {
            path: path.to_path_buf(),
            stream: kind.as_str(),
            reason,
        };

        let output = tokio_command(&self.binary_path)
            .args(["-v", "error", "-select_streams", kind.selector()])
            .args(["-show_entries", "stream=codec_name"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| failed(format!("failed to run {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(codec) => Ok(codec.to_string()),
            None => Err(failed("no such stream".to_string())),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> MediaCodecs {
        let mut codecs = MediaCodecs::default();

        for kind in [StreamKind::Video, StreamKind::Audio] {
            let codec = match self.probe_stream(path, kind).await {
                Ok(codec) => Some(codec),
                Err(e) => {
                    warn!(error = %e, "Codec detection failed, assuming re-encode");
                    None
                }
            };
            match kind {
                StreamKind::Video => codecs.video = codec,
                StreamKind::Audio => codecs.audio = codec,
            }
        }

        debug!(path = %path.display(), video = ?codecs.video, audio = ?codecs.audio, "Probed media");
        codecs
    }
}

/// Detect a tool's version line (`<binary> -version`).
///
/// `None` means the tool is not installed or not runnable.
pub async fn detect_version(binary_path: &str) -> Option<String> {
    let output = tokio_command(binary_path)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8(output.stdout)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.to_string()))
}
