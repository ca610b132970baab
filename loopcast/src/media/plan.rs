//! Transcoder invocation planning.
//!
//! The plan is a pure function of the probed codecs and the encoding config:
//! streams that are already H.264 + AAC are copied, everything else
//! (including anything the prober could not identify) is re-encoded.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::probe::MediaCodecs;
use crate::config::EncodingConfig;

/// Keyframe interval in frames for re-encoded output.
pub const KEYFRAME_INTERVAL: u32 = 120;

/// How the transcoder treats the input streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Copy both streams verbatim.
    PassThrough,
    /// Re-encode to H.264 + AAC.
    ReEncode,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PassThrough => f.write_str("pass-through"),
            Self::ReEncode => f.write_str("re-encode"),
        }
    }
}

/// An immutable transcoder plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPlan {
    pub mode: PipelineMode,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub preset: String,
}

fn normalized(codec: Option<&str>) -> Option<String> {
    codec
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
}

impl EncodingPlan {
    /// Choose the pipeline for the given codecs.
    pub fn plan(codecs: &MediaCodecs, config: &EncodingConfig) -> Self {
        let video_codec = normalized(codecs.video.as_deref());
        let audio_codec = normalized(codecs.audio.as_deref());

        let mode = match (video_codec.as_deref(), audio_codec.as_deref()) {
            (Some("h264"), Some("aac")) => PipelineMode::PassThrough,
            _ => PipelineMode::ReEncode,
        };

        Self {
            mode,
            video_codec,
            audio_codec,
            bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            preset: config.preset.clone(),
        }
    }

    /// Build the transcoder arguments for looping `input` to `destination`.
    pub fn build_args(&self, input: &Path, destination: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-re", "-stream_loop", "-1", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(input.to_string_lossy().to_string());

        match self.mode {
            PipelineMode::PassThrough => {
                args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
            }
            PipelineMode::ReEncode => {
                let video_rate = format!("{}k", self.bitrate_kbps);
                let keyint = KEYFRAME_INTERVAL.to_string();
                args.extend([
                    "-c:v".to_string(),
                    "libx264".to_string(),
                    "-preset".to_string(),
                    self.preset.clone(),
                    "-b:v".to_string(),
                    video_rate.clone(),
                    "-maxrate".to_string(),
                    video_rate,
                    "-bufsize".to_string(),
                    format!("{}k", self.bitrate_kbps.saturating_mul(2)),
                    "-g".to_string(),
                    keyint.clone(),
                    "-keyint_min".to_string(),
                    keyint,
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                    "-c:a".to_string(),
                    "aac".to_string(),
                    "-b:a".to_string(),
                    format!("{}k", self.audio_bitrate_kbps),
                ]);
            }
        }

        args.extend(["-f".to_string(), "flv".to_string(), destination.to_string()]);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn plan(video: Option<&str>, audio: Option<&str>) -> EncodingPlan {
        EncodingPlan::plan(&MediaCodecs::new(video, audio), &EncodingConfig::default())
    }

    #[rstest]
    #[case(Some("h264"), Some("aac"))]
    #[case(Some("H264"), Some("AAC"))]
    #[case(Some(" h264\n"), Some("aac "))]
    fn test_pass_through(#[case] video: Option<&str>, #[case] audio: Option<&str>) {
        assert_eq!(plan(video, audio).mode, PipelineMode::PassThrough);
    }

    #[rstest]
    #[case(None, None)]
    #[case(Some("h264"), None)]
    #[case(None, Some("aac"))]
    #[case(Some("hevc"), Some("aac"))]
    #[case(Some("h264"), Some("opus"))]
    #[case(Some("aac"), Some("h264"))]
    #[case(Some(""), Some("aac"))]
    #[case(Some("vp9"), Some("vorbis"))]
    fn test_re_encode(#[case] video: Option<&str>, #[case] audio: Option<&str>) {
        assert_eq!(plan(video, audio).mode, PipelineMode::ReEncode);
    }

    #[test]
    fn test_plan_is_deterministic() {
        assert_eq!(plan(Some("hevc"), Some("aac")), plan(Some("hevc"), Some("aac")));
    }

    #[test]
    fn test_pass_through_args() {
        let args = plan(Some("h264"), Some("aac"))
            .build_args(Path::new("/stream/movie.mp4"), "rtmp://host/live/key");

        assert_eq!(
            args,
            vec![
                "-hide_banner", "-nostdin", "-re", "-stream_loop", "-1", "-i",
                "/stream/movie.mp4", "-c:v", "copy", "-c:a", "copy", "-f", "flv",
                "rtmp://host/live/key",
            ]
        );
        assert!(!args.iter().any(|a| a == "-b:v" || a == "-maxrate"));
    }

    #[test]
    fn test_re_encode_args() {
        let config = EncodingConfig {
            preset: "fast".to_string(),
            video_bitrate_kbps: 3000,
            audio_bitrate_kbps: 160,
        };
        let plan = EncodingPlan::plan(&MediaCodecs::new(Some("hevc"), Some("ac3")), &config);
        let args = plan.build_args(Path::new("movie.mkv"), "rtmp://host/live/key");

        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -nostdin -re -stream_loop -1 -i movie.mkv"));
        assert!(joined.contains("-c:v libx264 -preset fast"));
        assert!(joined.contains("-b:v 3000k -maxrate 3000k -bufsize 6000k"));
        assert!(joined.contains("-g 120 -keyint_min 120 -pix_fmt yuv420p"));
        assert!(joined.contains("-c:a aac -b:a 160k"));
        assert!(joined.ends_with("-f flv rtmp://host/live/key"));
    }
}
