//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Every controller operation returns one of these; nothing in the core
/// terminates the program.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("No media file selected")]
    MediaNotSelected,

    #[error("Stream key is not set")]
    CredentialMissing,

    #[error("Selected media file no longer exists: {}", path.display())]
    MediaFileAbsent { path: PathBuf },

    #[error("Cannot use {} as media: {reason}", path.display())]
    MediaRejected { path: PathBuf, reason: String },

    #[error("Probe failed for {} ({stream} stream): {reason}", path.display())]
    ProbeFailed {
        path: PathBuf,
        stream: &'static str,
        reason: String,
    },

    #[error("Failed to prepare {} for the transcoder: {source}", path.display())]
    HandoffFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Stream is not running")]
    NotRunning,

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcoder exited with {}", code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    ProcessExitNonZero { code: Option<i32> },

    #[error("Transcoder failed {attempts} times in a row, giving up")]
    RetriesExhausted { attempts: u32 },

    #[error("Invalid schedule: {0}")]
    ScheduleParseInvalid(String),

    #[error("Schedule is too soon ({requested_secs}s); the minimum is {minimum_secs}s, please resubmit")]
    ScheduleTooSoon {
        requested_secs: u64,
        minimum_secs: u64,
    },

    #[error("Lock file {} is corrupt: {content:?}", path.display())]
    LockCorrupt { path: PathBuf, content: String },

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::ScheduleParseInvalid(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn handoff(path: &Path, source: std::io::Error) -> Self {
        Self::HandoffFailed {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error is an unmet precondition the operator can fix
    /// before retrying the same command.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MediaNotSelected
                | Self::CredentialMissing
                | Self::MediaFileAbsent { .. }
                | Self::AlreadyRunning { .. }
                | Self::NotRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_display() {
        let err = Error::ProcessExitNonZero { code: Some(1) };
        assert_eq!(err.to_string(), "Transcoder exited with code 1");

        let err = Error::ProcessExitNonZero { code: None };
        assert_eq!(err.to_string(), "Transcoder exited with a signal");
    }

    #[test]
    fn test_precondition_kinds() {
        assert!(Error::MediaNotSelected.is_precondition());
        assert!(Error::AlreadyRunning { pid: 42 }.is_precondition());
        assert!(!Error::RetriesExhausted { attempts: 5 }.is_precondition());
        assert!(!Error::schedule("bad").is_precondition());
    }
}
