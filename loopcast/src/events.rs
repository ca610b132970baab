//! Notifications pushed to whoever drives the controller.

use serde::Serialize;

use crate::media::PipelineMode;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change in the live session the operator may want to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        pid: u32,
        mode: PipelineMode,
    },
    /// The transcoder failed and was spawned again.
    Respawned {
        attempt: u32,
        retry_limit: u32,
        pid: u32,
        exit_code: Option<i32>,
    },
    /// The transcoder exited cleanly.
    Completed { attempts: u32 },
    RetriesExhausted { attempts: u32 },
    Stopped { pid: u32 },
    /// A scheduled stop fired. `stopped_pid` is `None` when nothing was running.
    ScheduledStopFired {
        job: String,
        stopped_pid: Option<u32>,
    },
    SupervisorError { message: String },
}

impl SessionEvent {
    /// One-line human readable form.
    pub fn describe(&self) -> String {
        match self {
            Self::Started { pid, mode } => format!("Stream started (pid {pid}, {mode})"),
            Self::Respawned {
                attempt,
                retry_limit,
                pid,
                exit_code,
            } => format!(
                "Transcoder exited ({}), restarted as pid {pid} (attempt {attempt}/{retry_limit})",
                exit_code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
            ),
            Self::Completed { attempts } => {
                format!("Stream finished after {attempts} attempt(s)")
            }
            Self::RetriesExhausted { attempts } => {
                format!("Stream failed {attempts} times in a row and was abandoned")
            }
            Self::Stopped { pid } => format!("Stream stopped (pid {pid})"),
            Self::ScheduledStopFired {
                job,
                stopped_pid: Some(pid),
            } => format!("Scheduled stop {job} stopped pid {pid}"),
            Self::ScheduledStopFired {
                job,
                stopped_pid: None,
            } => format!("Scheduled stop {job} fired, stream was not running"),
            Self::SupervisorError { message } => format!("Supervisor error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_value(SessionEvent::Started {
            pid: 7,
            mode: PipelineMode::PassThrough,
        })
        .unwrap();
        assert_eq!(json["type"], "started");
        assert_eq!(json["mode"], "pass_through");
        assert_eq!(json["pid"], 7);
    }

    #[test]
    fn test_describe() {
        let event = SessionEvent::ScheduledStopFired {
            job: "scheduled-stop-x".to_string(),
            stopped_pid: None,
        };
        assert_eq!(
            event.describe(),
            "Scheduled stop scheduled-stop-x fired, stream was not running"
        );
    }
}
