//! The live-session controller.
//!
//! Entry point for whatever front end drives the stream. Every operation
//! checks its preconditions, delegates to the handoff/planner/supervisor/
//! scheduler components, and persists session changes before returning.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::events::{EVENT_CHANNEL_CAPACITY, SessionEvent};
use crate::handoff::{self, has_allowed_extension};
use crate::media::{EncodingPlan, FfprobeProber, MediaProber, PipelineMode};
use crate::scheduler::{Scheduler, parse_stop_expression};
use crate::store::{Session, SessionStore};
use crate::supervisor::{ProcessSupervisor, RunHandle, RunMonitor, RunOutcome, SupervisorConfig};
use crate::utils::fs;
use crate::{Error, Result};

/// Result of an accepted `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub pid: u32,
    pub mode: PipelineMode,
    pub media: PathBuf,
    /// Path handed to the transcoder.
    pub input: PathBuf,
}

/// Result of an accepted `schedule_stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub job: String,
    pub fire_at: DateTime<Tz>,
    pub delay: Duration,
    /// Job that was replaced by this one.
    pub replaced: Option<String>,
}

/// Auto-stop state as seen by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScheduleState {
    None,
    Active {
        job: String,
        fire_at: DateTime<Tz>,
        #[serde(with = "duration_secs")]
        remaining: Duration,
    },
    /// The session named a job this process does not know, typically after
    /// a restart. The association has been cleared.
    Lost { job: String },
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub selected_media: Option<PathBuf>,
    /// Whether the selected file still exists.
    pub media_present: bool,
    pub credential_present: bool,
    /// Last characters of the stream key, e.g. `...a1b2`.
    pub credential_hint: Option<String>,
    pub schedule: ScheduleState,
}

/// A file in the media library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub selected: bool,
}

/// Mask a stream key for display.
pub fn mask_credential(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        return "...".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("...{tail}")
}

#[derive(Debug)]
struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    monitor: RunMonitor,
}

/// Composes the session components behind the collaborator API.
pub struct SessionController {
    config: Arc<AppConfig>,
    store: Mutex<SessionStore>,
    prober: Arc<dyn MediaProber>,
    supervisor: ProcessSupervisor,
    scheduler: Scheduler,
    /// Serialises start/stop within this process; the lock file guard
    /// covers other processes.
    exclusive: tokio::sync::Mutex<()>,
    active_run: Mutex<Option<ActiveRun>>,
    next_run_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Build a controller probing media with ffprobe.
    pub fn new(config: Arc<AppConfig>) -> Result<Arc<Self>> {
        let prober = Arc::new(FfprobeProber::new(config.ffprobe_path.clone()));
        Self::with_prober(config, prober)
    }

    /// Build a controller with a custom media prober.
    pub fn with_prober(config: Arc<AppConfig>, prober: Arc<dyn MediaProber>) -> Result<Arc<Self>> {
        let store = SessionStore::load(config.state_file.clone())?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_app(&config), events.clone());

        if let Some(job) = &store.session().active_schedule {
            warn!(job = %job, "Scheduled stop from a previous run was lost");
        }

        Ok(Arc::new(Self {
            config,
            store: Mutex::new(store),
            prober,
            supervisor,
            scheduler: Scheduler::new(),
            exclusive: tokio::sync::Mutex::new(()),
            active_run: Mutex::new(None),
            next_run_id: AtomicU64::new(1),
            events,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> Session {
        self.store.lock().session().clone()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Resolve a user-supplied media reference: a bare name is looked up in
    /// the library first.
    fn resolve_media_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            let in_library = self.config.media_dir.join(path);
            if in_library.exists() {
                return in_library;
            }
        }
        path.to_path_buf()
    }

    /// Choose the media file for the next start.
    pub async fn select_media(&self, path: &Path) -> Result<PathBuf> {
        let path = self.resolve_media_path(path);
        let rejected = |reason: &str| Error::MediaRejected {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(rejected("file does not exist")),
            Err(e) => return Err(fs::io_error("inspecting", &path, e)),
        };
        if !meta.is_file() {
            return Err(rejected("not a regular file"));
        }
        if !has_allowed_extension(&path, &self.config.extensions()) {
            return Err(rejected("extension is not an allowed media type"));
        }

        let canonical = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| fs::io_error("resolving", &path, e))?;

        self.store
            .lock()
            .update(|s| s.selected_media = Some(canonical.clone()))?;
        info!(media = %canonical.display(), "Selected media");
        Ok(canonical)
    }

    /// Store the stream key.
    pub async fn set_credential(&self, value: &str) -> Result<()> {
        let key = value.trim();
        if key.is_empty() {
            return Err(Error::CredentialMissing);
        }

        fs::write_atomic(&self.config.credential_path(), key.as_bytes()).await?;
        self.store.lock().update(|s| s.credential_present = true)?;
        info!(hint = %mask_credential(key), "Stream key updated");
        Ok(())
    }

    async fn read_credential(&self) -> Result<Option<String>> {
        let path = self.config.credential_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let key = raw.trim();
                Ok((!key.is_empty()).then(|| key.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(fs::io_error("reading", &path, e)),
        }
    }

    /// Start streaming the selected media.
    pub async fn start(self: &Arc<Self>) -> Result<StartReport> {
        let _exclusive = self.exclusive.lock().await;

        // Covers the gap between two attempts, when the lock names no live pid.
        let retrying = self
            .active_run
            .lock()
            .as_ref()
            .filter(|run| run.monitor.is_active())
            .map(|run| run.monitor.pid());
        if let Some(pid) = retrying.or_else(|| self.supervisor.is_running()) {
            return Err(Error::AlreadyRunning { pid });
        }

        let session = self.session();
        let media = session.selected_media.ok_or(Error::MediaNotSelected)?;
        if !session.credential_present {
            return Err(Error::CredentialMissing);
        }

        if !tokio::fs::metadata(&media).await.is_ok_and(|m| m.is_file()) {
            warn!(media = %media.display(), "Selected media disappeared, clearing selection");
            self.store.lock().update(|s| s.selected_media = None)?;
            return Err(Error::MediaFileAbsent { path: media });
        }

        let Some(key) = self.read_credential().await? else {
            warn!("Stream key file is missing or empty");
            self.store.lock().update(|s| s.credential_present = false)?;
            return Err(Error::CredentialMissing);
        };

        let input =
            handoff::ensure_linked(&media, &self.config.working_dir, &self.config.extensions())
                .await?;

        let codecs = self.prober.probe(&media).await;
        let plan = EncodingPlan::plan(&codecs, &self.config.encoding);
        info!(
            mode = %plan.mode,
            video = ?plan.video_codec,
            audio = ?plan.audio_codec,
            "Planned transcoder pipeline"
        );

        let destination = self.config.destination_url(&key);
        let args = plan.build_args(&input, &destination);
        let handle = self.supervisor.start(args).await?;
        let pid = handle.pid();

        self.track_run(handle);
        self.emit(SessionEvent::Started {
            pid,
            mode: plan.mode,
        });
        info!(
            pid,
            media = %media.display(),
            destination = %self.config.destination_url(&mask_credential(&key)),
            "Stream started"
        );

        Ok(StartReport {
            pid,
            mode: plan.mode,
            media,
            input,
        })
    }

    /// Remember the run and report its end.
    fn track_run(self: &Arc<Self>, handle: RunHandle) {
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        *self.active_run.lock() = Some(ActiveRun {
            id,
            cancel: handle.cancellation_token(),
            monitor: handle.monitor(),
        });

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let event = match handle.join().await {
                Ok(RunOutcome::Completed { attempts }) => Some(SessionEvent::Completed { attempts }),
                Ok(RunOutcome::Cancelled { attempts }) => {
                    debug!(attempts, "Run cancelled");
                    None
                }
                Err(Error::RetriesExhausted { attempts }) => {
                    Some(SessionEvent::RetriesExhausted { attempts })
                }
                Err(e) => {
                    error!(error = %e, "Supervisor stopped with an error");
                    Some(SessionEvent::SupervisorError {
                        message: e.to_string(),
                    })
                }
            };

            {
                let mut active = controller.active_run.lock();
                if active.as_ref().is_some_and(|run| run.id == id) {
                    *active = None;
                }
            }

            if let Some(event) = event {
                controller.emit(event);
            }
        });
    }

    /// Pid to stop, plus the in-process run if there is one.
    fn take_running(&self) -> Result<(u32, Option<ActiveRun>)> {
        let pid = self.supervisor.is_running();
        let run = self
            .active_run
            .lock()
            .take()
            .filter(|run| run.monitor.is_active());
        match (pid, run) {
            (_, Some(run)) => Ok((run.monitor.pid(), Some(run))),
            (Some(pid), None) => Ok((pid, None)),
            (None, None) => Err(Error::NotRunning),
        }
    }

    async fn terminate(&self, pid: u32, run: Option<ActiveRun>) -> Result<u32> {
        let pid = match run {
            // Our own loop signals and reaps its current child.
            Some(run) => {
                run.cancel.cancel();
                self.supervisor.wind_down(run.monitor).await?
            }
            None => {
                self.supervisor.stop(pid).await?;
                pid
            }
        };
        self.emit(SessionEvent::Stopped { pid });
        info!(pid, "Stream stopped");
        Ok(pid)
    }

    /// Stop the running stream. Returns the stopped pid.
    pub async fn stop(&self) -> Result<u32> {
        let _exclusive = self.exclusive.lock().await;
        let (pid, run) = self.take_running()?;
        if let Err(e) = self.clear_schedule() {
            warn!(error = %e, "Failed to clear scheduled stop");
        }
        self.terminate(pid, run).await
    }

    /// Cancel the pending scheduled stop, if any.
    fn clear_schedule(&self) -> Result<Option<String>> {
        let mut store = self.store.lock();
        let Some(job) = store.session().active_schedule.clone() else {
            return Ok(None);
        };
        self.scheduler.cancel(&job);
        store.update(|s| s.active_schedule = None)?;
        info!(job = %job, "Cleared scheduled stop");
        Ok(Some(job))
    }

    /// Arrange for the stream to stop automatically.
    pub fn schedule_stop(self: &Arc<Self>, expression: &str) -> Result<ScheduleReport> {
        let now = Utc::now().with_timezone(&self.config.tz());
        let target = parse_stop_expression(expression, now)?;

        let minimum = Duration::from_secs(self.config.min_schedule_delay_secs);
        if target.delay < minimum {
            return Err(Error::ScheduleTooSoon {
                requested_secs: target.delay.as_secs(),
                minimum_secs: minimum.as_secs(),
            });
        }

        let replaced = self.clear_schedule()?;

        let weak = Arc::downgrade(self);
        let job = self
            .scheduler
            .schedule(target.delay, target.fire_at, move |job| async move {
                if let Some(controller) = weak.upgrade() {
                    controller.fire_scheduled_stop(job).await;
                }
            });

        if let Err(e) = self
            .store
            .lock()
            .update(|s| s.active_schedule = Some(job.clone()))
        {
            self.scheduler.cancel(&job);
            return Err(e);
        }

        info!(job = %job, fire_at = %target.fire_at, delay_secs = target.delay.as_secs(), "Scheduled stop");
        Ok(ScheduleReport {
            job,
            fire_at: target.fire_at,
            delay: target.delay,
            replaced,
        })
    }

    async fn fire_scheduled_stop(&self, job: String) {
        let stopped_pid = {
            let _exclusive = self.exclusive.lock().await;
            match self.take_running() {
                Ok((pid, run)) => match self.terminate(pid, run).await {
                    Ok(pid) => Some(pid),
                    Err(e) => {
                        error!(job = %job, error = %e, "Scheduled stop failed");
                        None
                    }
                },
                Err(_) => {
                    info!(job = %job, "Scheduled stop fired but the stream was not running");
                    None
                }
            }
        };

        let cleared = self.store.lock().update(|s| {
            if s.active_schedule.as_deref() == Some(job.as_str()) {
                s.active_schedule = None;
            }
        });
        if let Err(e) = cleared {
            warn!(job = %job, error = %e, "Failed to clear scheduled stop from session");
        }

        self.emit(SessionEvent::ScheduledStopFired { job, stopped_pid });
    }

    /// Snapshot of the live session.
    pub async fn status(&self) -> Result<SessionStatus> {
        let pid = self.supervisor.is_running();
        let session = self.session();

        let schedule = match session.active_schedule {
            None => ScheduleState::None,
            Some(job) => match self.scheduler.get(&job) {
                Some(info) => ScheduleState::Active {
                    job,
                    fire_at: info.fire_at,
                    remaining: info.remaining,
                },
                None => {
                    warn!(job = %job, "Scheduled stop is no longer active, clearing it");
                    self.store.lock().update(|s| {
                        if s.active_schedule.as_deref() == Some(job.as_str()) {
                            s.active_schedule = None;
                        }
                    })?;
                    ScheduleState::Lost { job }
                }
            },
        };

        let media_present = match &session.selected_media {
            Some(path) => tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()),
            None => false,
        };

        let credential_hint = if session.credential_present {
            self.read_credential().await?.map(|key| mask_credential(&key))
        } else {
            None
        };

        Ok(SessionStatus {
            running: pid.is_some(),
            pid,
            selected_media: session.selected_media,
            media_present,
            credential_present: session.credential_present,
            credential_hint,
            schedule,
        })
    }

    /// Media files in the library, sorted by name.
    pub async fn list_media(&self) -> Result<Vec<MediaEntry>> {
        let dir = &self.config.media_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(fs::io_error("listing", dir, e)),
        };

        let extensions = self.config.extensions();
        let selected = self.session().selected_media;
        let mut media = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs::io_error("listing", dir, e))?
        {
            let path = entry.path();
            if !has_allowed_extension(&path, &extensions) {
                continue;
            }
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let is_selected = match &selected {
                Some(selected) => tokio::fs::canonicalize(&path)
                    .await
                    .is_ok_and(|canonical| &canonical == selected),
                None => false,
            };
            media.push(MediaEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                size_bytes: meta.len(),
                selected: is_selected,
            });
        }

        media.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(media)
    }

    /// Delete a file from the library.
    ///
    /// Refused while the file is being streamed. Deleting the selected file
    /// clears the selection.
    pub async fn remove_media(&self, name: &str) -> Result<PathBuf> {
        let rejected = |path: PathBuf, reason: &str| Error::MediaRejected {
            path,
            reason: reason.to_string(),
        };

        let file_name = Path::new(name);
        if name.is_empty() || file_name.components().count() != 1 || file_name.file_name().is_none()
        {
            return Err(rejected(PathBuf::from(name), "not a plain file name"));
        }

        let path = self.config.media_dir.join(file_name);
        if !has_allowed_extension(&path, &self.config.extensions()) {
            return Err(rejected(path, "extension is not an allowed media type"));
        }
        let canonical = match tokio::fs::canonicalize(&path).await {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(rejected(path, "no such media file"));
            }
            Err(e) => return Err(fs::io_error("resolving", &path, e)),
        };

        let is_selected = self.session().selected_media.as_deref() == Some(canonical.as_path());
        if is_selected && let Some(pid) = self.supervisor.is_running() {
            return Err(Error::AlreadyRunning { pid });
        }

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| fs::io_error("removing", &path, e))?;
        if is_selected {
            self.store.lock().update(|s| s.selected_media = None)?;
        }
        info!(media = %path.display(), was_selected = is_selected, "Removed media");
        Ok(path)
    }

    /// Last `lines` lines of the transcoder log.
    pub async fn transcoder_log_tail(&self, lines: usize) -> Result<Vec<String>> {
        let path = &self.config.transcoder_log;
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(fs::io_error("reading", path, e)),
        };

        let text = String::from_utf8_lossy(&raw);
        let all: Vec<&str> = text.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].iter().map(|l| l.to_string()).collect())
    }
}
