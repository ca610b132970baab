//! Transcoder process supervision.
//!
//! One run = one accepted `start`. A run spawns the transcoder, records its
//! pid in the lock file and waits on it from a dedicated task, respawning on
//! failure until `retry_limit` attempts have been made.
//!
//! Attempt lifecycle: `Spawning -> Running -> Completed | Failed | Cancelled`.
//! `Failed` loops back to `Spawning` while attempts remain.

pub mod lock;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use process_utils::{TerminateOutcome, is_process_alive, terminate_process, tokio_command};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use lock::{LockFile, LockGuard, ProcessLock};

use crate::config::AppConfig;
use crate::events::SessionEvent;
use crate::utils::fs;
use crate::{Error, Result};

/// Supervisor settings, lifted out of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ffmpeg_path: String,
    pub lock_file: PathBuf,
    pub transcoder_log: PathBuf,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Total attempts per run, including the first.
    pub retry_limit: u32,
    pub stop_grace: Duration,
    pub timezone: Tz,
}

impl SupervisorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            lock_file: config.lock_file.clone(),
            transcoder_log: config.transcoder_log.clone(),
            working_dir: config.working_dir.clone(),
            retry_limit: config.retry_limit.max(1),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            timezone: config.tz(),
        }
    }
}

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The transcoder exited with status 0.
    Completed { attempts: u32 },
    /// The run was cancelled by `stop`.
    Cancelled { attempts: u32 },
}

/// Follows the current attempt of a run.
#[derive(Debug, Clone)]
pub struct RunMonitor {
    current: watch::Receiver<u32>,
}

impl RunMonitor {
    /// Pid of the latest attempt. May name an exited process between two
    /// attempts.
    pub fn pid(&self) -> u32 {
        *self.current.borrow()
    }

    /// Whether the wait/retry loop is still going.
    pub fn is_active(&self) -> bool {
        self.current.has_changed().is_ok()
    }

    /// Wait for the wait/retry loop to end.
    pub async fn ended(&mut self) {
        while self.current.changed().await.is_ok() {}
    }
}

/// Handle to a supervised run.
#[derive(Debug)]
pub struct RunHandle {
    pid: u32,
    cancel: CancellationToken,
    monitor: RunMonitor,
    task: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// Pid of the first attempt.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn monitor(&self) -> RunMonitor {
        self.monitor.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop respawning. Does not signal anything by itself beyond the
    /// current child.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Format the line written to the transcoder log before each attempt.
pub fn session_delimiter(now: DateTime<Tz>, attempt: u32, retry_limit: u32) -> String {
    let stamp = now.format("%Y-%m-%d %H:%M:%S %Z");
    if attempt <= 1 {
        format!("\n--- Stream session started ({stamp}) ---\n")
    } else {
        format!("\n--- Stream session restarted, attempt {attempt}/{retry_limit} ({stamp}) ---\n")
    }
}

/// Spawns, tracks and stops the transcoder.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: Arc<SupervisorConfig>,
    lock: LockFile,
    /// The run started by this process, if any.
    active: Arc<Mutex<Option<RunMonitor>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        let lock = LockFile::new(config.lock_file.clone());
        Self {
            config: Arc::new(config),
            lock,
            active: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Latest attempt pid of the run this process is supervising.
    pub fn active_pid(&self) -> Option<u32> {
        self.active
            .lock()
            .as_ref()
            .filter(|monitor| monitor.is_active())
            .map(RunMonitor::pid)
    }

    /// Pid of the live transcoder, if any.
    ///
    /// A lock naming a dead process, or holding garbage, is deleted.
    pub fn is_running(&self) -> Option<u32> {
        match self.lock.try_guard() {
            Some(_guard) => self.live_pid(true),
            // A start is in progress elsewhere; report without healing.
            None => self.live_pid(false),
        }
    }

    /// Liveness check. `heal` requires the caller to hold the lock guard.
    fn live_pid(&self, heal: bool) -> Option<u32> {
        match self.lock.read() {
            Ok(None) => None,
            Ok(Some(lock)) => {
                if is_process_alive(lock.pid) {
                    return Some(lock.pid);
                }
                if heal {
                    warn!(pid = lock.pid, "Process lock names a dead process, removing it");
                    if let Err(e) = self.lock.clear_if(lock.pid) {
                        warn!(error = %e, "Failed to remove stale process lock");
                    }
                }
                None
            }
            Err(err @ Error::LockCorrupt { .. }) => {
                if heal {
                    warn!(error = %err, "Removing corrupt process lock");
                    if let Err(e) = self.lock.clear() {
                        warn!(error = %e, "Failed to remove corrupt process lock");
                    }
                }
                None
            }
            Err(e) => {
                error!(error = %e, "Could not read process lock, assuming not running");
                None
            }
        }
    }

    /// Start a run with the given transcoder arguments.
    ///
    /// Fails with [`Error::AlreadyRunning`] when a live transcoder holds the
    /// lock. On success the first attempt is running and its pid is on disk.
    pub async fn start(&self, args: Vec<String>) -> Result<RunHandle> {
        let guard = self.lock.acquire_guard().await?;

        // A run of ours between two attempts leaves a dead pid on disk.
        if let Some(pid) = self.active_pid() {
            return Err(Error::AlreadyRunning { pid });
        }
        if let Some(pid) = self.live_pid(true) {
            return Err(Error::AlreadyRunning { pid });
        }

        let child = self.spawn_attempt(&args, 1).await?;
        let pid = child.id().unwrap_or_default();
        let (current, receiver) = watch::channel(pid);
        let monitor = RunMonitor { current: receiver };
        *self.active.lock() = Some(monitor.clone());
        drop(guard);

        info!(
            pid,
            retry_limit = self.config.retry_limit,
            "Transcoder started"
        );

        let cancel = CancellationToken::new();
        let supervisor = self.clone();
        let token = cancel.clone();
        let task =
            tokio::spawn(async move { supervisor.supervise(child, args, token, current).await });

        Ok(RunHandle {
            pid,
            cancel,
            monitor,
            task,
        })
    }

    /// Wait for a cancelled run of ours to reap its child, then drop the
    /// lock it held. Returns the pid of its last attempt.
    ///
    /// The loop signals its own child on cancellation, so nothing here
    /// signals a pid that may already have been reaped.
    pub async fn wind_down(&self, mut monitor: RunMonitor) -> Result<u32> {
        let limit = self.config.stop_grace * 2 + Duration::from_secs(1);
        if tokio::time::timeout(limit, monitor.ended()).await.is_err() {
            warn!(pid = monitor.pid(), "Cancelled run did not wind down in time");
        }

        let pid = monitor.pid();
        self.lock.clear_if(pid)?;
        Ok(pid)
    }

    /// Ask the transcoder `pid` to exit and drop the lock.
    ///
    /// Waits the grace period after signalling, then removes the lock
    /// whether or not the process is gone.
    pub async fn stop(&self, pid: u32) -> Result<TerminateOutcome> {
        let outcome = terminate_process(pid);
        match outcome {
            TerminateOutcome::Signalled => info!(pid, "Sent termination signal to transcoder"),
            TerminateOutcome::NotFound => debug!(pid, "Transcoder already gone"),
            TerminateOutcome::Failed => warn!(pid, "Could not signal transcoder"),
        }

        tokio::time::sleep(self.config.stop_grace).await;

        if is_process_alive(pid) {
            warn!(pid, "Transcoder still alive after the grace period, releasing lock anyway");
        }
        self.lock.clear()?;
        Ok(outcome)
    }

    /// Spawn one attempt and record its pid.
    async fn spawn_attempt(&self, args: &[String], attempt: u32) -> Result<Child> {
        let log = self.open_log(attempt).await?;
        let log_err = log
            .try_clone()
            .map_err(|e| fs::io_error("duplicating", &self.config.transcoder_log, e))?;

        fs::ensure_dir_all(&self.config.working_dir).await?;

        let mut child = tokio_command(&self.config.ffmpeg_path)
            .args(args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| Error::SpawnFailed {
                program: self.config.ffmpeg_path.clone(),
                source,
            })?;

        let Some(pid) = child.id() else {
            return Err(Error::SpawnFailed {
                program: self.config.ffmpeg_path.clone(),
                source: std::io::Error::other("child exited before its pid could be read"),
            });
        };

        if let Err(e) = self.lock.write(pid).await {
            error!(pid, error = %e, "Failed to record transcoder pid, killing it");
            let _ = child.start_kill();
            return Err(e);
        }

        debug!(pid, attempt, "Spawned transcoder");
        Ok(child)
    }

    async fn open_log(&self, attempt: u32) -> Result<std::fs::File> {
        let path = &self.config.transcoder_log;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::ensure_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| fs::io_error("opening", path, e))?;

        let now = Utc::now().with_timezone(&self.config.timezone);
        let line = session_delimiter(now, attempt, self.config.retry_limit);
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| fs::io_error("writing", path, e))?;
        file.flush()
            .await
            .map_err(|e| fs::io_error("writing", path, e))?;

        Ok(file.into_std().await)
    }

    /// Wait/retry loop of one run.
    async fn supervise(
        self,
        mut child: Child,
        args: Vec<String>,
        cancel: CancellationToken,
        current: watch::Sender<u32>,
    ) -> Result<RunOutcome> {
        let retry_limit = self.config.retry_limit;
        let mut attempts = 1u32;

        loop {
            let pid = child.id().unwrap_or_default();

            let status = tokio::select! {
                _ = cancel.cancelled() => {
                    self.reap_cancelled(child, pid).await;
                    return Ok(RunOutcome::Cancelled { attempts });
                }
                status = child.wait() => status,
            };

            let exit_code = match status {
                Ok(status) if status.success() => {
                    info!(pid, attempts, "Transcoder exited cleanly");
                    self.release(pid);
                    return Ok(RunOutcome::Completed { attempts });
                }
                Ok(status) => status.code(),
                Err(e) => {
                    error!(pid, error = %e, "Error waiting for transcoder");
                    None
                }
            };

            if cancel.is_cancelled() {
                debug!(pid, "Transcoder exited after cancellation");
                return Ok(RunOutcome::Cancelled { attempts });
            }

            // Held until the next attempt's pid is on disk, so no start in
            // another process acts on the dead pid in between.
            let _guard = match self.lock.acquire_guard().await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!(pid, error = %e, "Could not take the lock guard for respawn");
                    None
                }
            };
            if cancel.is_cancelled() {
                debug!(pid, "Run cancelled before respawn");
                return Ok(RunOutcome::Cancelled { attempts });
            }

            let failure = Error::ProcessExitNonZero { code: exit_code };
            if attempts >= retry_limit {
                error!(pid, attempts, error = %failure, "Transcoder retry limit reached");
                self.release(pid);
                return Err(Error::RetriesExhausted { attempts });
            }

            warn!(pid, attempt = attempts, retry_limit, error = %failure, "Transcoder failed, restarting");
            attempts += 1;
            child = match self.spawn_attempt(&args, attempts).await {
                Ok(child) => child,
                Err(e) => {
                    error!(attempt = attempts, error = %e, "Failed to respawn transcoder");
                    self.release(pid);
                    return Err(e);
                }
            };
            let new_pid = child.id().unwrap_or_default();
            current.send_replace(new_pid);

            let _ = self.events.send(SessionEvent::Respawned {
                attempt: attempts,
                retry_limit,
                pid: new_pid,
                exit_code,
            });
        }
    }

    /// Drop the lock at the end of a run, unless a newer run owns it.
    fn release(&self, pid: u32) {
        match self.lock.clear_if(pid) {
            Ok(true) => debug!(pid, "Released process lock"),
            Ok(false) => debug!(pid, "Process lock already released or taken over"),
            Err(e) => warn!(pid, error = %e, "Failed to release process lock"),
        }
    }

    /// Reap the current child after cancellation. The lock is left to `stop`.
    async fn reap_cancelled(&self, mut child: Child, pid: u32) {
        terminate_process(pid);
        match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "Cancelled transcoder exited"),
            Ok(Err(e)) => warn!(pid, error = %e, "Error reaping cancelled transcoder"),
            Err(_) => {
                warn!(pid, "Cancelled transcoder did not exit within the grace period");
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_delimiter() {
        let tz: Tz = "Asia/Makassar".parse().unwrap();
        let now = tz.with_ymd_and_hms(2024, 5, 1, 20, 15, 0).unwrap();

        assert_eq!(
            session_delimiter(now, 1, 5),
            "\n--- Stream session started (2024-05-01 20:15:00 WITA) ---\n"
        );
        assert!(session_delimiter(now, 3, 5).contains("attempt 3/5"));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        struct Fixture {
            dir: tempfile::TempDir,
            supervisor: ProcessSupervisor,
            events: broadcast::Receiver<SessionEvent>,
        }

        /// Supervisor whose "ffmpeg" is a shell script with the given body.
        fn fixture(body: &str, retry_limit: u32) -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("fake-ffmpeg");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            let config = SupervisorConfig {
                ffmpeg_path: script.to_string_lossy().to_string(),
                lock_file: dir.path().join("stream_process.pid"),
                transcoder_log: dir.path().join("ffmpeg_log.txt"),
                working_dir: dir.path().join("stream"),
                retry_limit,
                stop_grace: Duration::from_millis(200),
                timezone: Tz::UTC,
            };
            let (tx, events) = broadcast::channel(16);
            Fixture {
                supervisor: ProcessSupervisor::new(config, tx),
                dir,
                events,
            }
        }

        fn counter(dir: &Path) -> String {
            dir.join("spawns").to_string_lossy().to_string()
        }

        fn spawn_count(dir: &Path) -> usize {
            std::fs::read_to_string(dir.join("spawns"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        #[tokio::test]
        async fn test_retries_exhausted_after_limit() {
            let tmp = tempfile::tempdir().unwrap();
            let body = format!("echo run >> {}\necho 'boom' >&2\nexit 1", counter(tmp.path()));
            let fx = fixture(&body, 5);

            let handle = fx.supervisor.start(vec!["-i".into(), "x".into()]).await.unwrap();
            let err = handle.join().await.unwrap_err();

            assert!(matches!(err, Error::RetriesExhausted { attempts: 5 }));
            assert_eq!(spawn_count(tmp.path()), 5);
            assert!(!fx.supervisor.lock().path().exists());

            let log = std::fs::read_to_string(fx.dir.path().join("ffmpeg_log.txt")).unwrap();
            assert_eq!(log.matches("--- Stream session").count(), 5);
            assert_eq!(log.matches("boom").count(), 5);
        }

        #[tokio::test]
        async fn test_respawn_then_complete() {
            let tmp = tempfile::tempdir().unwrap();
            let spawns = counter(tmp.path());
            let body = format!("echo run >> {spawns}\n[ $(wc -l < {spawns}) -ge 3 ]");
            let mut fx = fixture(&body, 5);

            let handle = fx.supervisor.start(Vec::new()).await.unwrap();
            let monitor = handle.monitor();
            let outcome = handle.join().await.unwrap();

            assert_eq!(outcome, RunOutcome::Completed { attempts: 3 });
            assert!(!fx.supervisor.lock().path().exists());

            let mut respawns = Vec::new();
            let mut last_pid = None;
            while let Ok(event) = fx.events.try_recv() {
                if let SessionEvent::Respawned {
                    attempt,
                    exit_code,
                    pid,
                    ..
                } = event
                {
                    respawns.push((attempt, exit_code));
                    last_pid = Some(pid);
                }
            }
            assert_eq!(respawns, vec![(2, Some(1)), (3, Some(1))]);

            // The monitor follows respawns and sees the loop end.
            assert_eq!(Some(monitor.pid()), last_pid);
            assert!(!monitor.is_active());
            assert_eq!(fx.supervisor.active_pid(), None);
        }

        #[tokio::test]
        async fn test_start_rejected_while_run_is_retrying() {
            let fx = fixture("exit 1", 100_000);

            let handle = fx.supervisor.start(Vec::new()).await.unwrap();
            for _ in 0..200 {
                match fx.supervisor.start(Vec::new()).await {
                    Err(Error::AlreadyRunning { .. }) => {}
                    other => panic!("second run accepted during retries: {other:?}"),
                }
                tokio::task::yield_now().await;
            }

            let monitor = handle.monitor();
            handle.cancel();
            let last_pid = fx.supervisor.wind_down(monitor).await.unwrap();
            assert!(!is_process_alive(last_pid));
            assert!(!fx.supervisor.lock().path().exists());
            assert!(matches!(
                handle.join().await.unwrap(),
                RunOutcome::Cancelled { .. }
            ));
        }

        #[tokio::test]
        async fn test_wind_down_reaps_cancelled_child() {
            let fx = fixture("exec sleep 30", 5);

            let handle = fx.supervisor.start(Vec::new()).await.unwrap();
            let pid = handle.pid();
            handle.cancel();

            assert_eq!(fx.supervisor.wind_down(handle.monitor()).await.unwrap(), pid);
            assert!(!is_process_alive(pid));
            assert!(!fx.supervisor.lock().path().exists());
            assert_eq!(fx.supervisor.active_pid(), None);
        }

        #[tokio::test]
        async fn test_start_rejected_when_lock_is_live() {
            let tmp = tempfile::tempdir().unwrap();
            let fx = fixture(&format!("echo run >> {}", counter(tmp.path())), 5);

            // Our own pid is certainly alive.
            let own_pid = std::process::id();
            fx.supervisor.lock().write(own_pid).await.unwrap();

            let err = fx.supervisor.start(Vec::new()).await.unwrap_err();
            assert!(matches!(err, Error::AlreadyRunning { pid } if pid == own_pid));
            assert_eq!(spawn_count(tmp.path()), 0);
            assert_eq!(fx.supervisor.is_running(), Some(own_pid));
        }

        #[tokio::test]
        async fn test_is_running_heals_dead_lock() {
            let fx = fixture("exit 0", 1);

            fx.supervisor.lock().write(0x3FFF_FFF0).await.unwrap();
            assert_eq!(fx.supervisor.is_running(), None);
            assert!(!fx.supervisor.lock().path().exists());

            std::fs::write(fx.supervisor.lock().path(), "not a pid").unwrap();
            assert_eq!(fx.supervisor.is_running(), None);
            assert!(!fx.supervisor.lock().path().exists());
        }

        #[tokio::test]
        async fn test_stale_lock_does_not_block_start() {
            let fx = fixture("exit 0", 1);
            fx.supervisor.lock().write(0x3FFF_FFF0).await.unwrap();

            let handle = fx.supervisor.start(Vec::new()).await.unwrap();
            assert_eq!(
                handle.join().await.unwrap(),
                RunOutcome::Completed { attempts: 1 }
            );
        }

        #[tokio::test]
        async fn test_stop_cancels_run_and_clears_lock() {
            let fx = fixture("exec sleep 30", 5);

            let handle = fx.supervisor.start(Vec::new()).await.unwrap();
            let pid = handle.pid();
            assert_eq!(fx.supervisor.is_running(), Some(pid));

            handle.cancel();
            let outcome = fx.supervisor.stop(pid).await.unwrap();

            assert_eq!(outcome, TerminateOutcome::Signalled);
            assert!(!fx.supervisor.lock().path().exists());
            assert_eq!(
                handle.join().await.unwrap(),
                RunOutcome::Cancelled { attempts: 1 }
            );
            assert!(!is_process_alive(pid));
        }

        #[tokio::test]
        async fn test_spawn_failure_leaves_lock_untouched() {
            let mut fx = fixture("exit 0", 1);
            fx.supervisor = ProcessSupervisor::new(
                SupervisorConfig {
                    ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
                    ..fx.supervisor.config().clone()
                },
                broadcast::channel(1).0,
            );

            let err = fx.supervisor.start(Vec::new()).await.unwrap_err();
            assert!(matches!(err, Error::SpawnFailed { .. }));
            assert!(!fx.supervisor.lock().path().exists());
        }
    }
}
