//! In-memory registry of named one-shot timers.
//!
//! Each job is a tokio task sleeping until its deadline, paired with a
//! cancellation token. Jobs leave the registry once their action has run, or
//! when cancelled. Nothing here survives a restart.

pub mod expr;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use expr::{StopExpression, StopTarget, parse_stop_expression};

/// Prefix of every auto-stop job name.
pub const STOP_JOB_PREFIX: &str = "scheduled-stop-";

#[derive(Debug)]
struct ScheduledJob {
    fire_at: DateTime<Tz>,
    deadline: Instant,
    token: CancellationToken,
    firing: bool,
}

/// Snapshot of a pending job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub fire_at: DateTime<Tz>,
    pub remaining: Duration,
    /// The deadline passed and the action is running.
    pub firing: bool,
}

/// Named timer registry. Cheap to clone; clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`. Returns the job name.
    ///
    /// `fire_at` is the wall-clock time reported back through
    /// [`Scheduler::get`]; the timer itself runs on the monotonic clock.
    pub fn schedule<F, Fut>(&self, delay: Duration, fire_at: DateTime<Tz>, action: F) -> String
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = format!("{}{}", STOP_JOB_PREFIX, uuid::Uuid::new_v4());
        let deadline = Instant::now() + delay;
        let token = CancellationToken::new();

        self.jobs.lock().insert(
            name.clone(),
            ScheduledJob {
                fire_at,
                deadline,
                token: token.clone(),
                firing: false,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let job_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(job = %job_name, "Scheduled job cancelled");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    // A cancel racing with the deadline wins.
                    let proceed = {
                        let mut jobs = jobs.lock();
                        match jobs.get_mut(&job_name) {
                            Some(job) if !token.is_cancelled() => {
                                job.firing = true;
                                true
                            }
                            _ => false,
                        }
                    };
                    if proceed {
                        info!(job = %job_name, "Scheduled job firing");
                        action(job_name.clone()).await;
                        jobs.lock().remove(&job_name);
                    }
                }
            }
        });

        debug!(job = %name, delay_secs = delay.as_secs(), %fire_at, "Scheduled job");
        name
    }

    /// Cancel a job. Returns whether it existed.
    ///
    /// An action that already started is not interrupted.
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs.lock().remove(name) {
            Some(job) => {
                job.token.cancel();
                info!(job = %name, "Cancelled scheduled job");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<JobInfo> {
        let jobs = self.jobs.lock();
        jobs.get(name).map(|job| JobInfo {
            name: name.to_string(),
            fire_at: job.fire_at,
            remaining: job.deadline.saturating_duration_since(Instant::now()),
            firing: job.firing,
        })
    }

    /// Time left before `name` fires.
    pub fn remaining(&self, name: &str) -> Option<Duration> {
        self.get(name).map(|job| job.remaining)
    }

    pub fn fire_at(&self, name: &str) -> Option<DateTime<Tz>> {
        self.get(name).map(|job| job.fire_at)
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every pending job.
    pub fn cancel_all(&self) {
        for (_, job) in self.jobs.lock().drain() {
            job.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now() -> DateTime<Tz> {
        Utc::now().with_timezone(&Tz::UTC)
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_fires_once_and_leaves_registry() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        let name = scheduler.schedule(Duration::from_secs(30), now(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(name.starts_with(STOP_JOB_PREFIX));
        assert_eq!(scheduler.remaining(&name), Some(Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.remaining(&name), Some(Duration::from_secs(20)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.contains(&name));
        assert!(scheduler.remaining(&name).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        let name = scheduler.schedule(Duration::from_secs(5), now(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(&name));
        assert!(!scheduler.cancel(&name));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_receives_job_name() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let name = scheduler.schedule(Duration::from_secs(1), now(), move |job| async move {
            let _ = tx.send(job);
        });

        assert_eq!(rx.await.unwrap(), name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_stays_visible_while_firing() {
        let scheduler = Scheduler::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let name = scheduler.schedule(Duration::from_secs(1), now(), move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        });

        started_rx.await.unwrap();
        let info = scheduler.get(&name).unwrap();
        assert!(info.firing);
        assert_eq!(info.remaining, Duration::ZERO);

        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.contains(&name));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = Scheduler::new();
        let fire_at = now();
        for _ in 0..3 {
            scheduler.schedule(Duration::from_secs(5), fire_at, |_| async {});
        }
        assert_eq!(scheduler.len(), 3);

        scheduler.cancel_all();
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_fire_at_is_reported() {
        let scheduler = Scheduler::new();
        let fire_at = now();
        let name = scheduler.schedule(Duration::from_secs(3600), fire_at, |_| async {});

        assert_eq!(scheduler.fire_at(&name), Some(fire_at));
        assert!(scheduler.cancel(&name));
    }
}
