use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Recurrence presets. Times are local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Top of every hour.
    Hourly,
    /// 02:00 every day.
    Daily,
    /// Sunday 03:00.
    Weekly,
    /// The 1st at 04:00.
    Monthly,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Hourly => "hourly",
            Schedule::Daily => "daily",
            Schedule::Weekly => "weekly",
            Schedule::Monthly => "monthly",
        }
    }
}

pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Job {
    name: String,
    schedule: Schedule,
    handler: JobHandler,
    next_run: NaiveDateTime,
    running: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub next_run: NaiveDateTime,
    pub running: bool,
}

/// Named recurring jobs. A background scan fires due jobs every 30 seconds;
/// `run_now` runs one synchronously. A job never runs concurrently with
/// itself, and a panicking handler is contained and reported as an error.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    pub fn register<F>(&self, id: &str, name: &str, schedule: Schedule, handler: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let next_run = next_run_after(Local::now().naive_local(), schedule);
        self.jobs.lock().expect("job table lock").insert(
            id.to_string(),
            Job {
                name: name.to_string(),
                schedule,
                handler: Arc::new(handler),
                next_run,
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::debug!(job = id, schedule = schedule.as_str(), %next_run, "job registered");
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().expect("job table lock");
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                name: job.name.clone(),
                schedule: job.schedule,
                next_run: job.next_run,
                running: job.running.load(Ordering::SeqCst),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Runs a job to completion. A second caller while the job is running
    /// gets `JobRunning`. The next scheduled run is recomputed from the
    /// finish time.
    pub async fn run_now(&self, id: &str) -> Result<()> {
        let (handler, running, schedule) = {
            let jobs = self.jobs.lock().expect("job table lock");
            let job = jobs
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
            (job.handler.clone(), job.running.clone(), job.schedule)
        };

        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::JobRunning { id: id.to_string() });
        }

        // The spawned task contains handler panics; join errors surface
        // them instead of unwinding into the scheduler.
        let outcome = tokio::spawn((handler)()).await;
        running.store(false, Ordering::SeqCst);

        {
            let mut jobs = self.jobs.lock().expect("job table lock");
            if let Some(job) = jobs.get_mut(id) {
                job.next_run = next_run_after(Local::now().naive_local(), schedule);
            }
        }

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::internal(format!("job {id}: {e}"))),
            Err(join) if join.is_panic() => Err(Error::internal(format!("job {id} panicked"))),
            Err(join) => Err(Error::internal(format!("job {id}: {join}"))),
        }
    }

    /// Scan loop; fires due jobs until cancelled.
    pub async fn run(self: Arc<Scheduler>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
            }
            let now = Local::now().naive_local();
            let due: Vec<String> = {
                let jobs = self.jobs.lock().expect("job table lock");
                jobs.iter()
                    .filter(|(_, job)| job.next_run <= now && !job.running.load(Ordering::SeqCst))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in due {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    match scheduler.run_now(&id).await {
                        Ok(()) => tracing::info!(job = id, "job completed"),
                        Err(Error::JobRunning { .. }) => {}
                        Err(e) => tracing::warn!(job = id, error = %e, "job failed"),
                    }
                });
            }
        }
    }
}

/// Deterministic next fire time strictly after `now`.
pub fn next_run_after(now: NaiveDateTime, schedule: Schedule) -> NaiveDateTime {
    match schedule {
        Schedule::Hourly => {
            let this_hour = now
                .date()
                .and_hms_opt(now.hour(), 0, 0)
                .expect("valid hour");
            this_hour + chrono::Duration::hours(1)
        }
        Schedule::Daily => {
            let today = now.date().and_hms_opt(2, 0, 0).expect("valid time");
            if today > now {
                today
            } else {
                today + chrono::Duration::days(1)
            }
        }
        Schedule::Weekly => {
            let days_ahead = i64::from(7 - now.weekday().num_days_from_sunday()) % 7;
            let candidate = (now.date() + chrono::Duration::days(days_ahead))
                .and_hms_opt(3, 0, 0)
                .expect("valid time");
            if candidate > now {
                candidate
            } else {
                candidate + chrono::Duration::days(7)
            }
        }
        Schedule::Monthly => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .expect("valid date")
                .and_hms_opt(4, 0, 0)
                .expect("valid time");
            if first > now {
                first
            } else {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .expect("valid date")
                    .and_hms_opt(4, 0, 0)
                    .expect("valid time")
            }
        }
    }
}
