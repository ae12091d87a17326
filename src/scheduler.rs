use crate::config::Config;
use crate::errors::{EngineError, Result};
use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const AUTO_TRIGGER: &str = "auto-trigger";
pub const RETENTION_CLEANUP: &str = "retention-cleanup";

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Parse a cron expression, accepting the conventional five-field form by
/// pinning seconds to zero.
pub fn parse_cron(expr: &str) -> std::result::Result<Schedule, cron::error::Error> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {trimmed}"))
    } else {
        Schedule::from_str(trimmed)
    }
}

struct Job {
    name: String,
    running: AtomicBool,
    task: JobFn,
}

impl Job {
    /// Scheduled fires take this path: drop the fire if a run is already in
    /// flight, no queueing.
    async fn try_fire(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            eprintln!(
                "[brainsurgeon sched] {} already running, dropping fire",
                self.name
            );
            return false;
        }
        (self.task)().await;
        self.running.store(false, Ordering::SeqCst);
        true
    }

    /// Manual trigger: runs regardless of the in-flight flag. Callers must
    /// not race this with itself.
    async fn fire_now(&self) {
        self.running.store(true, Ordering::SeqCst);
        (self.task)().await;
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    jobs: HashMap<String, Arc<Job>>,
    tickers: Vec<tokio::task::JoinHandle<()>>,
    scheduled: Vec<String>,
}

/// Drives the two maintenance jobs from cron expressions. Tasks are
/// registered once; `start`/`reload` turn the current config into tickers.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                tickers: Vec::new(),
                scheduled: Vec::new(),
            }),
        }
    }

    pub fn register(&self, name: &str, task: JobFn) {
        let job = Arc::new(Job {
            name: name.to_string(),
            running: AtomicBool::new(false),
            task,
        });
        if let Ok(mut inner) = self.inner.lock() {
            inner.jobs.insert(name.to_string(), job);
        }
    }

    /// Schedule tickers for the registered jobs. The auto-trigger job only
    /// runs while extraction is enabled; retention always runs.
    pub fn start(&self, config: &Config) -> Result<()> {
        let auto = if config.enabled {
            Some(parse_cron(&config.auto_cron).map_err(|e| {
                EngineError::Validation(format!("auto_cron '{}': {e}", config.auto_cron))
            })?)
        } else {
            None
        };
        let retention = parse_cron(&config.retention_cron).map_err(|e| {
            EngineError::Validation(format!("retention_cron '{}': {e}", config.retention_cron))
        })?;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("scheduler mutex poisoned".into()))?;

        if let Some(schedule) = auto {
            if let Some(job) = inner.jobs.get(AUTO_TRIGGER).cloned() {
                inner.tickers.push(spawn_ticker(job, schedule));
                inner.scheduled.push(AUTO_TRIGGER.to_string());
            }
        }
        if let Some(job) = inner.jobs.get(RETENTION_CLEANUP).cloned() {
            inner.tickers.push(spawn_ticker(job, retention));
            inner.scheduled.push(RETENTION_CLEANUP.to_string());
        }
        Ok(())
    }

    /// Stop both jobs and reschedule them from a new config.
    pub fn reload(&self, config: &Config) -> Result<()> {
        config.validate()?;
        self.stop();
        self.start(config)
    }

    pub fn stop(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            for handle in inner.tickers.drain(..) {
                handle.abort();
            }
            inner.scheduled.clear();
        }
    }

    /// Execute a job immediately, bypassing single-flight.
    pub async fn run_job_now(&self, name: &str) -> Result<()> {
        let job = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| EngineError::Internal("scheduler mutex poisoned".into()))?;
            inner.jobs.get(name).cloned()
        };
        match job {
            Some(job) => {
                job.fire_now().await;
                Ok(())
            }
            None => Err(EngineError::Validation(format!("unknown job '{name}'"))),
        }
    }

    /// Names of jobs with an active ticker.
    pub fn scheduled_jobs(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.scheduled.clone())
            .unwrap_or_default()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

fn spawn_ticker(job: Arc<Job>, schedule: Schedule) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            job.try_fire().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: Arc<AtomicUsize>) -> JobFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/2 * * * *").is_ok());
        assert!(parse_cron("0 */6 * * *").is_ok());
        assert!(parse_cron("* * * * * *").is_ok());
        assert!(parse_cron("every tuesday").is_err());
        assert!(parse_cron("").is_err());
    }

    #[tokio::test]
    async fn run_job_now_executes_registered_task() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(AUTO_TRIGGER, counting_task(Arc::clone(&counter)));

        scheduler.run_job_now(AUTO_TRIGGER).await.unwrap();
        scheduler.run_job_now(AUTO_TRIGGER).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_job_now_rejects_unknown_job() {
        let scheduler = Scheduler::new();
        let err = scheduler.run_job_now("compactor").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn scheduled_fire_is_dropped_while_running() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(AUTO_TRIGGER, counting_task(Arc::clone(&counter)));

        let job = {
            let inner = scheduler.inner.lock().unwrap();
            inner.jobs.get(AUTO_TRIGGER).cloned().unwrap()
        };

        // simulate an in-flight run: the tick is dropped, not queued
        job.running.store(true, Ordering::SeqCst);
        assert!(!job.try_fire().await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        job.running.store(false, Ordering::SeqCst);
        assert!(job.try_fire().await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_config_skips_auto_trigger() {
        let scheduler = Scheduler::new();
        scheduler.register(AUTO_TRIGGER, counting_task(Arc::new(AtomicUsize::new(0))));
        scheduler.register(
            RETENTION_CLEANUP,
            counting_task(Arc::new(AtomicUsize::new(0))),
        );

        let mut config = Config::default();
        config.enabled = false;
        scheduler.start(&config).unwrap();
        assert_eq!(scheduler.scheduled_jobs(), vec![RETENTION_CLEANUP]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn reload_reschedules_both_jobs() {
        let scheduler = Scheduler::new();
        scheduler.register(AUTO_TRIGGER, counting_task(Arc::new(AtomicUsize::new(0))));
        scheduler.register(
            RETENTION_CLEANUP,
            counting_task(Arc::new(AtomicUsize::new(0))),
        );

        let mut config = Config::default();
        config.enabled = false;
        scheduler.start(&config).unwrap();
        assert_eq!(scheduler.scheduled_jobs().len(), 1);

        config.enabled = true;
        scheduler.reload(&config).unwrap();
        let jobs = scheduler.scheduled_jobs();
        assert!(jobs.contains(&AUTO_TRIGGER.to_string()));
        assert!(jobs.contains(&RETENTION_CLEANUP.to_string()));

        scheduler.stop();
        assert!(scheduler.scheduled_jobs().is_empty());
    }

    #[tokio::test]
    async fn reload_rejects_invalid_config() {
        let scheduler = Scheduler::new();
        let mut config = Config::default();
        config.auto_cron = "whenever".to_string();
        config.enabled = true;
        assert!(scheduler.reload(&config).is_err());
    }

    #[tokio::test]
    async fn ticker_fires_every_second_schedule() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(RETENTION_CLEANUP, counting_task(Arc::clone(&counter)));

        let mut config = Config::default();
        config.retention_cron = "* * * * * *".to_string();
        scheduler.start(&config).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
        scheduler.stop();
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one fire, got {fired}");

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }
}
