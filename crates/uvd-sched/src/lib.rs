//! Cron-driven task scheduler.
//!
//! Expressions are standard 6/7-field cron (seconds first). An evaluation
//! loop wakes every 50 ms and fires each task whose next match fell inside
//! the elapsed window; task bodies run on a worker pool bounded by
//! `pool_size`. Per-task coalescing: at most one invocation in flight and
//! at most one pending — an overrunning body never stacks invocations.
//!
//! Task errors (and panics) are logged and swallowed; the scheduler never
//! stops because a task failed. `stop` grants in-flight bodies a bounded
//! shutdown window, then detaches them; pending invocations are discarded.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Evaluation tick.
const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("bad cron expression {expr:?}: {reason}")]
    BadExpr { expr: String, reason: String },
    #[error("scheduler already started")]
    AlreadyStarted,
}

/// A schedulable body. Errors are logged by the scheduler.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

struct TaskEntry {
    name: String,
    schedule: Schedule,
    task: TaskFn,
    in_flight: AtomicBool,
    pending: AtomicBool,
    fired: AtomicU64,
}

struct SchedInner {
    tasks: Mutex<Vec<Arc<TaskEntry>>>,
    running: AtomicBool,
    workers: Arc<Semaphore>,
    pool_size: usize,
}

/// The scheduler. Cheap to clone; one evaluation loop per `start`.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<SchedInner>,
}

impl CronScheduler {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            inner: Arc::new(SchedInner {
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                workers: Arc::new(Semaphore::new(pool_size)),
                pool_size,
            }),
        }
    }

    /// Register a task. Rejects (and logs) unparsable expressions; the
    /// rest of the schedule is unaffected.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        task: TaskFn,
    ) -> Result<(), SchedError> {
        let name = name.into();
        let schedule = Schedule::from_str(cron_expr).map_err(|e| {
            error!(task = %name, expr = cron_expr, %e, "bad cron expression, task skipped");
            SchedError::BadExpr {
                expr: cron_expr.to_string(),
                reason: e.to_string(),
            }
        })?;
        info!(task = %name, expr = cron_expr, "task scheduled");
        self.inner
            .tasks
            .lock()
            .expect("scheduler tasks poisoned")
            .push(Arc::new(TaskEntry {
                name,
                schedule,
                task,
                in_flight: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                fired: AtomicU64::new(0),
            }));
        Ok(())
    }

    /// Start the evaluation loop.
    pub fn start(&self) -> Result<(), SchedError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        info!(pool_size = self.inner.pool_size, "scheduler started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut last_checked: DateTime<Utc> = Utc::now();
            while inner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(TICK).await;
                let now = Utc::now();

                let due: Vec<Arc<TaskEntry>> = {
                    let tasks = inner.tasks.lock().expect("scheduler tasks poisoned");
                    tasks
                        .iter()
                        .filter(|entry| {
                            entry
                                .schedule
                                .after(&last_checked)
                                .next()
                                .is_some_and(|t| t <= now)
                        })
                        .map(Arc::clone)
                        .collect()
                };
                last_checked = now;

                for entry in due {
                    Self::fire(&inner, entry);
                }
            }
            debug!("scheduler evaluation loop stopped");
        });
        Ok(())
    }

    fn fire(inner: &Arc<SchedInner>, entry: Arc<TaskEntry>) {
        if entry.in_flight.swap(true, Ordering::SeqCst) {
            // Overrun: coalesce to a single pending invocation.
            if !entry.pending.swap(true, Ordering::SeqCst) {
                debug!(task = %entry.name, "firing coalesced behind running invocation");
            }
            return;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                let permit = inner
                    .workers
                    .acquire()
                    .await
                    .expect("worker semaphore closed");
                entry.fired.fetch_add(1, Ordering::Relaxed);

                let started = std::time::Instant::now();
                let result = std::panic::AssertUnwindSafe((entry.task)())
                    .catch_unwind()
                    .await;
                drop(permit);

                match result {
                    Ok(Ok(())) => {
                        debug!(task = %entry.name, elapsed_ms = started.elapsed().as_millis() as u64, "task done");
                    }
                    Ok(Err(err)) => {
                        error!(task = %entry.name, %err, "task failed");
                    }
                    Err(_) => {
                        error!(task = %entry.name, "task panicked");
                    }
                }

                // Scheduler stopping discards the coalesced invocation.
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                if !entry.pending.swap(false, Ordering::SeqCst) {
                    break;
                }
            }
            entry.in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// Stop firing and wait up to `shutdown_timeout` for in-flight bodies,
    /// then detach them.
    pub async fn stop(&self, shutdown_timeout: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler stopping");

        // All permits free again means every in-flight body returned.
        let all = self.inner.pool_size as u32;
        match tokio::time::timeout(shutdown_timeout, self.inner.workers.acquire_many(all)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(timeout_ms = shutdown_timeout.as_millis() as u64, "in-flight tasks detached at shutdown");
            }
        }
        info!("scheduler stopped");
    }

    /// How many times the named task has started. Test observability.
    pub fn fired_count(&self, name: &str) -> u64 {
        self.inner
            .tasks
            .lock()
            .expect("scheduler tasks poisoned")
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.fired.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
