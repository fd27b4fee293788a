//! Scheduler loop and dispatch.
//!
//! One loop task polls for due work every tick; executions run on spawned
//! workers bounded by a semaphore sized to `max_concurrent`. `last_run`
//! and the running flag are set BEFORE execution to prevent
//! double-scheduling of a slow task.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{Priority, TaskStats};
use crate::clock::epoch_now;

/// Boxed async task body. Errors are recorded in stats, never propagated.
pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub const MIN_INTERVAL_SECS: f64 = 0.1;
pub const MAX_INTERVAL_SECS: f64 = 3600.0;

struct Task {
    handler: TaskHandler,
    interval: f64,
    priority: Priority,
    paused: bool,
    running: bool,
    /// Registration order, for stable ties within a priority.
    seq: u64,
    stats: TaskStats,
}

struct Inner {
    tasks: HashMap<String, Task>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    permits: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_tick(max_concurrent, Duration::from_millis(50))
    }

    pub fn with_tick(max_concurrent: usize, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tasks: HashMap::new(),
                next_seq: 0,
            })),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            shutdown: Arc::new(AtomicBool::new(false)),
            tick,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a repeating task. Re-registering an existing name
    /// replaces it. The interval is clamped to [0.1, 3600] seconds.
    pub fn register_task(
        &self,
        name: &str,
        handler: TaskHandler,
        interval_secs: f64,
        priority: Priority,
    ) {
        let interval = interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS);
        if interval != interval_secs {
            debug!(task = name, requested = interval_secs, clamped = interval, "interval clamped");
        }
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.insert(
            name.to_string(),
            Task {
                handler,
                interval,
                priority,
                paused: false,
                running: false,
                seq,
                stats: TaskStats::default(),
            },
        );
        info!(task = name, interval, ?priority, "task registered");
    }

    /// Remove a task. Returns true if it existed. An in-flight execution
    /// is not cancelled; it just will not be rescheduled.
    pub fn unregister_task(&self, name: &str) -> bool {
        self.lock().tasks.remove(name).is_some()
    }

    /// Skip a task during readiness computation until resumed.
    pub fn pause_task(&self, name: &str) -> bool {
        match self.lock().tasks.get_mut(name) {
            Some(task) => {
                task.paused = true;
                true
            }
            None => false,
        }
    }

    pub fn resume_task(&self, name: &str) -> bool {
        match self.lock().tasks.get_mut(name) {
            Some(task) => {
                task.paused = false;
                true
            }
            None => false,
        }
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn task_stats(&self, name: &str) -> Option<TaskStats> {
        self.lock().tasks.get(name).map(|t| t.stats.clone())
    }

    /// Stats for every task, keyed by name.
    pub fn all_stats(&self) -> HashMap<String, TaskStats> {
        self.lock()
            .tasks
            .iter()
            .map(|(name, task)| (name.clone(), task.stats.clone()))
            .collect()
    }

    /// Effective (clamped) interval of a task.
    pub fn task_interval(&self, name: &str) -> Option<f64> {
        self.lock().tasks.get(name).map(|t| t.interval)
    }

    /// Spawn the scheduling loop.
    pub fn start(&self) {
        let sched = self.clone();
        tokio::spawn(async move {
            sched.run_loop().await;
        });
    }

    /// Signal the loop to exit. In-flight executions finish naturally.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn run_loop(self) {
        info!("scheduler loop started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.dispatch_ready(epoch_now());
        }
        info!("scheduler loop stopped");
    }

    /// Names of due tasks in dispatch order: priority first, then
    /// registration order. Running or paused tasks are excluded no
    /// matter how overdue they are.
    fn ready_tasks(&self, now: f64) -> Vec<String> {
        let inner = self.lock();
        let mut ready: Vec<(Priority, u64, String)> = inner
            .tasks
            .iter()
            .filter(|(_, task)| {
                !task.running
                    && !task.paused
                    && task
                        .stats
                        .last_run
                        .map_or(true, |last| now - last >= task.interval)
            })
            .map(|(name, task)| (task.priority, task.seq, name.clone()))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, _, name)| name).collect()
    }

    fn dispatch_ready(&self, now: f64) {
        for name in self.ready_tasks(now) {
            // When workers are exhausted, stop here: higher priorities
            // already claimed their permits this tick.
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };

            let handler = {
                let mut inner = self.lock();
                let Some(task) = inner.tasks.get_mut(&name) else {
                    continue;
                };
                if task.running || task.paused {
                    continue;
                }
                task.running = true;
                task.stats.last_run = Some(now);
                Arc::clone(&task.handler)
            };

            let sched = self.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                // A panicking body counts as a failed run; it must not wedge
                // the task in the running state or leak the permit.
                let result = match AssertUnwindSafe(handler()).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(anyhow::anyhow!(
                        "task panicked: {}",
                        panic_text(payload.as_ref())
                    )),
                };
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                sched.record_run(&name, result, elapsed_ms);
                drop(permit);
            });
        }
    }

    fn record_run(&self, name: &str, result: Result<()>, elapsed_ms: f64) {
        let mut inner = self.lock();
        // Task may have been unregistered mid-flight; nothing to record.
        let Some(task) = inner.tasks.get_mut(name) else {
            return;
        };
        task.running = false;
        let stats = &mut task.stats;
        stats.run_count += 1;
        let n = stats.run_count as f64;
        stats.avg_duration_ms += (elapsed_ms - stats.avg_duration_ms) / n;
        match result {
            Ok(()) => {
                stats.consecutive_failures = 0;
            }
            Err(e) => {
                stats.error_count += 1;
                stats.consecutive_failures += 1;
                warn!(task = name, error = %e, failures = stats.consecutive_failures, "task failed");
            }
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_handler(counter: Arc<AtomicU64>) -> TaskHandler {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_no_self_overlap() {
        let sched = Scheduler::new(4);
        let current = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let (cur, pk) = (Arc::clone(&current), Arc::clone(&peak));
        let handler: TaskHandler = Arc::new(move || {
            let cur = Arc::clone(&cur);
            let pk = Arc::clone(&pk);
            Box::pin(async move {
                let c = cur.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(c, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });

        sched.register_task("slow", handler, 0.1, Priority::High);
        sched.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sched.stop();

        assert_eq!(peak.load(Ordering::SeqCst), 1, "task overlapped with itself");
        let stats = sched.task_stats("slow").unwrap();
        assert!(stats.run_count >= 2);
    }

    #[tokio::test]
    async fn test_priority_ordering_when_constrained() {
        let sched = Scheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [
            ("low", Priority::Low),
            ("medium", Priority::Medium),
            ("high", Priority::High),
        ] {
            let order = Arc::clone(&order);
            let handler: TaskHandler = Arc::new(move || {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(name);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
            });
            sched.register_task(name, handler, 5.0, priority);
        }

        sched.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        sched.stop();

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["high", "medium", "low"]);
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let sched = Scheduler::new(2);
        sched.register_task("t", counting_handler(Arc::new(AtomicU64::new(0))), 1.0, Priority::Medium);
        assert_eq!(sched.task_count(), 1);

        assert!(sched.unregister_task("t"));
        assert_eq!(sched.task_count(), 0);
        assert!(!sched.unregister_task("nonexistent"));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let sched = Scheduler::new(2);
        let count = Arc::new(AtomicU64::new(0));
        sched.register_task("t", counting_handler(Arc::clone(&count)), 0.1, Priority::Medium);
        sched.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sched.pause_task("t"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused_at = count.load(Ordering::SeqCst);
        assert!(paused_at > 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), paused_at, "task ran while paused");

        assert!(sched.resume_task("t"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(count.load(Ordering::SeqCst) > paused_at);

        sched.stop();
    }

    #[tokio::test]
    async fn test_interval_clamping() {
        let sched = Scheduler::new(2);
        sched.register_task("small", counting_handler(Arc::new(AtomicU64::new(0))), 0.01, Priority::Low);
        sched.register_task("large", counting_handler(Arc::new(AtomicU64::new(0))), 10_000.0, Priority::Low);

        assert_eq!(sched.task_interval("small"), Some(MIN_INTERVAL_SECS));
        assert_eq!(sched.task_interval("large"), Some(MAX_INTERVAL_SECS));
        assert_eq!(sched.task_count(), 2);
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let sched = Scheduler::new(2);
        let handler = counting_handler(Arc::new(AtomicU64::new(0)));
        sched.register_task("t", Arc::clone(&handler), 1.0, Priority::Low);
        sched.register_task("t", handler, 2.0, Priority::High);

        assert_eq!(sched.task_count(), 1);
        assert_eq!(sched.task_interval("t"), Some(2.0));
    }

    #[tokio::test]
    async fn test_failing_task_records_errors_and_does_not_stop_others() {
        let sched = Scheduler::new(2);
        let failing: TaskHandler =
            Arc::new(|| Box::pin(async { anyhow::bail!("simulated failure") }));
        let count = Arc::new(AtomicU64::new(0));

        sched.register_task("failing", failing, 0.1, Priority::Medium);
        sched.register_task("healthy", counting_handler(Arc::clone(&count)), 0.1, Priority::Medium);
        sched.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        sched.stop();

        let stats = sched.task_stats("failing").unwrap();
        assert!(stats.error_count > 0);
        assert!(stats.consecutive_failures > 0);
        assert_eq!(stats.error_count, stats.run_count);
        assert!(count.load(Ordering::SeqCst) > 0, "healthy task starved");
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_running_and_counts_failures() {
        let sched = Scheduler::new(2);
        let panicking: TaskHandler = Arc::new(|| {
            Box::pin(async {
                if true {
                    panic!("simulated panic");
                }
                Ok(())
            })
        });
        let count = Arc::new(AtomicU64::new(0));

        sched.register_task("panicking", panicking, 0.1, Priority::Medium);
        sched.register_task("healthy", counting_handler(Arc::clone(&count)), 0.1, Priority::Medium);
        sched.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sched.stop();

        let stats = sched.task_stats("panicking").unwrap();
        assert!(stats.run_count >= 2, "task wedged after first panic");
        assert_eq!(stats.error_count, stats.run_count);
        assert!(stats.consecutive_failures >= 2);
        assert!(count.load(Ordering::SeqCst) > 0, "healthy task starved");
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let sched = Scheduler::new(2);
        let fail_first = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&fail_first);
        let handler: TaskHandler = Arc::new(move || {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                if flag.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("warming up");
                }
                Ok(())
            })
        });

        sched.register_task("flaky", handler, 0.1, Priority::Medium);
        sched.start();
        tokio::time::sleep(Duration::from_millis(600)).await;
        sched.stop();

        let stats = sched.task_stats("flaky").unwrap();
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.avg_duration_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let sched = Scheduler::new(2);
        let handler: TaskHandler = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
        });
        sched.register_task("t", handler, 0.1, Priority::Medium);
        sched.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        sched.stop();

        let stats = sched.task_stats("t").unwrap();
        assert!(stats.run_count >= 2);
        assert!(stats.last_run.is_some());
        assert!(stats.avg_duration_ms > 0.0);
    }
}
