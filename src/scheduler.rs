//! Bounded Concurrency Scheduler
//!
//! Drains a FIFO queue of jobs through a fixed pool of workers. Each worker
//! pops the next job, runs it to completion and pops again, so the pool stays
//! saturated until the queue is empty ("greedy admission"). The run is over
//! once every worker has found the queue empty.
//!
//! Every job is bounded by the per-endpoint wall-clock cap. A job that runs
//! past it is abandoned: its future is dropped (which also aborts any
//! request it had in flight) and it is reported back as [`JobOutcome::Abandoned`].
//!
//! While jobs run, a reporter task logs progress on a fixed interval.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::tester::{EndpointTestState, TestStatus};

/// Tasks listed individually in a progress report
const MAX_TASKS_IN_REPORT: usize = 10;

/// How a job left the pool
#[derive(Debug)]
pub enum JobOutcome<J, R> {
    /// The job ran to completion
    Finished { job: J, result: R },

    /// The job exceeded the wall-clock cap and was dropped
    Abandoned {
        job: J,
        last_state: EndpointTestState,
        elapsed: Duration,
    },
}

/// A job currently held by a worker
struct ActiveTask {
    label: String,
    started: Instant,
    state: watch::Receiver<EndpointTestState>,
}

type ActiveSet = Arc<Mutex<HashMap<u64, ActiveTask>>>;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct Scheduler {
    concurrency_limit: usize,
    max_duration: Duration,
    progress_interval: Duration,
}

impl Scheduler {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            max_duration: config.endpoint_max_duration(),
            progress_interval: config.progress_interval(),
        }
    }

    /// Run every job through the pool and collect the outcomes
    ///
    /// Outcomes arrive in completion order, not submission order.
    pub async fn run<J, R, F, Fut>(&self, label: &'static str, jobs: Vec<J>, work: F) -> Vec<JobOutcome<J, R>>
    where
        J: Display + Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(J, TestStatus) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let workers = self.concurrency_limit.min(total);
        info!(
            "🚀 {}: {} jobs, {} workers, {:?} cap per job",
            label, total, workers, self.max_duration
        );

        let started = Instant::now();
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let active: ActiveSet = Arc::new(Mutex::new(HashMap::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let next_task_id = Arc::new(AtomicU64::new(0));
        let work = Arc::new(work);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let queue = queue.clone();
            let active = active.clone();
            let completed = completed.clone();
            let next_task_id = next_task_id.clone();
            let work = work.clone();
            let tx = tx.clone();
            let max_duration = self.max_duration;

            pool.spawn(async move {
                loop {
                    // The guard must not outlive this statement
                    let Some(job) = lock(&queue).pop_front() else {
                        break;
                    };
                    let task_id = next_task_id.fetch_add(1, Ordering::Relaxed);
                    let (status, state) = TestStatus::new();
                    let task_started = Instant::now();

                    lock(&active).insert(
                        task_id,
                        ActiveTask {
                            label: job.to_string(),
                            started: task_started,
                            state: state.clone(),
                        },
                    );

                    let outcome = match tokio::time::timeout(max_duration, (*work)(job.clone(), status)).await {
                        Ok(result) => JobOutcome::Finished { job, result },
                        Err(_) => {
                            let last_state = state.borrow().clone();
                            warn!(
                                "⏱️  {} exceeded {:?} (stage {}, attempt {}), abandoning",
                                job, max_duration, last_state.stage, last_state.attempt
                            );
                            JobOutcome::Abandoned {
                                job,
                                last_state,
                                elapsed: task_started.elapsed(),
                            }
                        }
                    };

                    lock(&active).remove(&task_id);
                    completed.fetch_add(1, Ordering::Relaxed);

                    if tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let reporter = tokio::spawn(report_progress(
            label,
            self.progress_interval,
            self.max_duration,
            total,
            started,
            queue.clone(),
            active.clone(),
            completed.clone(),
        ));

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("{} worker crashed: {}", label, e);
            }
        }
        reporter.abort();

        info!(
            "🏁 {}: {}/{} jobs done in {:.1}s",
            label,
            outcomes.len(),
            total,
            started.elapsed().as_secs_f64()
        );

        outcomes
    }
}

/// Periodic progress and stuck-task report
#[allow(clippy::too_many_arguments)]
async fn report_progress<J>(
    label: &'static str,
    interval: Duration,
    max_duration: Duration,
    total: usize,
    started: Instant,
    queue: Arc<Mutex<VecDeque<J>>>,
    active: ActiveSet,
    completed: Arc<AtomicUsize>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let done = completed.load(Ordering::Relaxed);
        let queued = lock(&queue).len();
        let tasks: Vec<(String, Duration, EndpointTestState)> = lock(&active)
            .values()
            .map(|t| (t.label.clone(), t.started.elapsed(), t.state.borrow().clone()))
            .collect();

        let waiting = tasks.iter().filter(|(_, _, s)| s.is_waiting).count();

        info!(
            "📊 {}: {}/{} ({:.1}%), active={} (waiting={}, processing={}), queued={}, elapsed={}s",
            label,
            done,
            total,
            done as f64 * 100.0 / total as f64,
            tasks.len(),
            waiting,
            tasks.len() - waiting,
            queued,
            started.elapsed().as_secs()
        );

        let mut by_age = tasks;
        by_age.sort_by(|a, b| b.1.cmp(&a.1));

        for (task_label, age, state) in by_age.iter().take(MAX_TASKS_IN_REPORT) {
            match state.remaining_wait() {
                Some(wait) => debug!(
                    "   ⏳ {} waiting {:.1}s before {} attempt {} ({:.0}s so far)",
                    task_label,
                    wait.as_secs_f64(),
                    state.stage,
                    state.attempt + 1,
                    age.as_secs_f64()
                ),
                None => debug!(
                    "   ⚙️  {} in {} attempt {} ({:.0}s so far)",
                    task_label,
                    state.stage,
                    state.attempt,
                    age.as_secs_f64()
                ),
            }
        }

        let slow: Vec<_> = by_age
            .iter()
            .filter(|(_, age, _)| *age > max_duration / 2)
            .collect();
        if !slow.is_empty() {
            warn!(
                "{} task(s) running longer than {:?}, oldest: {} ({:.0}s)",
                slow.len(),
                max_duration / 2,
                slow[0].0,
                slow[0].1.as_secs_f64()
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TestStage;

    fn scheduler(limit: usize, max_duration_ms: u64) -> Scheduler {
        let mut config = ProbeConfig::default();
        config.concurrency_limit = limit;
        config.endpoint_max_duration_ms = max_duration_ms;
        config.progress_log_interval_ms = 50;
        Scheduler::new(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<u64> = (0..40).collect();
        let outcomes = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            scheduler(4, 60_000)
                .run("test", jobs, move |job, _status| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10 + job % 7)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        job * 2
                    }
                })
                .await
        };

        assert_eq!(outcomes.len(), 40);
        assert_eq!(peak.load(Ordering::SeqCst), 4);

        let mut results: Vec<u64> = outcomes
            .into_iter()
            .map(|o| match o {
                JobOutcome::Finished { result, .. } => result,
                JobOutcome::Abandoned { .. } => panic!("nothing should be abandoned"),
            })
            .collect();
        results.sort();
        assert_eq!(results, (0..40).map(|j| j * 2).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_is_abandoned_and_pool_continues() {
        let outcomes = scheduler(1, 1_000)
            .run("test", vec![0u64, 1, 2], |job, status| async move {
                status.enter_stage(TestStage::BlockNumber);
                if job == 0 {
                    std::future::pending::<()>().await;
                }
                job
            })
            .await;

        assert_eq!(outcomes.len(), 3);

        let abandoned: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                JobOutcome::Abandoned { job, last_state, .. } => Some((*job, last_state.stage)),
                _ => None,
            })
            .collect();
        assert_eq!(abandoned, vec![(0, TestStage::BlockNumber)]);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let outcomes: Vec<JobOutcome<u64, ()>> =
            scheduler(4, 60_000).run("test", vec![], |_, _| async {}).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission_with_single_worker() {
        let outcomes = scheduler(1, 60_000)
            .run("test", vec![3u64, 1, 2], |job, _| async move { job })
            .await;

        let order: Vec<u64> = outcomes
            .into_iter()
            .filter_map(|o| match o {
                JobOutcome::Finished { result, .. } => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }
}
