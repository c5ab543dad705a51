//! Shared scheduler for periodic coordination jobs.
//!
//! Each job runs on its own tokio task. A run is awaited inline before the
//! next tick is considered, and missed ticks are skipped, so runs of the same
//! job never overlap or queue up. Cancelling a job lets an in-flight run
//! finish; it only prevents further runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Job {
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of named periodic jobs
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
    shutdown: broadcast::Sender<()>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            jobs: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Run `job` every `period`, starting immediately.
    ///
    /// Registering a name that is already scheduled cancels the old job.
    pub fn schedule<F, Fut>(&self, name: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (stop, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_job(name.to_string(), period, job, stop_rx));

        if let Some(old) = self.jobs().insert(name.to_string(), Job { stop, task }) {
            let _ = old.stop.send(());
            tracing::info!(job = %name, "Scheduled job replaced");
        }
        tracing::debug!(job = %name, period = ?period, "Job scheduled");
    }

    /// Stop a job after its current run. Returns false if it was not scheduled.
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs().remove(name) {
            Some(job) => {
                let _ = job.stop.send(());
                tracing::debug!(job = %name, "Job cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.jobs().get(name).is_some_and(|job| !job.task.is_finished())
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs().keys().cloned().collect();
        names.sort();
        names
    }

    /// Signal for long-running workers that are not periodic jobs
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop every job and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let jobs: Vec<(String, Job)> = self.jobs().drain().collect();

        let mut tasks = Vec::with_capacity(jobs.len());
        for (name, job) in jobs {
            let _ = job.stop.send(());
            tasks.push(async move { (name, job.task.await) });
        }
        for (name, result) in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(job = %name, error = %e, "Scheduled job task failed");
            }
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_job<F, Fut>(
    name: String,
    period: Duration,
    job: F,
    mut stop: broadcast::Receiver<()>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = job().await {
                    tracing::warn!(job = %name, error = %format!("{e:#}"), "Scheduled job failed");
                }
            }
            _ = stop.recv() => break,
        }
    }
    tracing::debug!(job = %name, "Job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_job_runs_until_cancelled() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("tick", Duration::from_millis(10), counting_job(runs.clone()));

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(scheduler.is_scheduled("tick"));
        assert!(scheduler.cancel("tick"));
        assert!(!scheduler.cancel("tick"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 3);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        let scheduler = Scheduler::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        scheduler.schedule("slow", Duration::from_millis(5), move || {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_job() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        scheduler.schedule("flaky", Duration::from_millis(10), move || {
            r.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("store unavailable")) }
        });

        tokio::time::sleep(Duration::from_millis(45)).await;
        scheduler.shutdown().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_reregister_replaces_job() {
        let scheduler = Scheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("job", Duration::from_millis(10), counting_job(first.clone()));
        tokio::time::sleep(Duration::from_millis(15)).await;
        scheduler.schedule("job", Duration::from_millis(10), counting_job(second.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let frozen = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(first.load(Ordering::SeqCst), frozen);
        assert!(second.load(Ordering::SeqCst) >= 2);
        assert_eq!(scheduler.job_names(), vec!["job".to_string()]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_notifies_workers() {
        let scheduler = Scheduler::new();
        let mut signal = scheduler.shutdown_signal();
        scheduler.shutdown().await;
        assert!(signal.recv().await.is_ok());
    }
}
