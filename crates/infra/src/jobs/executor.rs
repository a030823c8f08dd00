//! Worker pool: concurrent claim loops plus periodic queue maintenance.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dprompts_ai::TextGenerator;

use crate::config::WorkerSettings;
use crate::store::{GroupResolver, JobQueue, ResultStore};

use super::runner::{AttemptOutcome, JobRunner};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix of each worker's identity in `attempted_by`
    pub name: String,
    /// Number of jobs processed at the same time
    pub concurrency: usize,
    /// Idle wait between polls of an empty queue
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    /// Running jobs whose attempt started longer ago than this are rescued
    pub stuck_after: Duration,
    /// Completed jobs older than this are pruned (results are kept)
    pub completed_retention: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            name: "dprompts-worker".to_string(),
            concurrency: settings.concurrency.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            maintenance_interval: Duration::from_secs(settings.maintenance_interval_secs.max(1)),
            stuck_after: Duration::from_secs(
                settings.attempt_timeout_secs + settings.rescue_grace_secs,
            ),
            completed_retention: Duration::from_secs(settings.completed_retention_hours * 60 * 60),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub discarded: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<PoolStats>>;

fn update(stats: &SharedStats, f: impl FnOnce(&mut PoolStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop claiming new jobs, let in-flight attempts finish, and wait for
    /// every task.
    pub async fn shutdown(self) -> PoolStats {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the tasks to exit, which they do once the token is cancelled.
    pub async fn join(mut self) -> PoolStats {
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                error!(error = %err, "worker task panicked");
            }
        }
        let stats = self.stats();
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "worker pool stopped"
        );
        stats
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `config.concurrency` workers and one maintenance task. They run
    /// until `token` is cancelled.
    pub fn spawn<S, G>(
        runner: Arc<JobRunner<S, G>>,
        config: WorkerPoolConfig,
        token: CancellationToken,
    ) -> WorkerPoolHandle
    where
        S: JobQueue + GroupResolver + ResultStore + 'static,
        G: TextGenerator + 'static,
    {
        let stats = SharedStats::default();
        let mut tasks = Vec::with_capacity(config.concurrency + 1);

        info!(
            name = %config.name,
            concurrency = config.concurrency,
            attempt_timeout = ?runner.attempt_timeout(),
            "worker pool started"
        );

        for n in 0..config.concurrency {
            let worker = format!("{}-{}", config.name, n + 1);
            tasks.push(tokio::spawn(worker_loop(
                runner.clone(),
                worker,
                config.poll_interval,
                token.clone(),
                stats.clone(),
            )));
        }
        tasks.push(tokio::spawn(maintenance_loop(
            runner,
            config,
            token.clone(),
        )));

        WorkerPoolHandle {
            token,
            tasks,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop<S, G>(
    runner: Arc<JobRunner<S, G>>,
    worker: String,
    poll_interval: Duration,
    token: CancellationToken,
    stats: SharedStats,
) where
    S: JobQueue + GroupResolver + ResultStore,
    G: TextGenerator,
{
    debug!(worker = %worker, "worker started");

    while !token.is_cancelled() {
        match runner.claim(&worker).await {
            Ok(Some(job)) => {
                update(&stats, |s| s.running += 1);
                let outcome = runner.handle(&job).await;
                update(&stats, |s| {
                    s.running -= 1;
                    s.processed += 1;
                    match &outcome {
                        Ok(AttemptOutcome::Completed) => s.succeeded += 1,
                        Ok(AttemptOutcome::Discarded) => {
                            s.failed += 1;
                            s.discarded += 1;
                        }
                        Ok(AttemptOutcome::Retrying | AttemptOutcome::Lost) | Err(_) => {
                            s.failed += 1
                        }
                    }
                });
                if let Err(err) = outcome {
                    error!(worker = %worker, job_id = %job.id, error = %err, "failed to record job failure");
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => error!(worker = %worker, error = %err, "failed to claim job"),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!(worker = %worker, "worker stopped");
}

async fn maintenance_loop<S, G>(
    runner: Arc<JobRunner<S, G>>,
    config: WorkerPoolConfig,
    token: CancellationToken,
) where
    S: JobQueue + GroupResolver + ResultStore,
    G: TextGenerator,
{
    let mut ticker = tokio::time::interval(config.maintenance_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match runner.store().rescue_stuck(config.stuck_after).await {
            Ok(0) => {}
            Ok(rescued) => warn!(rescued, "rescued stuck jobs"),
            Err(err) => error!(error = %err, "failed to rescue stuck jobs"),
        }
        match runner.store().prune_completed(config.completed_retention).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned completed jobs"),
            Err(err) => error!(error = %err, "failed to prune completed jobs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dprompts_core::{JobId, JobSpec, SchemaRegistry};
    use serde_json::json;

    use crate::enqueue::Enqueuer;
    use crate::jobs::runner::tests::StubGenerator;
    use crate::jobs::JobState;
    use crate::store::InMemoryStore;

    fn fast_config(concurrency: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name("test")
            .with_concurrency(concurrency)
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn wait_for_processed(handle: &WorkerPoolHandle, count: u64) {
        for _ in 0..500 {
            if handle.stats().processed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool processed {} of {count} jobs", handle.stats().processed);
    }

    #[test]
    fn settings_map_to_pool_config() {
        let settings = WorkerSettings {
            concurrency: 0,
            attempt_timeout_secs: 300,
            rescue_grace_secs: 60,
            completed_retention_hours: 2,
            ..Default::default()
        };
        let config = WorkerPoolConfig::from_settings(&settings);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.stuck_after, Duration::from_secs(360));
        assert_eq!(config.completed_retention, Duration::from_secs(7200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_drains_queue_and_shuts_down() {
        let store = InMemoryStore::new();
        let enqueuer = Enqueuer::new(store.clone(), SchemaRegistry::empty());
        let mut ids: Vec<JobId> = Vec::new();
        for n in 0..10 {
            let spec: JobSpec =
                serde_json::from_value(json!({"prompt": format!("p{n}"), "group_name": "batch"}))
                    .unwrap();
            ids.push(enqueuer.enqueue(spec, None).await.unwrap());
        }

        let runner = Arc::new(JobRunner::new(store.clone(), Arc::new(StubGenerator::answering("ok"))));
        let handle = WorkerPool::spawn(runner, fast_config(3), CancellationToken::new());

        wait_for_processed(&handle, 10).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.processed, 10);
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.running, 0);
        assert_eq!(store.result_count().await, 10);
        assert_eq!(store.group_count().await, 1);
        for id in ids {
            assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn external_cancellation_stops_idle_pool() {
        let store = InMemoryStore::new();
        let runner = Arc::new(JobRunner::new(store, Arc::new(StubGenerator::answering("ok"))));
        let token = CancellationToken::new();
        let handle = WorkerPool::spawn(runner, fast_config(2), token.clone());

        token.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("pool did not stop");
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_are_counted() {
        let store = InMemoryStore::new();
        let spec: JobSpec = serde_json::from_value(json!({"prompt": "x"})).unwrap();
        let id = Enqueuer::new(store.clone(), SchemaRegistry::empty())
            .enqueue(spec, None)
            .await
            .unwrap();

        let stub = StubGenerator::answering("ok")
            .then(Err(dprompts_ai::GenerationError::Transport("refused".into())));
        let runner = Arc::new(JobRunner::new(store.clone(), Arc::new(stub)));
        let handle = WorkerPool::spawn(runner, fast_config(1), CancellationToken::new());

        wait_for_processed(&handle, 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().state, JobState::Retryable);
    }
}
