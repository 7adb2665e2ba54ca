//! Job engine: a fixed-size worker pool that pulls pending jobs off
//! the store, runs the single-VM migration sequence through a pluggable
//! [`MigrationExecutor`], and feeds back status/progress/retry per the job
//! lifecycle state machine.
//!
//! Workers poll rather than block on a queue, matching `JobStore`'s
//! single-writer-per-row model: there is no separate dispatch queue to keep
//! consistent with the durable table, so picking up work is "ask the store
//! for the oldest pending row, try to claim it."

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vmforge_jobstore::JobStore;
use vmforge_retry::calculate_delay;
use vmforge_types::{Job, JobFilter, JobStatus, RetryStrategyConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("job store error: {0}")]
    Store(#[from] vmforge_jobstore::JobStoreError),
    #[error("job {0} is not running")]
    NotRunning(String),
    #[error("job cancelled")]
    Cancelled,
}

/// Outcome of running one job's migration sequence to completion.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed,
    Failed { message: String, transient: bool },
    Cancelled,
}

/// The single-VM migration sequence, left pluggable so the engine
/// doesn't depend on the orchestrator crate that composes it.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome;
}

/// Runtime configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub retry: RetryStrategyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            retry: vmforge_types::RetryBudgets::default().stage,
        }
    }
}

/// Worker pool coordinating job pickup, execution, retry, and cancellation.
pub struct Engine<E: MigrationExecutor + 'static> {
    store: Arc<JobStore>,
    executor: Arc<E>,
    config: EngineConfig,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl<E: MigrationExecutor + 'static> Engine<E> {
    pub fn new(store: Arc<JobStore>, executor: E, config: EngineConfig) -> Self {
        Self {
            store,
            executor: Arc::new(executor),
            config,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn `worker_count` workers. Returns their join handles; the caller
    /// owns the pool's lifetime and should `shutdown()` before dropping.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_count.max(1))
            .map(|id| {
                let store = self.store.clone();
                let executor = self.executor.clone();
                let config = self.config.clone();
                let cancellations = self.cancellations.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move { worker_loop(id, store, executor, config, cancellations, shutdown).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel a job. Pending jobs are marked cancelled directly;
    /// running jobs have their bound token signalled and the worker unwinds
    /// on its own.
    pub fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        let token = self.cancellations.lock().unwrap().get(job_id).cloned();
        if let Some(token) = token {
            token.cancel();
            return Ok(());
        }

        let job = self.store.load_job(job_id)?;
        if job.status == JobStatus::Pending {
            self.store.update_job_status(job_id, JobStatus::Cancelled)?;
            return Ok(());
        }
        Err(EngineError::NotRunning(job_id.to_string()))
    }
}

async fn worker_loop<E: MigrationExecutor + 'static>(
    worker_id: usize,
    store: Arc<JobStore>,
    executor: Arc<E>,
    config: EngineConfig,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match pick_next_pending(&store) {
            Ok(Some(job)) => {
                run_job(worker_id, &store, &executor, &config, &cancellations, job).await;
            }
            Ok(None) => tokio::time::sleep(config.poll_interval).await,
            Err(e) => {
                tracing::error!(worker = worker_id, error = %e, "failed to poll job store");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}

/// Read the oldest pending job and claim it by transitioning to `running`.
/// A `NotFound`/conflicting-transition race (another worker claimed it
/// first) is treated as "nothing to do this tick", not an error.
fn pick_next_pending(store: &JobStore) -> vmforge_jobstore::Result<Option<Job>> {
    let filter = JobFilter {
        status: Some(JobStatus::Pending),
        ..Default::default()
    };
    let mut pending = store.list_jobs(&filter)?;
    pending.sort_by_key(|j| j.created_at);
    let Some(oldest) = pending.into_iter().next() else {
        return Ok(None);
    };

    match store.update_job_status(&oldest.id, JobStatus::Running) {
        Ok(()) => store.load_job(&oldest.id).map(Some),
        Err(vmforge_jobstore::JobStoreError::InvalidTransition(_)) => Ok(None),
        Err(vmforge_jobstore::JobStoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn run_job<E: MigrationExecutor + 'static>(
    worker_id: usize,
    store: &JobStore,
    executor: &Arc<E>,
    config: &EngineConfig,
    cancellations: &Arc<Mutex<HashMap<String, CancellationToken>>>,
    job: Job,
) {
    let token = CancellationToken::new();
    cancellations.lock().unwrap().insert(job.id.clone(), token.clone());

    let mut attempt = 1;
    let outcome = loop {
        if token.is_cancelled() {
            break ExecutionOutcome::Cancelled;
        }
        tracing::info!(worker = worker_id, job = %job.id, attempt, "running migration");
        match executor.execute(&job, token.clone()).await {
            ExecutionOutcome::Failed { message, transient } if transient && attempt < config.retry.max_attempts => {
                let delay = calculate_delay(&config.retry, attempt);
                tracing::warn!(job = %job.id, attempt, %message, "transient failure, retrying");
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break ExecutionOutcome::Cancelled,
                }
            }
            other => break other,
        }
    };

    cancellations.lock().unwrap().remove(&job.id);

    let result = match &outcome {
        ExecutionOutcome::Completed => store.update_job_status(&job.id, JobStatus::Completed),
        ExecutionOutcome::Failed { message, .. } => store.fail_job(&job.id, message.clone()),
        ExecutionOutcome::Cancelled => store.update_job_status(&job.id, JobStatus::Cancelled),
    };
    if let Err(e) = result {
        tracing::error!(job = %job.id, error = %e, "failed to persist final job status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vmforge_types::Provider;

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            name: "nightly job".to_string(),
            vm_name: "vm1".to_string(),
            vm_path: "/vms/vm1".to_string(),
            provider: Provider::Vsphere,
            output_dir: "/exports/vm1".to_string(),
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error: None,
            metadata: Default::default(),
            user: None,
            total_bytes: 0,
            files_count: 0,
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl MigrationExecutor for AlwaysSucceeds {
        async fn execute(&self, _job: &Job, _cancel: CancellationToken) -> ExecutionOutcome {
            ExecutionOutcome::Completed
        }
    }

    struct FailsThenSucceeds {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MigrationExecutor for FailsThenSucceeds {
        async fn execute(&self, _job: &Job, _cancel: CancellationToken) -> ExecutionOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                ExecutionOutcome::Failed { message: "timeout".to_string(), transient: true }
            } else {
                ExecutionOutcome::Completed
            }
        }
    }

    #[tokio::test]
    async fn picks_up_and_completes_a_pending_job() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        store.save_job(&sample_job("j1")).unwrap();

        let engine = Engine::new(
            store.clone(),
            AlwaysSucceeds,
            EngineConfig { worker_count: 1, poll_interval: Duration::from_millis(5), ..EngineConfig::default() },
        );
        let handles = engine.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.shutdown();
        for h in handles {
            let _ = h.await;
        }

        let job = store.load_job("j1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
    }

    #[tokio::test]
    async fn retries_transient_failures_before_succeeding() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        store.save_job(&sample_job("j2")).unwrap();

        let mut retry = vmforge_types::RetryBudgets::default().stage;
        retry.max_attempts = 3;
        retry.base_delay = Duration::from_millis(1);
        retry.jitter = 0.0;

        let engine = Engine::new(
            store.clone(),
            FailsThenSucceeds { calls: AtomicUsize::new(0) },
            EngineConfig { worker_count: 1, poll_interval: Duration::from_millis(5), retry },
        );
        let handles = engine.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.shutdown();
        for h in handles {
            let _ = h.await;
        }

        let job = store.load_job("j2").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelling_a_pending_job_marks_it_cancelled_without_running() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        store.save_job(&sample_job("j3")).unwrap();

        let engine = Engine::new(
            store.clone(),
            AlwaysSucceeds,
            EngineConfig { worker_count: 0, ..EngineConfig::default() },
        );
        engine.cancel("j3").unwrap();

        let job = store.load_job("j3").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
