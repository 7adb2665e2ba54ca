//! Batch orchestrator: sorts a list of `VMMigrationTask`s by
//! priority, then fans them out under a semaphore the same way
//! `vmforge-convert`'s `ParallelCoordinator` bounds per-disk conversion —
//! one VM migration per task instead of one disk per task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use vmforge_storage::CloudStorageConfig;

/// One VM queued for migration within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMMigrationTask {
    pub vm_name: String,
    pub vm_path: String,
    pub provider: vmforge_types::Provider,
    /// Higher runs first.
    pub priority: i32,
}

/// Batch-wide configuration.
#[derive(Debug, Clone)]
pub struct BatchMigrationConfig {
    pub tasks: Vec<VMMigrationTask>,
    pub output_dir: String,
    pub max_parallel: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub continue_on_error: bool,
    pub cloud_storage: Option<CloudStorageConfig>,
}

/// Outcome of one task within a batch.
#[derive(Debug, Clone)]
pub struct BatchTaskResult {
    pub vm_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Seam for the per-VM migration orchestrator; the batch
/// orchestrator doesn't know or care how a single migration is composed,
/// only how to retry and bound it.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn run(&self, task: &VMMigrationTask, output_dir: &str) -> Result<(), String>;
}

/// Runs a [`BatchMigrationConfig`] to completion against a
/// [`MigrationRunner`], honoring priority order, bounded concurrency,
/// per-task retry, and `continue_on_error`.
pub struct BatchOrchestrator<R: MigrationRunner + 'static> {
    runner: Arc<R>,
}

impl<R: MigrationRunner + 'static> BatchOrchestrator<R> {
    pub fn new(runner: R) -> Self {
        Self { runner: Arc::new(runner) }
    }

    pub async fn run(&self, config: &BatchMigrationConfig) -> Vec<BatchTaskResult> {
        let mut tasks = config.tasks.clone();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        let semaphore = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        let aborted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let aborted = aborted.clone();
            let output_dir = config.output_dir.clone();
            let max_retries = config.max_retries;
            let retry_delay = config.retry_delay;
            let continue_on_error = config.continue_on_error;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                if aborted.load(std::sync::atomic::Ordering::SeqCst) {
                    return BatchTaskResult {
                        vm_name: task.vm_name.clone(),
                        success: false,
                        error: Some("aborted: a prior task failed and continue_on_error is false".to_string()),
                        attempts: 0,
                    };
                }

                let mut attempt = 0;
                let result = loop {
                    attempt += 1;
                    match runner.run(&task, &output_dir).await {
                        Ok(()) => break Ok(()),
                        Err(e) if attempt <= max_retries => {
                            tracing::warn!(vm = %task.vm_name, attempt, error = %e, "migration attempt failed, retrying");
                            tokio::time::sleep(retry_delay).await;
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                };

                if result.is_err() && !continue_on_error {
                    aborted.store(true, std::sync::atomic::Ordering::SeqCst);
                }

                BatchTaskResult {
                    vm_name: task.vm_name,
                    success: result.is_ok(),
                    error: result.err(),
                    attempts: attempt,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(BatchTaskResult {
                    vm_name: "<unknown>".to_string(),
                    success: false,
                    error: Some(format!("migration task panicked: {join_err}")),
                    attempts: 0,
                }),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockRunner {
        fail_vm: Option<String>,
        fail_until_attempt: u32,
        attempts_by_vm: Mutex<std::collections::HashMap<String, u32>>,
        order: Mutex<Vec<String>>,
        concurrent: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MigrationRunner for MockRunner {
        async fn run(&self, task: &VMMigrationTask, _output_dir: &str) -> Result<(), String> {
            self.order.lock().unwrap().push(task.vm_name.clone());
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let mut attempts = self.attempts_by_vm.lock().unwrap();
            let count = attempts.entry(task.vm_name.clone()).or_insert(0);
            *count += 1;

            if self.fail_vm.as_deref() == Some(task.vm_name.as_str()) && *count <= self.fail_until_attempt {
                return Err("transient failure".to_string());
            }
            Ok(())
        }
    }

    fn task(name: &str, priority: i32) -> VMMigrationTask {
        VMMigrationTask {
            vm_name: name.to_string(),
            vm_path: format!("/vms/{name}"),
            provider: vmforge_types::Provider::Vsphere,
            priority,
        }
    }

    fn config(tasks: Vec<VMMigrationTask>) -> BatchMigrationConfig {
        BatchMigrationConfig {
            tasks,
            output_dir: "/exports".to_string(),
            max_parallel: 4,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            continue_on_error: true,
            cloud_storage: None,
        }
    }

    #[tokio::test]
    async fn all_tasks_succeed() {
        let runner = MockRunner {
            fail_vm: None,
            fail_until_attempt: 0,
            attempts_by_vm: Mutex::new(Default::default()),
            order: Mutex::new(Vec::new()),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let orchestrator = BatchOrchestrator::new(runner);
        let results = orchestrator.run(&config(vec![task("a", 1), task("b", 2)])).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_max_parallel() {
        let max_observed = Arc::new(AtomicUsize::new(0));
        let runner = MockRunner {
            fail_vm: None,
            fail_until_attempt: 0,
            attempts_by_vm: Mutex::new(Default::default()),
            order: Mutex::new(Vec::new()),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: max_observed.clone(),
        };
        let mut cfg = config((0..8).map(|i| task(&format!("vm{i}"), 0)).collect());
        cfg.max_parallel = 2;
        let orchestrator = BatchOrchestrator::new(runner);
        orchestrator.run(&cfg).await;
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn retries_transient_failure_before_succeeding() {
        let runner = MockRunner {
            fail_vm: Some("a".to_string()),
            fail_until_attempt: 1,
            attempts_by_vm: Mutex::new(Default::default()),
            order: Mutex::new(Vec::new()),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let orchestrator = BatchOrchestrator::new(runner);
        let results = orchestrator.run(&config(vec![task("a", 1)])).await;
        assert!(results[0].success);
        assert_eq!(results[0].attempts, 2);
    }

    #[tokio::test]
    async fn continue_on_error_false_aborts_remaining_pending_tasks() {
        let runner = MockRunner {
            fail_vm: Some("a".to_string()),
            fail_until_attempt: 99,
            attempts_by_vm: Mutex::new(Default::default()),
            order: Mutex::new(Vec::new()),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let mut cfg = config(vec![task("a", 10), task("b", 1)]);
        cfg.continue_on_error = false;
        cfg.max_retries = 0;
        cfg.max_parallel = 1;
        let orchestrator = BatchOrchestrator::new(runner);
        let results = orchestrator.run(&cfg).await;

        let a = results.iter().find(|r| r.vm_name == "a").unwrap();
        assert!(!a.success);
        let b = results.iter().find(|r| r.vm_name == "b").unwrap();
        assert!(!b.success);
    }
}
