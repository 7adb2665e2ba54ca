//! Conversion coordinator: wraps the external disk-format converter
//! behind a small trait and fans per-disk work out under a semaphore,
//! generalizing the bounded-parallelism shape `engine_parallel.rs` used for
//! per-package publish tasks to per-disk conversion tasks.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Per-task conversion options passed to [`Converter::convert`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvertOptions {
    pub verbose: bool,
    pub dry_run: bool,
}

/// Outcome of converting a single disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub output_path: String,
    pub log: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("converter failed for {manifest_path}: {message}")]
    Failed { manifest_path: String, message: String },
    #[error("converter validation failed: {0}")]
    Invalid(String),
}

/// The abstract downstream converter (disk format conversion, driver
/// injection). Implementations wrap a subprocess invocation or an
/// in-process converter; vmforge's core only depends on this seam.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, manifest_path: &str, opts: &ConvertOptions) -> Result<ConversionResult, ConvertError>;
    fn get_version(&self) -> String;
    fn validate(&self) -> Result<(), ConvertError>;
}

/// One disk queued for conversion by the parallel coordinator.
#[derive(Debug, Clone)]
pub struct DiskConversionTask {
    pub disk_index: usize,
    pub manifest_path: String,
    pub options: ConvertOptions,
}

/// Per-task outcome as returned by [`ParallelCoordinator::run`].
#[derive(Debug)]
pub struct TaskOutcome {
    pub disk_index: usize,
    pub result: Option<ConversionResult>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Aggregate statistics over a batch of [`TaskOutcome`]s.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_duration_ms: f64,
}

impl ConversionStats {
    pub fn compute(outcomes: &[TaskOutcome]) -> Self {
        if outcomes.is_empty() {
            return Self::default();
        }
        let total = outcomes.len();
        let successful = outcomes.iter().filter(|o| o.error.is_none()).count();
        let failed = total - successful;
        let durations_ms: Vec<u64> = outcomes.iter().map(|o| o.duration.as_millis() as u64).collect();
        let min_duration_ms = *durations_ms.iter().min().unwrap_or(&0);
        let max_duration_ms = *durations_ms.iter().max().unwrap_or(&0);
        let avg_duration_ms = durations_ms.iter().sum::<u64>() as f64 / total as f64;
        Self {
            total,
            successful,
            failed,
            min_duration_ms,
            max_duration_ms,
            avg_duration_ms,
        }
    }
}

/// Runs a list of [`DiskConversionTask`]s concurrently, bounded by
/// `max_parallel` (semaphore), collecting one [`TaskOutcome`] per task.
pub struct ParallelCoordinator<C: Converter + 'static> {
    converter: std::sync::Arc<C>,
    max_parallel: usize,
}

impl<C: Converter + 'static> ParallelCoordinator<C> {
    pub fn new(converter: C, max_parallel: usize) -> Self {
        Self {
            converter: std::sync::Arc::new(converter),
            max_parallel: max_parallel.max(1),
        }
    }

    pub async fn run(&self, tasks: Vec<DiskConversionTask>) -> Vec<TaskOutcome> {
        let semaphore = std::sync::Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let converter = self.converter.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let start = Instant::now();
                let outcome = converter.convert(&task.manifest_path, &task.options).await;
                let duration = start.elapsed();
                match outcome {
                    Ok(result) => TaskOutcome {
                        disk_index: task.disk_index,
                        result: Some(result),
                        error: None,
                        duration,
                    },
                    Err(e) => TaskOutcome {
                        disk_index: task.disk_index,
                        result: None,
                        error: Some(e.to_string()),
                        duration,
                    },
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(TaskOutcome {
                    disk_index: usize::MAX,
                    result: None,
                    error: Some(format!("conversion task panicked: {join_err}")),
                    duration: Duration::ZERO,
                }),
            }
        }
        outcomes.sort_by_key(|o| o.disk_index);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockConverter {
        fail_index: Option<usize>,
        concurrent: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Converter for MockConverter {
        async fn convert(&self, manifest_path: &str, _opts: &ConvertOptions) -> Result<ConversionResult, ConvertError> {
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if Some(manifest_path.parse::<usize>().unwrap_or(usize::MAX)) == self.fail_index {
                return Err(ConvertError::Failed {
                    manifest_path: manifest_path.to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(ConversionResult {
                output_path: format!("/out/{manifest_path}.qcow2"),
                log: vec!["done".to_string()],
            })
        }

        fn get_version(&self) -> String {
            "mock-1.0".to_string()
        }

        fn validate(&self) -> Result<(), ConvertError> {
            Ok(())
        }
    }

    fn tasks(n: usize) -> Vec<DiskConversionTask> {
        (0..n)
            .map(|i| DiskConversionTask {
                disk_index: i,
                manifest_path: i.to_string(),
                options: ConvertOptions::default(),
            })
            .collect()
    }

    #[tokio::test]
    async fn runs_all_tasks_and_preserves_order() {
        let converter = MockConverter {
            fail_index: None,
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let coordinator = ParallelCoordinator::new(converter, 4);
        let outcomes = coordinator.run(tasks(5)).await;
        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.disk_index, i);
            assert!(outcome.error.is_none());
        }
    }

    #[tokio::test]
    async fn bounds_concurrency_by_max_parallel() {
        let max_observed = Arc::new(AtomicUsize::new(0));
        let converter = MockConverter {
            fail_index: None,
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: max_observed.clone(),
        };
        let coordinator = ParallelCoordinator::new(converter, 2);
        coordinator.run(tasks(10)).await;
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn statistics_reflect_failures() {
        let converter = MockConverter {
            fail_index: Some(2),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let coordinator = ParallelCoordinator::new(converter, 4);
        let outcomes = coordinator.run(tasks(4)).await;
        let stats = ConversionStats::compute(&outcomes);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn stats_of_empty_batch_are_zero() {
        let stats = ConversionStats::compute(&[]);
        assert_eq!(stats, ConversionStats::default());
    }
}
