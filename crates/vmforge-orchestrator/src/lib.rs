//! Migration orchestrator: the facade that composes export,
//! manifest, checkpointed/throttled transfer, the post-export pipeline,
//! upload, progress, metrics, audit and webhooks around one VM.
//!
//! [`MigrationOrchestrator`] implements both seams the rest of the
//! workspace depends on instead of depending on this crate: the job
//! engine's [`vmforge_engine::MigrationExecutor`] (one job at a time, with
//! the engine's retry loop around it) and the batch orchestrator's
//! [`vmforge_batch::MigrationRunner`] (one task within a fan-out run). The
//! sequence is the same either way —
//! `RecordStart → Export → BuildManifest → Convert → Upload → RecordResult`
//! — only the caller and the retry policy differ.

mod convert;
mod error;
mod exporter;
mod manifest_build;
mod transfer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vmforge_audit::AuditLog;
use vmforge_batch::{MigrationRunner, VMMigrationTask};
use vmforge_engine::{ExecutionOutcome, MigrationExecutor};
use vmforge_metrics::Metrics;
use vmforge_pipeline::{Hyper2KvmConfig, Reporter, TracingReporter};
use vmforge_progress::Tracker;
use vmforge_storage::CloudStorageConfig;
use vmforge_types::{Job, Provider, WebhookEvent, WebhookEventType};
use vmforge_webhook::Manager as WebhookManager;

pub use error::OrchestratorError;
pub use exporter::{ExportFile, ExportError, Exporter, ExportedVmInfo};
pub use transfer::TransferConfig;

/// Tunables for one orchestrator instance, shared across every job it
/// runs. Per-job specifics (vm path, output dir, provider) come from the
/// [`Job`]/[`VMMigrationTask`] passed to `execute`/`run`.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub transfer: TransferConfig,
    /// Template applied to every job; `manifest_path` is overwritten per
    /// run with that job's manifest location.
    pub pipeline: Hyper2KvmConfig,
    pub cloud_storage: Option<CloudStorageConfig>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            pipeline: Hyper2KvmConfig::default(),
            cloud_storage: None,
        }
    }
}

/// Composes the single-VM migration sequence out of every other
/// vmforge crate. Exporters are registered per [`Provider`]; a job whose
/// provider has none registered fails with [`OrchestratorError::NoExporter`].
pub struct MigrationOrchestrator {
    exporters: HashMap<Provider, Arc<dyn Exporter>>,
    tracker: Arc<Tracker>,
    metrics: Arc<Metrics>,
    audit: Arc<AuditLog>,
    webhooks: Arc<WebhookManager>,
    config: MigrationConfig,
    reporter: Arc<dyn Reporter>,
}

impl MigrationOrchestrator {
    pub fn new(
        tracker: Arc<Tracker>,
        metrics: Arc<Metrics>,
        audit: Arc<AuditLog>,
        webhooks: Arc<WebhookManager>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            exporters: HashMap::new(),
            tracker,
            metrics,
            audit,
            webhooks,
            config,
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_exporter(mut self, provider: Provider, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.insert(provider, exporter);
        self
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Run the full single-VM sequence: export, manifest, convert, upload,
    /// recording progress/metrics/audit/webhooks at every stage.
    pub async fn run_migration(
        &self,
        task_id: &str,
        vm_name: &str,
        vm_path: &str,
        provider: Provider,
        output_dir: &str,
        user: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, OrchestratorError> {
        let started = Instant::now();
        self.tracker.start_task(task_id, vm_name, provider, 4);
        let _ = self.audit.log_migration_start(task_id, vm_name, provider, user);
        self.metrics.record_migration_start(provider);
        self.notify(task_id, vm_name, provider, WebhookEventType::Start, "migration started").await;

        let result = self.run_migration_inner(task_id, vm_name, vm_path, provider, output_dir, cancel).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                let _ = self.tracker.complete_task(task_id);
                let _ = self.audit.log_migration_complete(task_id, vm_name, provider, duration_ms);
                self.metrics.record_migration_success();
                self.metrics.record_stage_duration("migration", duration_ms);
                self.notify(task_id, vm_name, provider, WebhookEventType::Complete, "migration completed").await;
            }
            Err(e) => {
                let _ = self.tracker.fail_task(task_id, e.to_string());
                let _ = self.audit.log_migration_fail(task_id, vm_name, provider, &e.to_string());
                self.metrics.record_migration_failure();
                self.notify(task_id, vm_name, provider, WebhookEventType::Error, &e.to_string()).await;
            }
        }
        result
    }

    async fn run_migration_inner(
        &self,
        task_id: &str,
        vm_name: &str,
        vm_path: &str,
        provider: Provider,
        output_dir: &str,
        cancel: CancellationToken,
    ) -> Result<PathBuf, OrchestratorError> {
        let exporter = self
            .exporters
            .get(&provider)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoExporter(provider.to_string()))?;

        let output_dir = PathBuf::from(output_dir);
        tokio::fs::create_dir_all(&output_dir).await.map_err(OrchestratorError::Io)?;

        let _ = self.tracker.set_stage(task_id, "export", 0);
        let files = exporter.list_files(vm_path).await.map_err(OrchestratorError::Export)?;
        let vm_info = exporter.vm_info(vm_path).await.map_err(OrchestratorError::Export)?;

        let checkpoint_path = transfer::checkpoint_path_for(&output_dir, vm_name);
        let mut checkpoint = transfer::load_or_create_checkpoint(
            &checkpoint_path,
            vm_name,
            &provider.to_string(),
            "qcow2",
            &output_dir.to_string_lossy(),
            &files,
        )?;
        checkpoint.save(&checkpoint_path)?;
        let checkpoint = Arc::new(std::sync::Mutex::new(checkpoint));

        transfer::download_all(
            exporter.as_ref(),
            vm_path,
            &files,
            &output_dir,
            &checkpoint_path,
            &checkpoint,
            &self.config.transfer,
            &self.tracker,
            task_id,
            cancel.clone(),
        )
        .await?;

        let total_bytes: u64 = files.iter().map(|f| f.total_bytes).sum();
        self.metrics.add_bytes_exported(total_bytes);

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let _ = self.tracker.set_stage(task_id, "manifest", 1);
        let manifest = manifest_build::build_manifest(task_id, &output_dir, &files, &vm_info)?;
        let manifest_path = output_dir.join("manifest.json");
        vmforge_manifest::write_to_file(&manifest, &manifest_path)?;

        let _ = self.tracker.set_stage(task_id, "convert", 2);
        let mut pipeline_config = self.config.pipeline.clone();
        pipeline_config.manifest_path = manifest_path.to_string_lossy().into_owned();
        let pipeline_result = convert::run_pipeline(
            &pipeline_config,
            &manifest,
            &vmforge_manifest::OutputConfig {
                directory: Some(output_dir.to_string_lossy().into_owned()),
                format: Some("qcow2".to_string()),
                filename: None,
            },
            self.reporter.as_ref(),
        )
        .await?;
        if let Some(converted_bytes) = pipeline_result
            .output_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
        {
            self.metrics.add_bytes_converted(converted_bytes);
        }

        let _ = self.tracker.set_stage(task_id, "upload", 3);
        if let Some(local_output) = pipeline_result.output_path.as_ref() {
            let relative_dest = format!("{vm_name}/{}", file_name_of(local_output));
            if let Some(uploaded_bytes) = std::fs::metadata(local_output).ok().map(|m| m.len()) {
                if convert::upload_if_configured(std::path::Path::new(local_output), &relative_dest, self.config.cloud_storage.as_ref())
                    .await?
                    .is_some()
                {
                    self.metrics.add_bytes_uploaded(uploaded_bytes);
                }
            }
        }

        vmforge_checkpoint::Checkpoint::delete(&checkpoint_path)?;
        Ok(manifest_path)
    }

    async fn notify(&self, task_id: &str, vm_name: &str, provider: Provider, event_type: WebhookEventType, message: &str) {
        let event = WebhookEvent {
            event_type,
            task_id: task_id.to_string(),
            vm_name: vm_name.to_string(),
            provider,
            status: format!("{event_type:?}").to_lowercase(),
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
            details: Default::default(),
        };
        self.webhooks.notify_all(event).await;
    }
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[async_trait]
impl MigrationExecutor for MigrationOrchestrator {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome {
        let result = self
            .run_migration(&job.id, &job.vm_name, &job.vm_path, job.provider, &job.output_dir, job.user.as_deref(), cancel)
            .await;
        match result {
            Ok(_) => ExecutionOutcome::Completed,
            Err(OrchestratorError::Cancelled) => ExecutionOutcome::Cancelled,
            Err(e) => ExecutionOutcome::Failed { transient: e.is_transient(), message: e.to_string() },
        }
    }
}

#[async_trait]
impl MigrationRunner for MigrationOrchestrator {
    async fn run(&self, task: &VMMigrationTask, output_dir: &str) -> Result<(), String> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.run_migration(
            &job_id,
            &task.vm_name,
            &task.vm_path,
            task.provider,
            output_dir,
            None,
            CancellationToken::new(),
        )
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vmforge_manifest::{DiskType, SourceFormat};

    struct InMemoryExporter {
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl Exporter for InMemoryExporter {
        async fn list_files(&self, _vm_path: &str) -> Result<Vec<ExportFile>, ExportError> {
            Ok(vec![ExportFile {
                relative_path: "disk-0.raw".to_string(),
                source_url: None,
                total_bytes: self.bytes.len() as u64,
                source_format: SourceFormat::Raw,
                disk_type: DiskType::Boot,
                boot_order_hint: 0,
            }])
        }

        async fn vm_info(&self, _vm_path: &str) -> Result<ExportedVmInfo, ExportError> {
            Ok(ExportedVmInfo::default())
        }

        async fn open_reader(&self, _vm_path: &str, _file: &ExportFile, offset: u64) -> Result<Box<dyn std::io::Read + Send>, ExportError> {
            let remaining = self.bytes[offset as usize..].to_vec();
            Ok(Box::new(Cursor::new(remaining)))
        }
    }

    fn test_orchestrator(cloud_storage: Option<CloudStorageConfig>) -> MigrationOrchestrator {
        let tracker = Arc::new(Tracker::new());
        let metrics = Arc::new(Metrics::new());
        let audit_path = tempfile::tempdir().unwrap().keep().join("audit.log");
        let audit = Arc::new(AuditLog::new(audit_path));
        let webhooks = Arc::new(WebhookManager::new(Vec::new()));
        let mut pipeline = Hyper2KvmConfig::default();
        pipeline.enabled = false;
        let config = MigrationConfig { transfer: TransferConfig::default(), pipeline, cloud_storage };
        MigrationOrchestrator::new(tracker, metrics, audit, webhooks, config)
            .with_exporter(Provider::Vsphere, Arc::new(InMemoryExporter { bytes: vec![7u8; 4096] }))
    }

    #[tokio::test]
    async fn unregistered_provider_fails_fast() {
        let orchestrator = test_orchestrator(None);
        let dir = tempfile::tempdir().unwrap();
        let outcome = orchestrator
            .run_migration("t1", "vm1", "/vms/vm1", Provider::Ec2, &dir.path().to_string_lossy(), None, CancellationToken::new())
            .await;
        assert!(matches!(outcome, Err(OrchestratorError::NoExporter(_))));
    }

    #[tokio::test]
    async fn pipeline_disabled_surfaces_as_error_and_is_not_transient() {
        let orchestrator = test_orchestrator(None);
        let dir = tempfile::tempdir().unwrap();
        let outcome = orchestrator
            .run_migration("t2", "vm1", "/vms/vm1", Provider::Vsphere, &dir.path().to_string_lossy(), None, CancellationToken::new())
            .await;
        let err = outcome.unwrap_err();
        assert!(!err.is_transient());

        // Export itself must have completed and left a manifest behind
        // even though the pipeline stage failed.
        assert!(dir.path().join("manifest.json").exists());
        assert!(dir.path().join("disk-0.raw").exists());
    }

    #[tokio::test]
    async fn cancellation_before_export_starts_is_reported() {
        let orchestrator = test_orchestrator(None);
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = orchestrator
            .run_migration("t3", "vm1", "/vms/vm1", Provider::Vsphere, &dir.path().to_string_lossy(), None, cancel)
            .await;
        assert!(matches!(outcome, Err(OrchestratorError::Cancelled)));
    }

    #[test]
    fn config_defaults_disable_nothing_unexpected() {
        let config = MigrationConfig::default();
        assert!(config.pipeline.enabled);
        assert!(config.cloud_storage.is_none());
    }
}
