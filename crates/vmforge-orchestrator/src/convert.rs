//! Post-export pipeline and upload wiring.
//!
//! The convert stage shells out through [`vmforge_pipeline`] exactly the
//! way that crate's doc comment describes the executor state machine; this
//! module only supplies the manifest-derived inputs (converter path,
//! domain params, output config) and folds an optional libvirt-define step
//! in afterward. Upload is a second, independent step: the converted disk
//! is handed to whatever [`vmforge_storage::StorageBackend`] the job's
//! destination config resolves to.
//!
//! [`Hyper2KvmConfig::libvirt_integration`]: vmforge_pipeline::Hyper2KvmConfig

use std::path::Path;

use vmforge_manifest::{ArtifactManifest, OutputConfig};
use vmforge_pipeline::{self as pipeline, ExecutionMode, Hyper2KvmConfig, PipelineResult, Reporter};
use vmforge_storage::{CloudStorageConfig, StorageBackend};

use crate::error::OrchestratorError;

/// Run the convert stage, then the optional libvirt-define step, for one
/// manifest. Returns the pipeline's recorded output path so the caller can
/// hand it to the upload step.
pub(crate) async fn run_pipeline(
    config: &Hyper2KvmConfig,
    manifest: &ArtifactManifest,
    output_config: &OutputConfig,
    reporter: &dyn Reporter,
) -> Result<PipelineResult, OrchestratorError> {
    if !config.enabled {
        return Err(OrchestratorError::Pipeline(vmforge_pipeline::PipelineError::Disabled));
    }

    let mode = pipeline::choose_mode(config, reporter);
    let mut result = match mode {
        ExecutionMode::Daemon => {
            let vm_name = manifest
                .source
                .as_ref()
                .and_then(|s| s.vm_name.clone())
                .unwrap_or_else(|| "vm".to_string());
            pipeline::run_daemon(config, &vm_name, reporter).await?
        }
        ExecutionMode::Direct => {
            let converter_path = pipeline::resolve_converter_path(config.hyper2kvm_path.as_deref())?;
            let converter_path = converter_path.clone();
            let config = config.clone();
            let manifest = manifest.clone();
            let output_config = output_config.clone();
            tokio::task::spawn_blocking(move || {
                struct NullReporter;
                impl Reporter for NullReporter {
                    fn info(&self, _: &str) {}
                    fn warn(&self, _: &str) {}
                    fn error(&self, _: &str) {}
                }
                pipeline::run_direct(&converter_path, &config, &manifest, &output_config, &NullReporter)
            })
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))??
        }
    };

    if config.libvirt_integration {
        if manifest.boot_disk().is_none() {
            reporter.warn("libvirt_integration set but the manifest has no boot disk; skipping define");
        } else if let Some(output_path) = result.output_path.clone() {
            let vm = manifest.vm.clone().unwrap_or_default();
            let params = vmforge_pipeline::DomainParams {
                name: manifest
                    .source
                    .as_ref()
                    .and_then(|s| s.vm_name.clone())
                    .unwrap_or_else(|| "vm".to_string()),
                memory_kib: (vm.memory_gb.unwrap_or(1.0) * 1024.0 * 1024.0) as u64,
                vcpu: vm.cpu_count.unwrap_or(1).max(1) as u32,
                disk_path: output_path,
                disk_format: "qcow2".to_string(),
                firmware_uefi: matches!(vm.firmware, vmforge_manifest::Firmware::Uefi),
                network_bridge: "br0".to_string(),
                mac_address: manifest.nics.first().and_then(|n| n.mac.clone()),
            };
            pipeline::apply_libvirt_define(config, &params, &mut result, reporter);
        } else {
            reporter.warn("libvirt_integration set but the converter reported no output path; skipping define");
        }
    }

    Ok(result)
}

/// Upload the converted disk at `local_path` to the configured backend, if
/// any. `None` cloud storage config means "stop at the local converted
/// artifact" — a valid, complete outcome.
pub(crate) async fn upload_if_configured(
    local_path: &Path,
    relative_dest: &str,
    cloud_storage: Option<&CloudStorageConfig>,
) -> Result<Option<String>, OrchestratorError> {
    let Some(config) = cloud_storage else {
        return Ok(None);
    };

    let backend = vmforge_storage::build_storage_backend(config).map_err(|e| OrchestratorError::Upload(e.to_string()))?;
    let full_path = config.full_path(relative_dest);
    let local_path = local_path.to_path_buf();
    let relative_dest = relative_dest.to_string();

    tokio::task::spawn_blocking(move || -> Result<String, OrchestratorError> {
        let data = std::fs::read(&local_path).map_err(OrchestratorError::Io)?;
        upload_bytes(backend.as_ref(), &relative_dest, &data)?;
        Ok(full_path)
    })
    .await
    .map_err(|e| OrchestratorError::Join(e.to_string()))?
    .map(Some)
}

fn upload_bytes(backend: &dyn StorageBackend, relative_dest: &str, data: &[u8]) -> Result<(), OrchestratorError> {
    backend.write(relative_dest, data).map_err(|e| OrchestratorError::Upload(e.to_string()))
}
