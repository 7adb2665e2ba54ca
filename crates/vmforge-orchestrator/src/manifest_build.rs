//! Builds an [`ArtifactManifest`] from a completed export. Every disk's checksum is computed independently here via
//! [`vmforge_manifest::ManifestBuilder::add_disk_with_checksum`] rather
//! than trusted from the transfer checkpoint, so the manifest's contract
//! ("every disk entry's checksum was computed from the file on disk") holds
//! regardless of how the bytes got there.

use std::path::Path;

use vmforge_manifest::{ManifestBuilder, ManifestMetadata, ArtifactManifest};

use crate::error::OrchestratorError;
use crate::exporter::{ExportFile, ExportedVmInfo};

pub(crate) fn build_manifest(
    job_id: &str,
    output_dir: &Path,
    files: &[ExportFile],
    vm_info: &ExportedVmInfo,
) -> Result<ArtifactManifest, OrchestratorError> {
    let mut builder = ManifestBuilder::new();

    for (index, file) in files.iter().enumerate() {
        let disk_id = disk_id_for(&file.relative_path, index);
        let local_path = output_dir.join(&file.relative_path);
        builder = builder
            .add_disk_with_checksum(disk_id, file.source_format, local_path.to_string_lossy(), file.disk_type)
            .boot_order_hint(file.boot_order_hint);
    }

    builder = builder
        .source(vm_info.source.clone())
        .vm(vm_info.vm.clone())
        .metadata(ManifestMetadata {
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            job_id: Some(job_id.to_string()),
            created_at: Some(chrono::Utc::now()),
            tags: Default::default(),
        });
    for nic in &vm_info.nics {
        builder = builder.nic(nic.clone());
    }

    builder.build().map_err(OrchestratorError::Manifest)
}

/// `disk-0`, `disk-1`, ... unless the source filename (sans extension) is
/// already a valid disk id, in which case that is kept for readability.
fn disk_id_for(relative_path: &str, index: usize) -> String {
    let stem = Path::new(relative_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let candidate = stem.replace(['.', ' '], "-");
    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        candidate
    } else {
        format!("disk-{index}")
    }
}
