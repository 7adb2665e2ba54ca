//! Artifact Manifest v1.0 — the typed, versioned contract between the
//! exporter (this crate's producer, the job engine) and the downstream
//! converter.
//!
//! # Example
//!
//! ```no_run
//! use vmforge_manifest::{ManifestBuilder, DiskType, SourceFormat};
//!
//! let manifest = ManifestBuilder::new()
//!     .add_disk("disk-0", SourceFormat::Vmdk, "/exports/vm1/disk-0.vmdk", 1024, DiskType::Boot)
//!     .build()
//!     .expect("valid manifest");
//!
//! assert_eq!(manifest.disks.len(), 1);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current manifest schema version. Rejecting any other value is part of
/// the validator contract.
pub const MANIFEST_VERSION: &str = "1.0";

/// Errors raised while building, validating or reading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("unsupported manifest_version {0:?}, expected {MANIFEST_VERSION:?}")]
    UnsupportedVersion(String),
    #[error("manifest has no disks")]
    NoDisks,
    #[error("disk id {0:?} does not match ^[A-Za-z0-9_-]+$")]
    InvalidDiskId(String),
    #[error("duplicate disk id {0:?}")]
    DuplicateDiskId(String),
    #[error("disk {id:?} local_path {path:?} does not exist")]
    MissingLocalPath { id: String, path: String },
    #[error("disk {id:?} has malformed checksum {checksum:?}")]
    MalformedChecksum { id: String, checksum: String },
    #[error("disk {id:?} has negative or out-of-range field: {message}")]
    InvalidDiskField { id: String, message: String },
    #[error("vm cpu_count or memory_gb is negative")]
    InvalidVmMetadata,
    #[error("firmware {0:?} is not one of bios, uefi, unknown")]
    InvalidFirmware(String),
    #[error("builder accumulated errors: {0:?}")]
    BuilderErrors(Vec<String>),
    #[error("checksum mismatch for disk {id:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("io error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("codec error: {0}")]
    Codec(String),
}

/// Disk image format carried on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Vmdk,
    Qcow2,
    Raw,
    Vhd,
    Vhdx,
    Vdi,
}

/// Disk role used to pick the boot disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Boot,
    Data,
    #[default]
    Unknown,
}

/// Guest firmware type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Uefi,
    #[default]
    Unknown,
}

/// One exported disk image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub id: String,
    pub source_format: SourceFormat,
    pub bytes: u64,
    pub local_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub boot_order_hint: u32,
    #[serde(default)]
    pub disk_type: DiskType,
}

/// Source hypervisor metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Guest VM metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub secure_boot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// One virtual NIC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// A stage-tagged warning raised during export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Manifest-level bookkeeping metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Per-stage pipeline options, keyed by stage tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default)]
    pub retry: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout_s() -> u64 {
    600
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            options: BTreeMap::new(),
            timeout_s: default_timeout_s(),
            retry: 0,
        }
    }
}

/// Known pipeline stage tags.
pub const STAGE_TAGS: &[&str] = &["inspect", "fix", "convert", "validate", "optimize", "compress"];

/// Post-export pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_convert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_convert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

impl PipelineConfig {
    /// At least one stage must be enabled.
    pub fn has_enabled_stage(&self) -> bool {
        self.stages.values().any(|s| s.enabled)
    }
}

/// Output directory/format/filename configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Dry-run/verbose/report toggles passed through to the converter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub report_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

/// The Artifact Manifest v1.0 document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub manifest_version: String,
    pub disks: Vec<DiskEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmMetadata>,
    #[serde(default)]
    pub nics: Vec<NicEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub warnings: Vec<ManifestWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ManifestMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeOptions>,
    /// Any field not named above is round-tripped here so the converter
    /// sees forward-compatible additions.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl ArtifactManifest {
    /// The boot disk per the Glossary: `disk_type=boot` with the smallest
    /// `boot_order_hint` wins.
    pub fn boot_disk(&self) -> Option<&DiskEntry> {
        self.disks
            .iter()
            .filter(|d| d.disk_type == DiskType::Boot)
            .min_by_key(|d| d.boot_order_hint)
    }
}

fn disk_id_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn checksum_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^sha256:[a-f0-9]{64}$").unwrap())
}

/// Validate a manifest against every structural and field-level invariant.
/// Read-only and idempotent.
pub fn validate(manifest: &ArtifactManifest) -> Result<(), ManifestError> {
    if manifest.manifest_version != MANIFEST_VERSION {
        return Err(ManifestError::UnsupportedVersion(manifest.manifest_version.clone()));
    }
    if manifest.disks.is_empty() {
        return Err(ManifestError::NoDisks);
    }

    let mut seen = std::collections::HashSet::new();
    for disk in &manifest.disks {
        if !disk_id_regex().is_match(&disk.id) {
            return Err(ManifestError::InvalidDiskId(disk.id.clone()));
        }
        if !seen.insert(disk.id.clone()) {
            return Err(ManifestError::DuplicateDiskId(disk.id.clone()));
        }
        if !Path::new(&disk.local_path).exists() {
            return Err(ManifestError::MissingLocalPath {
                id: disk.id.clone(),
                path: disk.local_path.clone(),
            });
        }
        if let Some(checksum) = &disk.checksum {
            if !checksum_regex().is_match(checksum) {
                return Err(ManifestError::MalformedChecksum {
                    id: disk.id.clone(),
                    checksum: checksum.clone(),
                });
            }
        }
    }

    if let Some(vm) = &manifest.vm {
        if vm.cpu_count.is_some_and(|c| c < 0) || vm.memory_gb.is_some_and(|m| m < 0.0) {
            return Err(ManifestError::InvalidVmMetadata);
        }
    }

    Ok(())
}

/// Fluent, error-accumulating builder. Unlike `validate`, mutators
/// never short-circuit — callers see every problem at `build()` time.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    disks: Vec<DiskEntry>,
    source: Option<SourceMetadata>,
    vm: Option<VmMetadata>,
    nics: Vec<NicEntry>,
    notes: Option<String>,
    warnings: Vec<ManifestWarning>,
    metadata: Option<ManifestMetadata>,
    pipeline: Option<PipelineConfig>,
    output: Option<OutputConfig>,
    runtime: Option<RuntimeOptions>,
    errors: Vec<String>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(
        mut self,
        id: impl Into<String>,
        format: SourceFormat,
        local_path: impl Into<String>,
        bytes: u64,
        disk_type: DiskType,
    ) -> Self {
        let id = id.into();
        if !disk_id_regex().is_match(&id) {
            self.errors.push(format!("invalid disk id: {id}"));
        }
        self.disks.push(DiskEntry {
            id,
            source_format: format,
            bytes,
            local_path: local_path.into(),
            checksum: None,
            boot_order_hint: 0,
            disk_type,
        });
        self
    }

    /// Add a disk and compute its checksum by streaming the file through
    /// SHA-256, writing `"sha256:" + hex` into the record.
    pub fn add_disk_with_checksum(
        mut self,
        id: impl Into<String>,
        format: SourceFormat,
        local_path: impl Into<String>,
        disk_type: DiskType,
    ) -> Self {
        let id = id.into();
        let path = local_path.into();
        match hash_file(Path::new(&path)) {
            Ok((bytes, digest)) => {
                self.disks.push(DiskEntry {
                    id,
                    source_format: format,
                    bytes,
                    local_path: path,
                    checksum: Some(format!("sha256:{digest}")),
                    boot_order_hint: 0,
                    disk_type,
                });
            }
            Err(e) => self.errors.push(format!("failed to hash {path}: {e}")),
        }
        self
    }

    pub fn boot_order_hint(mut self, hint: u32) -> Self {
        if let Some(last) = self.disks.last_mut() {
            last.boot_order_hint = hint;
        } else {
            self.errors.push("boot_order_hint called before add_disk".to_string());
        }
        self
    }

    pub fn source(mut self, source: SourceMetadata) -> Self {
        self.source = Some(source);
        self
    }

    pub fn vm(mut self, vm: VmMetadata) -> Self {
        self.vm = Some(vm);
        self
    }

    pub fn nic(mut self, nic: NicEntry) -> Self {
        self.nics.push(nic);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn warning(mut self, stage: impl Into<String>, message: impl Into<String>) -> Self {
        self.warnings.push(ManifestWarning {
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
        self
    }

    pub fn metadata(mut self, metadata: ManifestMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn output(mut self, output: OutputConfig) -> Self {
        self.output = Some(output);
        self
    }

    pub fn runtime(mut self, runtime: RuntimeOptions) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Finish building. Fails if the accumulated error list is non-empty
    /// or no disks were added.
    pub fn build(self) -> Result<ArtifactManifest, ManifestError> {
        let mut errors = self.errors;
        if self.disks.is_empty() {
            errors.push("no disks added".to_string());
        }
        if !errors.is_empty() {
            return Err(ManifestError::BuilderErrors(errors));
        }

        let manifest = ArtifactManifest {
            manifest_version: MANIFEST_VERSION.to_string(),
            disks: self.disks,
            source: self.source,
            vm: self.vm,
            nics: self.nics,
            notes: self.notes,
            warnings: self.warnings,
            metadata: self.metadata,
            pipeline: self.pipeline,
            guest_config: None,
            output: self.output,
            runtime: self.runtime,
            unknown: BTreeMap::new(),
        };

        validate(&manifest)?;
        Ok(manifest)
    }
}

fn hash_file(path: &Path) -> Result<(u64, String), ManifestError> {
    let mut file = std::fs::File::open(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut file, &mut hasher).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

/// Re-hash every disk that carries a recorded checksum and compare.
/// Disks without a checksum are silently skipped. Returns the
/// id→bool map built so far even when an error is returned, so callers
/// can see which disks were already checked before the mismatch.
pub fn verify_checksums(
    manifest: &ArtifactManifest,
) -> Result<BTreeMap<String, bool>, (BTreeMap<String, bool>, ManifestError)> {
    let mut results = BTreeMap::new();
    for disk in &manifest.disks {
        let Some(expected) = &disk.checksum else {
            continue;
        };
        let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
        match hash_file(Path::new(&disk.local_path)) {
            Ok((_, actual_hex)) => {
                let matches = actual_hex == expected_hex;
                results.insert(disk.id.clone(), matches);
                if !matches {
                    return Err((
                        results,
                        ManifestError::ChecksumMismatch {
                            id: disk.id.clone(),
                            expected: expected.clone(),
                            actual: format!("sha256:{actual_hex}"),
                        },
                    ));
                }
            }
            Err(e) => return Err((results, e)),
        }
    }
    Ok(results)
}

/// Canonical codec: `.yaml`/`.yml` selects YAML, any other extension
/// selects JSON (2-space indent).
pub fn write_to_file(manifest: &ArtifactManifest, path: &Path) -> Result<(), ManifestError> {
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let text = if is_yaml {
        serde_yaml::to_string(manifest).map_err(|e| ManifestError::Codec(e.to_string()))?
    } else {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        manifest
            .serialize(&mut ser)
            .map_err(|e| ManifestError::Codec(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| ManifestError::Codec(e.to_string()))?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ManifestError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text).map_err(|source| ManifestError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read and validate a manifest file, selecting the codec from the
/// extension.
pub fn read_from_file(path: &Path) -> Result<ArtifactManifest, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let manifest: ArtifactManifest = if is_yaml {
        serde_yaml::from_str(&text).map_err(|e| ManifestError::Codec(e.to_string()))?
    } else {
        serde_json::from_str(&text).map_err(|e| ManifestError::Codec(e.to_string()))?
    };

    validate(&manifest)?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_disk(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn s1_minimal_manifest_round_trips() {
        let disk_file = temp_disk(&[0u8; 1024]);
        let manifest = ManifestBuilder::new()
            .add_disk(
                "disk-0",
                SourceFormat::Vmdk,
                disk_file.path().to_str().unwrap(),
                1024,
                DiskType::Boot,
            )
            .build()
            .expect("valid manifest");

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("\"manifest_version\""));
        assert!(json.contains("\"disks\""));

        let parsed: ArtifactManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.disks.len(), 1);
        assert_eq!(parsed.disks[0].id, "disk-0");
    }

    #[test]
    fn s2_checksum_mismatch_names_disk() {
        let disk_file = temp_disk(b"original bytes");
        let manifest = ManifestBuilder::new()
            .add_disk_with_checksum(
                "disk-0",
                SourceFormat::Qcow2,
                disk_file.path().to_str().unwrap(),
                DiskType::Data,
            )
            .build()
            .expect("valid manifest");

        std::fs::write(disk_file.path(), b"different bytes!!").unwrap();

        let err = verify_checksums(&manifest).unwrap_err().1;
        let msg = err.to_string();
        assert!(msg.contains("disk-0"));
    }

    #[test]
    fn verify_checksums_skips_disks_without_checksum() {
        let disk_file = temp_disk(&[1, 2, 3]);
        let manifest = ManifestBuilder::new()
            .add_disk(
                "disk-0",
                SourceFormat::Raw,
                disk_file.path().to_str().unwrap(),
                3,
                DiskType::Data,
            )
            .build()
            .unwrap();
        let results = verify_checksums(&manifest).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn rejects_unknown_manifest_version() {
        let disk_file = temp_disk(&[0u8]);
        let mut manifest = ManifestBuilder::new()
            .add_disk(
                "disk-0",
                SourceFormat::Raw,
                disk_file.path().to_str().unwrap(),
                1,
                DiskType::Data,
            )
            .build()
            .unwrap();
        manifest.manifest_version = "2.0".to_string();
        assert!(matches!(validate(&manifest), Err(ManifestError::UnsupportedVersion(_))));
    }

    #[test]
    fn rejects_duplicate_disk_ids() {
        let disk_file = temp_disk(&[0u8]);
        let path = disk_file.path().to_str().unwrap();
        let manifest_result = ManifestBuilder::new()
            .add_disk("disk-0", SourceFormat::Raw, path, 1, DiskType::Data)
            .add_disk("disk-0", SourceFormat::Raw, path, 1, DiskType::Data)
            .build();
        assert!(manifest_result.is_err());
    }

    #[test]
    fn boot_disk_picks_smallest_hint() {
        let disk_a = temp_disk(&[0u8]);
        let disk_b = temp_disk(&[0u8]);
        let manifest = ManifestBuilder::new()
            .add_disk("a", SourceFormat::Qcow2, disk_a.path().to_str().unwrap(), 1, DiskType::Boot)
            .boot_order_hint(5)
            .add_disk("b", SourceFormat::Qcow2, disk_b.path().to_str().unwrap(), 1, DiskType::Boot)
            .boot_order_hint(1)
            .build()
            .unwrap();
        assert_eq!(manifest.boot_disk().unwrap().id, "b");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = r#"{
            "manifest_version": "1.0",
            "disks": [],
            "future_field": {"nested": true}
        }"#;
        let parsed: ArtifactManifest = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.unknown.get("future_field"),
            Some(&serde_json::json!({"nested": true}))
        );
        let reserialized = serde_json::to_string(&parsed).unwrap();
        assert!(reserialized.contains("future_field"));
    }

    #[test]
    fn yaml_extension_selects_yaml_codec() {
        let dir = tempfile::tempdir().unwrap();
        let disk_file = temp_disk(&[0u8; 4]);
        let manifest = ManifestBuilder::new()
            .add_disk("disk-0", SourceFormat::Raw, disk_file.path().to_str().unwrap(), 4, DiskType::Boot)
            .build()
            .unwrap();

        let yaml_path = dir.path().join("manifest.yaml");
        write_to_file(&manifest, &yaml_path).unwrap();
        let content = std::fs::read_to_string(&yaml_path).unwrap();
        assert!(content.contains("manifest_version"));
        assert!(!content.trim_start().starts_with('{'));

        let loaded = read_from_file(&yaml_path).unwrap();
        assert_eq!(loaded.disks.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_builder_never_panics_on_arbitrary_ids(id in "[\\PC]{0,20}") {
            let disk_file = tempfile::NamedTempFile::new().unwrap();
            let _ = ManifestBuilder::new()
                .add_disk(id, SourceFormat::Raw, disk_file.path().to_str().unwrap(), 0, DiskType::Data)
                .build();
        }
    }
}
