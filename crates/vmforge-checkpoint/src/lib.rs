//! Resumable-transfer checkpoint state for vmforge exports.
//!
//! A `Checkpoint` tracks per-file byte offsets and SHA-256 progress for a
//! single export so a restarted job can resume a multi-file download
//! where it left off. The owning worker is the sole writer; `save` writes
//! to `<path>.tmp` then renames into place so a reader from another
//! process (e.g. a status dashboard) always sees either the old or the
//! new file, never a torn one.
//!
//! # Example
//!
//! ```
//! use vmforge_checkpoint::{Checkpoint, FileStatus};
//!
//! let mut cp = Checkpoint::new("vm1", "vsphere", "qcow2", "/exports/vm1");
//! cp.add_file("disk-0.vmdk", None, 2000);
//! cp.update_file_progress("disk-0.vmdk", 500, FileStatus::Downloading).unwrap();
//! assert!((cp.progress() - 0.25).abs() < 1e-9);
//! assert!(!cp.is_complete());
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current checkpoint file format version. `load` rejects any other
/// value rather than attempting a silent upgrade.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint file version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("file {0:?} is not tracked by this checkpoint")]
    UnknownFile(String),
    #[error("downloaded_bytes {downloaded} exceeds total_bytes {total} for {path:?}")]
    ProgressOverflow {
        path: String,
        downloaded: u64,
        total: u64,
    },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Per-file transfer state ∈ {pending, downloading, completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One file's resumable-transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCheckpoint {
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub status: FileStatus,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl FileCheckpoint {
    fn new(relative_path: String, source_url: Option<String>, total_bytes: u64) -> Self {
        Self {
            relative_path,
            source_url,
            total_bytes,
            downloaded_bytes: 0,
            sha256: None,
            status: FileStatus::Pending,
            last_modified: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Per-export resumable-transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub vm_name: String,
    pub provider: String,
    pub export_format: String,
    pub output_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub files: Vec<FileCheckpoint>,
}

impl Checkpoint {
    pub fn new(
        vm_name: impl Into<String>,
        provider: impl Into<String>,
        export_format: impl Into<String>,
        output_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            vm_name: vm_name.into(),
            provider: provider.into(),
            export_format: export_format.into(),
            output_path: output_path.into(),
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    /// Register a new file under resumable transfer.
    pub fn add_file(&mut self, relative_path: impl Into<String>, source_url: Option<String>, total_bytes: u64) {
        self.files.push(FileCheckpoint::new(relative_path.into(), source_url, total_bytes));
        self.updated_at = Utc::now();
    }

    fn file_mut(&mut self, relative_path: &str) -> Result<&mut FileCheckpoint, CheckpointError> {
        self.files
            .iter_mut()
            .find(|f| f.relative_path == relative_path)
            .ok_or_else(|| CheckpointError::UnknownFile(relative_path.to_string()))
    }

    /// Update a file's downloaded-byte count and status. Called after
    /// every significant byte-progress flush (recommended: every 1-64 MiB)
    /// or on any status change.
    pub fn update_file_progress(
        &mut self,
        relative_path: &str,
        downloaded_bytes: u64,
        status: FileStatus,
    ) -> Result<(), CheckpointError> {
        let total = self
            .files
            .iter()
            .find(|f| f.relative_path == relative_path)
            .map(|f| f.total_bytes)
            .ok_or_else(|| CheckpointError::UnknownFile(relative_path.to_string()))?;
        if downloaded_bytes > total {
            return Err(CheckpointError::ProgressOverflow {
                path: relative_path.to_string(),
                downloaded: downloaded_bytes,
                total,
            });
        }
        let file = self.file_mut(relative_path)?;
        file.downloaded_bytes = downloaded_bytes;
        file.status = status;
        file.last_modified = Utc::now();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the verified SHA-256 digest for a completed file.
    pub fn set_checksum(&mut self, relative_path: &str, sha256_hex: impl Into<String>) -> Result<(), CheckpointError> {
        let file = self.file_mut(relative_path)?;
        file.sha256 = Some(sha256_hex.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_retry(&mut self, relative_path: &str) -> Result<(), CheckpointError> {
        let file = self.file_mut(relative_path)?;
        file.retry_count += 1;
        Ok(())
    }

    pub fn get_file_progress(&self, relative_path: &str) -> Option<&FileCheckpoint> {
        self.files.iter().find(|f| f.relative_path == relative_path)
    }

    /// Aggregate progress: Σdownloaded / Σtotal across files; 0 when
    /// total=0 so there is never a division by zero.
    pub fn progress(&self) -> f64 {
        let total: u64 = self.files.iter().map(|f| f.total_bytes).sum();
        if total == 0 {
            return 0.0;
        }
        let done: u64 = self.files.iter().map(|f| f.downloaded_bytes).sum();
        done as f64 / total as f64
    }

    /// A non-empty file list where every file is `completed`.
    pub fn is_complete(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.status == FileStatus::Completed)
    }

    /// Atomic save: write to `<path>.tmp`, then rename into place so no
    /// partial file survives a crash.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Load and reject a version mismatch outright — no silent upgrade.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let text = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&text)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(checkpoint)
    }

    pub fn delete(path: &Path) -> Result<(), CheckpointError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

/// The checkpoint file name for a given VM: `<output_dir>/.<vm_name>.checkpoint`.
pub fn checkpoint_path(output_dir: &Path, vm_name: &str) -> std::path::PathBuf {
    output_dir.join(format!(".{vm_name}.checkpoint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_resume_progress_matches_spec_example() {
        let mut cp = Checkpoint::new("vm1", "vsphere", "qcow2", "/exports/vm1");
        cp.add_file("disk-0.vmdk", None, 1000);
        cp.add_file("disk-1.vmdk", None, 2000);
        cp.update_file_progress("disk-0.vmdk", 500, FileStatus::Downloading).unwrap();
        cp.update_file_progress("disk-1.vmdk", 0, FileStatus::Pending).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.checkpoint");
        cp.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert!((loaded.progress() - (500.0 / 3000.0)).abs() < 1e-9);
        assert!(!loaded.is_complete());
    }

    #[test]
    fn is_complete_requires_nonempty_and_all_completed() {
        let mut cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        assert!(!cp.is_complete());
        cp.add_file("d0", None, 10);
        cp.update_file_progress("d0", 10, FileStatus::Completed).unwrap();
        assert!(cp.is_complete());
    }

    #[test]
    fn progress_zero_total_has_no_division_by_zero() {
        let cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        assert_eq!(cp.progress(), 0.0);
    }

    #[test]
    fn update_progress_rejects_overflow() {
        let mut cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        cp.add_file("d0", None, 10);
        let err = cp.update_file_progress("d0", 11, FileStatus::Downloading).unwrap_err();
        assert!(matches!(err, CheckpointError::ProgressOverflow { .. }));
    }

    #[test]
    fn load_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.checkpoint");
        let mut cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        cp.version = 99;
        std::fs::write(&path, serde_json::to_string(&cp).unwrap()).unwrap();
        let err = Checkpoint::load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::VersionMismatch { .. }));
    }

    #[test]
    fn save_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.checkpoint");
        let cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        cp.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn delete_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.checkpoint");
        let cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
        cp.save(&path).unwrap();
        Checkpoint::delete(&path).unwrap();
        assert!(!path.exists());
        Checkpoint::delete(&path).unwrap();
    }

    proptest::proptest! {
        #[test]
        fn prop_progress_idempotence(total in 1u64..10_000, done_fraction in 0u32..=100) {
            let done = (total as u128 * done_fraction as u128 / 100) as u64;
            let mut cp = Checkpoint::new("vm1", "ec2", "raw", "/out");
            cp.add_file("d0", None, total);
            let status = if done == total { FileStatus::Completed } else { FileStatus::Downloading };
            cp.update_file_progress("d0", done, status).unwrap();
            let expected = done as f64 / total as f64;
            assert!((cp.progress() - expected).abs() < 1e-9);
            if done == total {
                assert!(cp.is_complete());
            }
        }
    }
}
