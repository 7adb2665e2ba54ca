//! Checkpointed, throttled disk download.
//!
//! One [`Checkpoint`] is shared by every file in the export; each file is
//! downloaded sequentially through a blocking task so the synchronous
//! `Exporter` reader and `ThrottledReader` token bucket never touch the
//! async runtime's reactor directly.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use vmforge_checkpoint::{Checkpoint, FileStatus};
use vmforge_progress::Tracker;
use vmforge_throttle::{CancelToken, ThrottledReader};

use crate::error::OrchestratorError;
use crate::exporter::{ExportFile, Exporter};

const CHUNK_BYTES: usize = 256 * 1024;

/// Rate limiting and checkpoint-flush cadence for one export.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// `<= 0.0` disables throttling entirely.
    pub bytes_per_second: f64,
    /// `None` uses [`vmforge_throttle::default_burst`].
    pub burst_bytes: Option<f64>,
    /// How many downloaded bytes accrue between checkpoint saves.
    /// Clamped to 1-64 MiB.
    pub checkpoint_flush_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 0.0,
            burst_bytes: None,
            checkpoint_flush_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Download every file not already `completed` in `checkpoint`, updating
/// and saving the checkpoint as it goes so a crash mid-export resumes from
/// the last flush rather than from scratch.
pub(crate) async fn download_all(
    exporter: &dyn Exporter,
    vm_path: &str,
    files: &[ExportFile],
    output_dir: &Path,
    checkpoint_path: &Path,
    checkpoint: &Arc<Mutex<Checkpoint>>,
    transfer: &TransferConfig,
    tracker: &Arc<Tracker>,
    task_id: &str,
    cancel: CancellationToken,
) -> Result<(), OrchestratorError> {
    for file in files {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let (already_done, resume_offset) = {
            let cp = checkpoint.lock().unwrap();
            match cp.get_file_progress(&file.relative_path) {
                Some(f) if f.status == FileStatus::Completed => (true, f.downloaded_bytes),
                Some(f) => (false, f.downloaded_bytes),
                None => (false, 0),
            }
        };
        if already_done {
            continue;
        }

        let dest = output_dir.join(&file.relative_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(OrchestratorError::Io)?;
        }

        let reader = exporter
            .open_reader(vm_path, file, resume_offset)
            .await
            .map_err(OrchestratorError::Export)?;

        {
            let mut cp = checkpoint.lock().unwrap();
            cp.update_file_progress(&file.relative_path, resume_offset, FileStatus::Downloading)?;
            cp.save(checkpoint_path)?;
        }

        let relative_path = file.relative_path.clone();
        let total_bytes = file.total_bytes;
        let flush_every = transfer.checkpoint_flush_bytes.clamp(1024 * 1024, 64 * 1024 * 1024);
        let bytes_per_second = transfer.bytes_per_second;
        let burst_bytes = transfer
            .burst_bytes
            .unwrap_or_else(|| vmforge_throttle::default_burst(bytes_per_second));
        let checkpoint_for_blocking = checkpoint.clone();
        let checkpoint_path_for_blocking = checkpoint_path.to_path_buf();
        let tracker_for_blocking = tracker.clone();
        let task_id_for_blocking = task_id.to_string();
        let cancel_for_blocking = cancel.clone();
        let dest_for_blocking = dest.clone();
        let relative_path_for_blocking = relative_path.clone();

        tokio::task::spawn_blocking(move || {
            download_one(
                reader,
                &dest_for_blocking,
                resume_offset,
                total_bytes,
                bytes_per_second,
                burst_bytes,
                flush_every,
                &relative_path_for_blocking,
                &checkpoint_for_blocking,
                &checkpoint_path_for_blocking,
                &tracker_for_blocking,
                &task_id_for_blocking,
                cancel_for_blocking,
            )
        })
        .await
        .map_err(|e| OrchestratorError::Join(e.to_string()))??;

        let digest = hash_file(&dest)?;
        let mut cp = checkpoint.lock().unwrap();
        cp.set_checksum(&relative_path, digest)?;
        cp.save(checkpoint_path)?;
    }
    Ok(())
}

/// Runs inside a blocking task: seeks to `starting_offset`, streams through
/// an optional token bucket, and flushes checkpoint progress every
/// `flush_every` bytes.
#[allow(clippy::too_many_arguments)]
fn download_one(
    reader: Box<dyn Read + Send>,
    dest: &Path,
    starting_offset: u64,
    total_bytes: u64,
    bytes_per_second: f64,
    burst_bytes: f64,
    flush_every: u64,
    relative_path: &str,
    checkpoint: &Mutex<Checkpoint>,
    checkpoint_path: &Path,
    tracker: &Tracker,
    task_id: &str,
    cancel: CancellationToken,
) -> Result<(), OrchestratorError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(dest)
        .map_err(OrchestratorError::Io)?;
    file.seek(SeekFrom::Start(starting_offset)).map_err(OrchestratorError::Io)?;

    let bucket_cancel = CancelToken::new();
    let mut throttled = if bytes_per_second > 0.0 {
        ThrottledReader::new(reader, bytes_per_second, burst_bytes, bucket_cancel.clone())
    } else {
        ThrottledReader::unthrottled(reader, bucket_cancel.clone())
    };

    let mut downloaded = starting_offset;
    let mut since_flush = 0u64;
    let mut buf = vec![0u8; CHUNK_BYTES];

    loop {
        if cancel.is_cancelled() {
            bucket_cancel.cancel();
            let mut cp = checkpoint.lock().unwrap();
            cp.update_file_progress(relative_path, downloaded, FileStatus::Failed)?;
            cp.save(checkpoint_path)?;
            return Err(OrchestratorError::Cancelled);
        }

        let n = match throttled.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                let mut cp = checkpoint.lock().unwrap();
                cp.update_file_progress(relative_path, downloaded, FileStatus::Failed)?;
                cp.save(checkpoint_path)?;
                return Err(OrchestratorError::Cancelled);
            }
            Err(e) => return Err(OrchestratorError::Io(e)),
        };

        file.write_all(&buf[..n]).map_err(OrchestratorError::Io)?;
        downloaded += n as u64;
        since_flush += n as u64;

        if since_flush >= flush_every {
            since_flush = 0;
            let mut cp = checkpoint.lock().unwrap();
            cp.update_file_progress(relative_path, downloaded, FileStatus::Downloading)?;
            cp.save(checkpoint_path)?;
            drop(cp);
            let _ = tracker.set_export_progress(task_id, downloaded, total_bytes, 0.0);
        }
    }

    file.flush().map_err(OrchestratorError::Io)?;
    let mut cp = checkpoint.lock().unwrap();
    cp.update_file_progress(relative_path, downloaded, FileStatus::Completed)?;
    cp.save(checkpoint_path)?;
    Ok(())
}

fn hash_file(path: &Path) -> Result<String, OrchestratorError> {
    let mut file = std::fs::File::open(path).map_err(OrchestratorError::Io)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(OrchestratorError::Io)?;
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) fn load_or_create_checkpoint(
    path: &Path,
    vm_name: &str,
    provider: &str,
    export_format: &str,
    output_dir: &str,
    files: &[ExportFile],
) -> Result<Checkpoint, OrchestratorError> {
    let mut checkpoint = if path.exists() {
        Checkpoint::load(path)?
    } else {
        Checkpoint::new(vm_name, provider, export_format, output_dir)
    };
    for file in files {
        if checkpoint.get_file_progress(&file.relative_path).is_none() {
            checkpoint.add_file(file.relative_path.clone(), file.source_url.clone(), file.total_bytes);
        }
    }
    Ok(checkpoint)
}

pub(crate) fn checkpoint_path_for(output_dir: &Path, vm_name: &str) -> PathBuf {
    vmforge_checkpoint::checkpoint_path(output_dir, vm_name)
}
