//! In-memory per-task progress tracker with streaming subscribers.
//!
//! Keeps a `task_id -> ProgressInfo` map under a mutex and a parallel
//! `task_id -> [subscriber]` map. Every mutator runs under the lock, then
//! fans the new snapshot out to subscribers non-blockingly: a slow consumer
//! drops updates rather than stalling the worker that owns the task — the
//! correct tradeoff for a data plane where only the latest state matters.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;
use vmforge_types::{Provider, StageProgress, TaskStatus};
pub use vmforge_types::ProgressInfo;

/// Channel capacity for a subscriber; buffered, capacity >= 10.
const SUBSCRIBER_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("task {0} not found")]
    NotFound(String),
}

struct Entry {
    info: ProgressInfo,
    subscribers: Vec<(u64, mpsc::Sender<ProgressInfo>)>,
}

/// Opaque handle returned by [`Tracker::subscribe`], passed back to
/// [`Tracker::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// The progress tracker. Cheaply cloneable; all state lives behind
/// an `Arc` internally... actually held directly, so callers share one
/// instance via their own `Arc<Tracker>`.
#[derive(Default)]
pub struct Tracker {
    tasks: Mutex<HashMap<String, Entry>>,
    next_subscriber_id: Mutex<u64>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task. Overwrites any existing entry with the same id
    /// (a worker restarting a job it already owns).
    pub fn start_task(&self, task_id: impl Into<String>, vm_name: impl Into<String>, provider: Provider, total_stages: u32) {
        let task_id = task_id.into();
        let info = ProgressInfo::new(task_id.clone(), vm_name, provider, total_stages);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.insert(task_id, Entry { info, subscribers: Vec::new() });
    }

    fn mutate(&self, task_id: &str, f: impl FnOnce(&mut ProgressInfo)) -> Result<(), ProgressError> {
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks.get_mut(task_id).ok_or_else(|| ProgressError::NotFound(task_id.to_string()))?;
        f(&mut entry.info);
        entry.info.updated_at = Utc::now();
        let snapshot = entry.info.clone();
        entry.subscribers.retain(|(_, tx)| tx.try_send(snapshot.clone()).is_ok() || !tx.is_closed());
        Ok(())
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<(), ProgressError> {
        self.mutate(task_id, |info| info.status = status)
    }

    pub fn set_stage(&self, task_id: &str, stage: impl Into<String>, stage_index: u32) -> Result<(), ProgressError> {
        let stage = stage.into();
        self.mutate(task_id, |info| {
            info.current_stage = stage;
            info.stage_index = stage_index;
        })
    }

    /// Set overall percentage. Clamped to be non-decreasing (property 7:
    /// percentage is monotone until a terminal state).
    pub fn set_percentage(&self, task_id: &str, percentage: f64) -> Result<(), ProgressError> {
        self.mutate(task_id, |info| {
            if percentage > info.percentage {
                info.percentage = percentage;
            }
        })
    }

    fn set_stage_progress(&self, task_id: &str, stage: &str, bytes_done: u64, bytes_total: u64, rate_bps: f64) -> Result<(), ProgressError> {
        let stage = stage.to_string();
        self.mutate(task_id, |info| {
            let entry = info.stages.entry(stage).or_default();
            entry.bytes_done = bytes_done;
            entry.bytes_total = bytes_total;
            entry.rate_bps = rate_bps;
            entry.eta_s = if rate_bps > 0.0 && bytes_total > bytes_done {
                Some((bytes_total - bytes_done) as f64 / rate_bps)
            } else {
                None
            };
        })
    }

    pub fn set_export_progress(&self, task_id: &str, bytes_done: u64, bytes_total: u64, rate_bps: f64) -> Result<(), ProgressError> {
        self.set_stage_progress(task_id, "export", bytes_done, bytes_total, rate_bps)
    }

    pub fn set_conversion_progress(&self, task_id: &str, bytes_done: u64, bytes_total: u64, rate_bps: f64) -> Result<(), ProgressError> {
        self.set_stage_progress(task_id, "convert", bytes_done, bytes_total, rate_bps)
    }

    pub fn set_upload_progress(&self, task_id: &str, bytes_done: u64, bytes_total: u64, rate_bps: f64) -> Result<(), ProgressError> {
        self.set_stage_progress(task_id, "upload", bytes_done, bytes_total, rate_bps)
    }

    pub fn complete_task(&self, task_id: &str) -> Result<(), ProgressError> {
        self.mutate(task_id, |info| {
            info.status = TaskStatus::Completed;
            info.percentage = 100.0;
            info.end_time = Some(Utc::now());
        })
    }

    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) -> Result<(), ProgressError> {
        let error = error.into();
        self.mutate(task_id, |info| {
            info.status = TaskStatus::Failed;
            info.error = Some(error);
            info.end_time = Some(Utc::now());
        })
    }

    pub fn add_warning(&self, task_id: &str, warning: impl Into<String>) -> Result<(), ProgressError> {
        let warning = warning.into();
        self.mutate(task_id, |info| info.warnings.push(warning))
    }

    pub fn remove_task(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
    }

    /// Deep copy of the current snapshot, so the caller can't mutate the
    /// tracker's internal state through the returned value.
    pub fn get_progress(&self, task_id: &str) -> Result<ProgressInfo, ProgressError> {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .get(task_id)
            .map(|e| e.info.clone())
            .ok_or_else(|| ProgressError::NotFound(task_id.to_string()))
    }

    pub fn list_tasks(&self) -> Vec<ProgressInfo> {
        self.tasks.lock().unwrap().values().map(|e| e.info.clone()).collect()
    }

    /// Subscribe to every future snapshot for `task_id`. Returns `None` if
    /// the task doesn't exist. The first item the caller should display is
    /// the current state, obtained via [`Tracker::get_progress`] — this
    /// channel only carries *changes*.
    pub fn subscribe(&self, task_id: &str) -> Option<(SubscriberId, mpsc::Receiver<ProgressInfo>)> {
        let mut tasks = self.tasks.lock().unwrap();
        let entry = tasks.get_mut(task_id)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut next_id = self.next_subscriber_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        entry.subscribers.push((id, tx));
        Some((SubscriberId(id), rx))
    }

    pub fn unsubscribe(&self, task_id: &str, id: SubscriberId) {
        if let Some(entry) = self.tasks.lock().unwrap().get_mut(task_id) {
            entry.subscribers.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_progress_returns_deep_copy() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Vsphere, 3);
        let mut snapshot = tracker.get_progress("t1").unwrap();
        snapshot.percentage = 99.0;
        assert_eq!(tracker.get_progress("t1").unwrap().percentage, 0.0);
    }

    #[test]
    fn unknown_task_errors() {
        let tracker = Tracker::new();
        assert!(matches!(tracker.set_status("missing", TaskStatus::Exporting), Err(ProgressError::NotFound(_))));
    }

    #[test]
    fn percentage_is_monotone() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Ec2, 1);
        tracker.set_percentage("t1", 50.0).unwrap();
        tracker.set_percentage("t1", 10.0).unwrap();
        assert_eq!(tracker.get_progress("t1").unwrap().percentage, 50.0);
        tracker.set_percentage("t1", 80.0).unwrap();
        assert_eq!(tracker.get_progress("t1").unwrap().percentage, 80.0);
    }

    #[test]
    fn complete_task_forces_full_percentage() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Gcp, 1);
        tracker.complete_task("t1").unwrap();
        let info = tracker.get_progress("t1").unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.percentage, 100.0);
        assert!(info.end_time.is_some());
    }

    #[tokio::test]
    async fn subscriber_receives_updates() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Azure, 2);
        let (_id, mut rx) = tracker.subscribe("t1").unwrap();
        tracker.set_percentage("t1", 25.0).unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.percentage, 25.0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Oci, 1);
        let (id, mut rx) = tracker.subscribe("t1").unwrap();
        tracker.unsubscribe("t1", id);
        tracker.set_percentage("t1", 5.0).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_unknown_task_returns_none() {
        let tracker = Tracker::new();
        assert!(tracker.subscribe("nope").is_none());
    }

    #[test]
    fn remove_task_drops_state() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Proxmox, 1);
        tracker.remove_task("t1");
        assert!(tracker.get_progress("t1").is_err());
    }

    #[test]
    fn export_progress_computes_eta() {
        let tracker = Tracker::new();
        tracker.start_task("t1", "vm1", Provider::Vsphere, 1);
        tracker.set_export_progress("t1", 50, 100, 10.0).unwrap();
        let info = tracker.get_progress("t1").unwrap();
        let stage: &StageProgress = info.stages.get("export").unwrap();
        assert_eq!(stage.eta_s, Some(5.0));
    }
}
