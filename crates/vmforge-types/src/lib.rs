//! Core domain types shared across the vmforge workspace.
//!
//! This crate defines the data model described by the Artifact Manifest
//! contract's neighbors: job records, progress snapshots, audit events and
//! webhook events. The manifest and checkpoint data models live in their
//! own crates (`vmforge-manifest`, `vmforge-checkpoint`) since they have
//! their own validation and codec concerns; everything here is shared by
//! three or more downstream crates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmforge_retry::RetryStrategyConfig;

/// Hypervisor / cloud provider a job's VM is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vsphere,
    Ec2,
    Azure,
    Gcp,
    HyperV,
    Oci,
    OpenStack,
    Alibaba,
    Proxmox,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provider::Vsphere => "vsphere",
            Provider::Ec2 => "ec2",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::HyperV => "hyperv",
            Provider::Oci => "oci",
            Provider::OpenStack => "openstack",
            Provider::Alibaba => "alibaba",
            Provider::Proxmox => "proxmox",
        };
        write!(f, "{s}")
    }
}

/// Terminal-vs-nonterminal job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states: exactly one of these ends a job's life.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Valid next states from `self`, used to enforce the monotonic DAG
    /// invariant (property 5).
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[JobStatus::Running, JobStatus::Cancelled],
            JobStatus::Running => {
                &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A single migration/export job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub vm_name: String,
    pub vm_path: String,
    pub provider: Provider,
    pub output_dir: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub error: Option<String>,
    /// Opaque typed metadata (format, compression, tags, ...). `null` is a
    /// distinct stored value from an absent key — see DESIGN.md for the
    /// Open Question this resolves.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub user: Option<String>,
    pub total_bytes: u64,
    pub files_count: u32,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        vm_name: impl Into<String>,
        vm_path: impl Into<String>,
        provider: Provider,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            vm_name: vm_name.into(),
            vm_path: vm_path.into(),
            provider,
            output_dir: output_dir.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error: None,
            metadata: BTreeMap::new(),
            user: None,
            total_bytes: 0,
            files_count: 0,
        }
    }

    /// Apply a status transition, enforcing the lifecycle invariants:
    /// `started_at` set iff status leaves `pending`; `completed_at` set iff
    /// the status lands in a terminal state; `progress` forced to 100.0 on
    /// completion.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && next != JobStatus::Pending {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == JobStatus::Completed {
            self.progress = 100.0;
        }
        self.status = next;
        Ok(())
    }
}

/// Errors surfaced while mutating or locating jobs. These map to the
/// "Validation" / "Not-found" / "Internal" error kinds.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job {0} is in a terminal state and cannot be mutated")]
    Terminal(String),
}

/// Filter parameters for `ListJobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub provider: Option<Provider>,
    pub user: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Aggregate counts returned by `GetJobStats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub success_rate: f64,
}

impl JobStats {
    pub fn compute(counts: &BTreeMap<JobStatus, u64>) -> Self {
        let total: u64 = counts.values().sum();
        let completed = *counts.get(&JobStatus::Completed).unwrap_or(&0);
        let success_rate = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };
        Self {
            total,
            pending: *counts.get(&JobStatus::Pending).unwrap_or(&0),
            running: *counts.get(&JobStatus::Running).unwrap_or(&0),
            completed,
            failed: *counts.get(&JobStatus::Failed).unwrap_or(&0),
            cancelled: *counts.get(&JobStatus::Cancelled).unwrap_or(&0),
            success_rate,
        }
    }
}

/// A reusable job definition used both for ad hoc submission and as a
/// schedule's template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub vm_name: String,
    pub vm_path: String,
    pub provider: Provider,
    pub output_dir: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub user: Option<String>,
}

impl JobDefinition {
    /// Instantiate a concrete [`Job`] from this template, substituting
    /// `{{date}}` in `output_dir` with today's date the way a scheduled
    /// export would want a fresh directory per run.
    pub fn instantiate(&self, id: impl Into<String>) -> Job {
        let output_dir = self
            .output_dir
            .replace("{{date}}", &Utc::now().format("%Y-%m-%d").to_string());
        let mut job = Job::new(id, self.name.clone(), self.vm_name.clone(), self.vm_path.clone(), self.provider, output_dir);
        job.metadata = self.metadata.clone();
        job.user = self.user.clone();
        job
    }
}

/// A cron-driven binding of a [`JobDefinition`] template. The
/// scheduler owns mutation of `next_run`/`last_run`/`run_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub job_template: JobDefinition,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-stage progress detail nested under [`ProgressInfo`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub rate_bps: f64,
    pub eta_s: Option<f64>,
    pub message: Option<String>,
}

/// Coarse state of a migration task as seen by the progress tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Exporting,
    Converting,
    Uploading,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The live snapshot kept by the progress tracker for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub task_id: String,
    pub vm_name: String,
    pub provider: Provider,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_stage: String,
    pub stage_index: u32,
    pub total_stages: u32,
    pub percentage: f64,
    #[serde(default)]
    pub stages: BTreeMap<String, StageProgress>,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ProgressInfo {
    pub fn new(task_id: impl Into<String>, vm_name: impl Into<String>, provider: Provider, total_stages: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            vm_name: vm_name.into(),
            provider,
            status: TaskStatus::Pending,
            start_time: now,
            updated_at: now,
            end_time: None,
            current_stage: String::new(),
            stage_index: 0,
            total_stages,
            percentage: 0.0,
            stages: BTreeMap::new(),
            error: None,
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Audit event type taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    MigrationStart,
    MigrationComplete,
    MigrationFail,
    ExportStart,
    ExportComplete,
    ExportFail,
    ConversionStart,
    ConversionComplete,
    ConversionFail,
    UploadStart,
    UploadComplete,
    UploadFail,
    ConfigChange,
    ApiAccess,
    Warning,
    Error,
}

/// A single JSON-line audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub vm_name: Option<String>,
    pub provider: Option<Provider>,
    pub user: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub action: String,
    pub description: String,
    pub status: Option<String>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub changes: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// Build an event with only the required fields set; callers use the
    /// `with_*` methods or construct literally for the rest.
    pub fn new(
        event_type: AuditEventType,
        action: impl Into<String>,
        description: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            event_id: String::new(),
            event_type,
            timestamp: Utc::now(),
            task_id: None,
            vm_name: None,
            provider: None,
            user: None,
            ip: None,
            user_agent: None,
            action: action.into(),
            description: description.into(),
            status: None,
            duration_ms: None,
            details: BTreeMap::new(),
            success,
            error: None,
            resources: Vec::new(),
            changes: BTreeMap::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>, vm_name: impl Into<String>, provider: Provider) -> Self {
        self.task_id = Some(task_id.into());
        self.vm_name = Some(vm_name.into());
        self.provider = Some(provider);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Kind of webhook destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookType {
    #[default]
    Generic,
    Slack,
    Discord,
    Email,
}

/// Which job lifecycle events a notifier cares about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WebhookEventFilters {
    #[serde(default = "default_true")]
    pub on_start: bool,
    #[serde(default = "default_true")]
    pub on_complete: bool,
    #[serde(default = "default_true")]
    pub on_error: bool,
    #[serde(default)]
    pub on_warning: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WebhookEventFilters {
    fn default() -> Self {
        Self {
            on_start: true,
            on_complete: true,
            on_error: true,
            on_warning: false,
        }
    }
}

impl WebhookEventFilters {
    pub fn allows(&self, event_type: WebhookEventType) -> bool {
        match event_type {
            WebhookEventType::Start => self.on_start,
            WebhookEventType::Complete => self.on_complete,
            WebhookEventType::Error => self.on_error,
            WebhookEventType::Warning => self.on_warning,
        }
    }
}

/// Coarse classification of a [`WebhookEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    Start,
    Complete,
    Error,
    Warning,
}

/// Destination-agnostic event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub task_id: String,
    pub vm_name: String,
    pub provider: Provider,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Named retry budgets referenced by the engine and pipeline stages so a
/// single `RetryStrategyConfig` can be shared by value without every
/// caller constructing one from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBudgets {
    pub transfer: RetryStrategyConfig,
    pub webhook: RetryStrategyConfig,
    pub stage: RetryStrategyConfig,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        use vmforge_retry::RetryPolicy;
        Self {
            transfer: RetryPolicy::Default.to_config(),
            webhook: RetryPolicy::Conservative.to_config(),
            stage: RetryPolicy::Default.to_config(),
        }
    }
}
