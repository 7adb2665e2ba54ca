//! Rotating JSON-line audit trail for vmforge migration operations.
//!
//! Every mutating action against a job — lifecycle transitions, config
//! changes, API access — is appended as one [`AuditEvent`] per line. The log
//! rotates by size rather than time since migration workloads are bursty:
//! a quiet week followed by a weekend of exports shouldn't produce eleven
//! near-empty daily files.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use vmforge_types::{AuditEvent, AuditEventType, Provider};

/// Rotate once the active file reaches this size.
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;
/// Keep this many rotated generations (`audit.log.1` .. `audit.log.N`).
pub const DEFAULT_RETAIN: u32 = 10;

/// Append-only, size-rotated audit trail.
pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    retain: u32,
    // Serializes rotation + append so concurrent writers from different
    // worker tasks never interleave a rotation with a write.
    lock: Mutex<()>,
    // Monotonic suffix disambiguating event ids minted within the same
    // nanosecond-resolution timestamp tick.
    seq: AtomicU64,
}

impl AuditLog {
    /// Open an audit log at `path` with the default rotation policy.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_rotation(path, DEFAULT_MAX_BYTES, DEFAULT_RETAIN)
    }

    /// Open an audit log with an explicit rotation policy.
    pub fn with_rotation(path: impl Into<PathBuf>, max_bytes: u64, retain: u32) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            retain,
            lock: Mutex::new(()),
            seq: AtomicU64::new(0),
        }
    }

    /// Mint a sortable event id: a nanosecond-resolution timestamp followed
    /// by a monotonic suffix, so ids minted in the same tick still sort and
    /// dedupe correctly.
    fn next_event_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos}-{seq:06}")
    }

    /// Append one event, rotating the file first if it has grown past
    /// `max_bytes`.
    pub fn record(&self, mut event: AuditEvent) -> Result<()> {
        if event.event_id.is_empty() {
            event.event_id = self.next_event_id();
        }

        let _guard = self.lock.lock().unwrap();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create audit dir {}", parent.display()))?;
            }
        }

        self.rotate_if_needed()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        let line = serde_json::to_string(&event).context("failed to serialize audit event")?;
        writeln!(writer, "{line}").context("failed to write audit event")?;
        writer.flush().context("failed to flush audit log")?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < self.max_bytes {
            return Ok(());
        }

        // Shift foo.log.(retain-1) .. foo.log.1 up by one, dropping the
        // oldest generation, then move the active file into foo.log.1.
        let oldest = self.rotated_path(self.retain);
        if oldest.exists() {
            fs::remove_file(&oldest).with_context(|| format!("failed to remove {}", oldest.display()))?;
        }
        for gen in (1..self.retain).rev() {
            let from = self.rotated_path(gen);
            if from.exists() {
                let to = self.rotated_path(gen + 1);
                fs::rename(&from, &to).with_context(|| format!("failed to rotate {} -> {}", from.display(), to.display()))?;
            }
        }
        fs::rename(&self.path, self.rotated_path(1))
            .with_context(|| format!("failed to rotate {}", self.path.display()))?;
        Ok(())
    }

    fn rotated_path(&self, generation: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{generation}"));
        PathBuf::from(name)
    }

    /// Convenience: record a `migration_start` event.
    pub fn log_migration_start(&self, task_id: &str, vm_name: &str, provider: Provider, user: Option<&str>) -> Result<()> {
        let mut event = AuditEvent::new(
            AuditEventType::MigrationStart,
            "migration.start",
            format!("started migration of {vm_name}"),
            true,
        )
        .with_task(task_id, vm_name, provider);
        if let Some(user) = user {
            event = event.with_user(user);
        }
        self.record(event)
    }

    /// Convenience: record a `migration_complete` event.
    pub fn log_migration_complete(&self, task_id: &str, vm_name: &str, provider: Provider, duration_ms: u64) -> Result<()> {
        let mut event = AuditEvent::new(
            AuditEventType::MigrationComplete,
            "migration.complete",
            format!("completed migration of {vm_name}"),
            true,
        )
        .with_task(task_id, vm_name, provider);
        event.duration_ms = Some(duration_ms);
        self.record(event)
    }

    /// Convenience: record a `migration_fail` event.
    pub fn log_migration_fail(&self, task_id: &str, vm_name: &str, provider: Provider, error: &str) -> Result<()> {
        let event = AuditEvent::new(
            AuditEventType::MigrationFail,
            "migration.fail",
            format!("migration of {vm_name} failed"),
            false,
        )
        .with_task(task_id, vm_name, provider)
        .with_error(error);
        self.record(event)
    }

    /// Convenience: record a `config_change` event with no task association.
    pub fn log_config_change(&self, user: Option<&str>, description: &str, changes: std::collections::BTreeMap<String, serde_json::Value>) -> Result<()> {
        let mut event = AuditEvent::new(AuditEventType::ConfigChange, "config.change", description, true);
        event.changes = changes;
        if let Some(user) = user {
            event = event.with_user(user);
        }
        self.record(event)
    }
}

/// Filters accepted by [`query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_types: Option<HashSet<AuditEventType>>,
    pub task_id: Option<String>,
    pub vm_name: Option<String>,
    pub provider: Option<Provider>,
    pub user: Option<String>,
    /// `Some(true)`/`Some(false)` restricts to successful/failed events;
    /// `None` returns both.
    pub success: Option<bool>,
}

impl QueryOptions {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if event.task_id.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        if let Some(vm_name) = &self.vm_name {
            if event.vm_name.as_deref() != Some(vm_name.as_str()) {
                return false;
            }
        }
        if let Some(provider) = self.provider {
            if event.provider != Some(provider) {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if event.user.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(success) = self.success {
            if event.success != success {
                return false;
            }
        }
        true
    }
}

/// Read and filter events out of a single audit log file. Callers that want
/// to search rotated generations too should call this once per file and
/// concatenate (`query(&audit.log.1, ..)`, `query(&audit.log, ..)`, ...).
pub fn query(path: &Path, options: &QueryOptions) -> Result<Vec<AuditEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("failed to open audit log {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse audit event from line: {line}"))?;
        if options.matches(&event) {
            events.push(event);
        }
    }
    Ok(events)
}
