//! Durable job persistence.
//!
//! `JobStore` wraps a single SQLite connection opened in WAL mode so readers
//! never block writers — the natural fit given the engine's single-writer
//! ownership model (only the worker that owns a job ever mutates its row).
//! The schema carries its own `schema_version` row so future migrations are
//! additive and detectable.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use vmforge_types::{Job, JobFilter, JobStats, JobStatus, Provider};

/// Current schema version. Forward migrations are additive.
pub const SCHEMA_VERSION: i64 = 1;

/// Errors raised by the job store. These map to the "Not-found" and
/// "Internal" error kinds.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize job metadata: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidTransition(#[from] vmforge_types::JobError),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// Durable, queryable store of [`Job`] records.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (creating if necessary) the job store at `path`, enabling WAL
    /// mode for concurrent readers, and apply the schema if this is a fresh
    /// database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store, used by tests and by short-lived CLI
    /// invocations that don't need durability.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                vm_name TEXT NOT NULL,
                vm_path TEXT NOT NULL,
                provider TEXT NOT NULL,
                output_dir TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                progress REAL NOT NULL,
                error TEXT,
                metadata_json TEXT NOT NULL,
                user TEXT,
                total_bytes INTEGER NOT NULL,
                files_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_provider ON jobs(provider);
            CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user);
            CREATE INDEX IF NOT EXISTS idx_jobs_vm_path ON jobs(vm_path);
            CREATE INDEX IF NOT EXISTS idx_jobs_vm_name ON jobs(vm_name);",
        )?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1", [], |r| r.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, Utc::now().to_rfc3339()],
            )?;
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert-or-replace a job by id.
    pub fn save_job(&self, job: &Job) -> Result<()> {
        let metadata_json = serde_json::to_string(&job.metadata)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (
                id, name, vm_name, vm_path, provider, output_dir, status, created_at,
                started_at, completed_at, progress, error, metadata_json,
                user, total_bytes, files_count
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                vm_name = excluded.vm_name,
                vm_path = excluded.vm_path,
                provider = excluded.provider,
                output_dir = excluded.output_dir,
                status = excluded.status,
                created_at = excluded.created_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                progress = excluded.progress,
                error = excluded.error,
                metadata_json = excluded.metadata_json,
                user = excluded.user,
                total_bytes = excluded.total_bytes,
                files_count = excluded.files_count",
            params![
                job.id,
                job.name,
                job.vm_name,
                job.vm_path,
                job.provider.to_string(),
                job.output_dir,
                job.status.to_string(),
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.progress,
                job.error,
                metadata_json,
                job.user,
                job.total_bytes as i64,
                job.files_count as i64,
            ],
        )?;
        Ok(())
    }

    /// Load a single job by id.
    pub fn load_job(&self, id: &str) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, vm_name, vm_path, provider, output_dir, status, created_at,
                    started_at, completed_at, progress, error, metadata_json,
                    user, total_bytes, files_count
             FROM jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    /// List jobs matching `filter`, ordered by `created_at` descending
    ///. Every predicate is bound as a parameter; only the
    /// clause list and the `LIMIT`/`OFFSET` integers are built by hand.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT id, name, vm_name, vm_path, provider, output_dir, status, created_at,
                    started_at, completed_at, progress, error, metadata_json,
                    user, total_bytes, files_count
             FROM jobs WHERE 1=1",
        );
        let mut clauses = Vec::new();
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            bound.push(Box::new(status.to_string()));
        }
        if let Some(provider) = filter.provider {
            clauses.push("provider = ?");
            bound.push(Box::new(provider.to_string()));
        }
        if let Some(user) = &filter.user {
            clauses.push("user = ?");
            bound.push(Box::new(user.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?");
            bound.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            clauses.push("created_at <= ?");
            bound.push(Box::new(until.to_rfc3339()));
        }
        for c in &clauses {
            sql.push_str(" AND ");
            sql.push_str(c);
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Update just the status column, failing if no row matched or if
    /// the transition would violate the monotonic DAG invariant.
    pub fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let mut job = self.load_job(id)?;
        job.transition(status)?;
        self.update_row(&job)
    }

    /// Update just the progress column, failing if no row matched.
    pub fn update_job_progress(&self, id: &str, progress: f64) -> Result<()> {
        let mut job = self.load_job(id)?;
        job.progress = progress;
        self.update_row(&job)
    }

    fn update_row(&self, job: &Job) -> Result<()> {
        let metadata_json = serde_json::to_string(&job.metadata)?;
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE jobs SET status=?2, started_at=?3, completed_at=?4, progress=?5,
                error=?6, metadata_json=?7 WHERE id=?1",
            params![
                job.id,
                job.status.to_string(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.progress,
                job.error,
                metadata_json,
            ],
        )?;
        if affected == 0 {
            return Err(JobStoreError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    /// Record a failure message on a job (helper composing `update_job_status`
    /// with the error string, used by the engine on the failure path).
    pub fn fail_job(&self, id: &str, error: impl Into<String>) -> Result<()> {
        let mut job = self.load_job(id)?;
        job.error = Some(error.into());
        job.transition(JobStatus::Failed)?;
        self.update_row(&job)
    }

    /// Delete a job by id, failing if no row matched.
    pub fn delete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Aggregate counts per status plus success rate.
    pub fn get_job_stats(&self) -> Result<JobStats> {
        let conn = self.conn.lock().unwrap();
        let mut counts = std::collections::BTreeMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |r| {
            let status: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok((status, count as u64))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = parse_status(&status) {
                counts.insert(status, count);
            }
        }
        Ok(JobStats::compute(&counts))
    }

    /// Delete terminal-status jobs whose `completed_at` predates `cutoff`,
    /// returning the number removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM jobs WHERE completed_at IS NOT NULL AND completed_at < ?1
                AND status IN ('completed', 'failed', 'cancelled')",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected as u64)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let provider: String = row.get(4)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let started_at: Option<String> = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    let metadata_json: String = row.get(12)?;

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        vm_name: row.get(2)?,
        vm_path: row.get(3)?,
        provider: parse_provider(&provider).unwrap_or(Provider::Vsphere),
        output_dir: row.get(5)?,
        status: parse_status(&status).unwrap_or(JobStatus::Pending),
        created_at: parse_ts(&created_at),
        started_at: started_at.map(|s| parse_ts(&s)),
        completed_at: completed_at.map(|s| parse_ts(&s)),
        progress: row.get(10)?,
        error: row.get(11)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        user: row.get(13)?,
        total_bytes: row.get::<_, i64>(14)? as u64,
        files_count: row.get::<_, i64>(15)? as u32,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn parse_status(s: &str) -> Option<JobStatus> {
    match s {
        "pending" => Some(JobStatus::Pending),
        "running" => Some(JobStatus::Running),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

fn parse_provider(s: &str) -> Option<Provider> {
    match s {
        "vsphere" => Some(Provider::Vsphere),
        "ec2" => Some(Provider::Ec2),
        "azure" => Some(Provider::Azure),
        "gcp" => Some(Provider::Gcp),
        "hyperv" => Some(Provider::HyperV),
        "oci" => Some(Provider::Oci),
        "openstack" => Some(Provider::OpenStack),
        "alibaba" => Some(Provider::Alibaba),
        "proxmox" => Some(Provider::Proxmox),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str) -> Job {
        Job::new(id, "nightly job", "vm1", "/dc/vm1", Provider::Vsphere, "/exports/vm1")
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        store.save_job(&sample_job("j1")).unwrap();
        let loaded = store.load_job("j1").unwrap();
        assert_eq!(loaded.id, "j1");
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[test]
    fn load_missing_job_is_not_found() {
        let store = JobStore::open_in_memory().unwrap();
        let err = store.load_job("missing").unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[test]
    fn update_status_unknown_job_is_not_found() {
        let store = JobStore::open_in_memory().unwrap();
        let err = store.update_job_status("nope", JobStatus::Running).unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[test]
    fn job_lifecycle_s4() {
        let store = JobStore::open_in_memory().unwrap();
        store.save_job(&sample_job("J1")).unwrap();
        store.update_job_status("J1", JobStatus::Running).unwrap();
        store.update_job_progress("J1", 42.0).unwrap();
        store.update_job_status("J1", JobStatus::Completed).unwrap();

        let job = store.load_job("J1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // Job::transition forces progress to 100.0 on completion.
        assert_eq!(job.progress, 100.0);
    }

    #[test]
    fn stats_s5() {
        let store = JobStore::open_in_memory().unwrap();
        let statuses = [
            JobStatus::Completed,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Running,
            JobStatus::Pending,
        ];
        for (i, status) in statuses.iter().enumerate() {
            let mut job = sample_job(&format!("j{i}"));
            job.status = *status;
            store.save_job(&job).unwrap();
        }

        let stats = store.get_job_stats().unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.success_rate, 40.0);
    }

    #[test]
    fn list_jobs_filters_by_status() {
        let store = JobStore::open_in_memory().unwrap();
        let mut running = sample_job("r1");
        running.status = JobStatus::Running;
        store.save_job(&running).unwrap();
        store.save_job(&sample_job("p1")).unwrap();

        let filter = JobFilter { status: Some(JobStatus::Running), ..Default::default() };
        let jobs = store.list_jobs(&filter).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "r1");
    }

    #[test]
    fn prune_removes_only_old_terminal_jobs() {
        let store = JobStore::open_in_memory().unwrap();

        let mut old_done = sample_job("old");
        old_done.status = JobStatus::Completed;
        old_done.completed_at = Some(Utc::now() - chrono::Duration::days(10));
        store.save_job(&old_done).unwrap();

        let mut recent_done = sample_job("recent");
        recent_done.status = JobStatus::Completed;
        recent_done.completed_at = Some(Utc::now());
        store.save_job(&recent_done).unwrap();

        store.save_job(&sample_job("pending")).unwrap();

        let removed = store.prune(Utc::now() - chrono::Duration::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_job("recent").is_ok());
        assert!(store.load_job("pending").is_ok());
        assert!(store.load_job("old").is_err());
    }

    #[test]
    fn delete_missing_job_is_not_found() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(matches!(store.delete_job("nope"), Err(JobStoreError::NotFound(_))));
    }

    #[test]
    fn metadata_null_round_trips() {
        let store = JobStore::open_in_memory().unwrap();
        let mut job = sample_job("m1");
        job.metadata.insert("note".into(), serde_json::Value::Null);
        store.save_job(&job).unwrap();
        let loaded = store.load_job("m1").unwrap();
        assert_eq!(loaded.metadata.get("note"), Some(&serde_json::Value::Null));
    }
}
