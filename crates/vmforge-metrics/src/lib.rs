//! Fleet-wide migration metrics, exported as Prometheus text exposition
//!.
//!
//! The taxonomy is small and fixed, so the exposition text is built by hand
//! rather than pulling in the full `prometheus` crate — matching the way
//! `vmforge-webhook` hand-builds its JSON payloads instead of reaching for a
//! templating engine. All mutation happens under one mutex; reads take the
//! same lock and compose the text on demand (no separate read path needed
//! given the taxonomy's size).

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use vmforge_types::Provider;

#[derive(Debug, Default)]
struct Inner {
    migrations_total: u64,
    migrations_succeeded: u64,
    migrations_failed: u64,
    bytes_exported: u64,
    bytes_converted: u64,
    bytes_uploaded: u64,
    active_migrations: i64,
    per_provider_migrations: BTreeMap<String, u64>,
    stage_duration_totals_ms: BTreeMap<String, u64>,
    stage_duration_counts: BTreeMap<String, u64>,
}

/// Fleet metrics collector. Construct once per process and share via
/// `Arc`.
pub struct Metrics {
    inner: Mutex<Inner>,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            started_at: Instant::now(),
        }
    }

    /// Call when a migration begins: bumps `migrations_total`, the
    /// per-provider counter, and the active gauge.
    pub fn record_migration_start(&self, provider: Provider) {
        let mut inner = self.inner.lock().unwrap();
        inner.migrations_total += 1;
        inner.active_migrations += 1;
        *inner.per_provider_migrations.entry(provider.to_string()).or_insert(0) += 1;
    }

    pub fn record_migration_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.migrations_succeeded += 1;
        inner.active_migrations -= 1;
    }

    pub fn record_migration_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.migrations_failed += 1;
        inner.active_migrations -= 1;
    }

    pub fn add_bytes_exported(&self, n: u64) {
        self.inner.lock().unwrap().bytes_exported += n;
    }

    pub fn add_bytes_converted(&self, n: u64) {
        self.inner.lock().unwrap().bytes_converted += n;
    }

    pub fn add_bytes_uploaded(&self, n: u64) {
        self.inner.lock().unwrap().bytes_uploaded += n;
    }

    pub fn record_stage_duration(&self, stage: &str, duration_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.stage_duration_totals_ms.entry(stage.to_string()).or_insert(0) += duration_ms;
        *inner.stage_duration_counts.entry(stage.to_string()).or_insert(0) += 1;
    }

    fn success_rate(inner: &Inner) -> f64 {
        if inner.migrations_total == 0 {
            0.0
        } else {
            (inner.migrations_succeeded as f64 / inner.migrations_total as f64) * 100.0
        }
    }

    fn average_stage_durations(inner: &Inner) -> BTreeMap<String, f64> {
        inner
            .stage_duration_totals_ms
            .iter()
            .map(|(stage, total)| {
                let count = inner.stage_duration_counts.get(stage).copied().unwrap_or(1).max(1);
                (stage.clone(), *total as f64 / count as f64)
            })
            .collect()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Render the Prometheus text exposition format (`text/plain;
    /// version=0.0.4`) for the fixed counter/gauge taxonomy.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = String::new();

        out.push_str("# HELP vmforge_migrations_total Total migrations started.\n");
        out.push_str("# TYPE vmforge_migrations_total counter\n");
        out.push_str(&format!("vmforge_migrations_total {}\n", inner.migrations_total));

        out.push_str("# HELP vmforge_migrations_succeeded_total Migrations that completed successfully.\n");
        out.push_str("# TYPE vmforge_migrations_succeeded_total counter\n");
        out.push_str(&format!("vmforge_migrations_succeeded_total {}\n", inner.migrations_succeeded));

        out.push_str("# HELP vmforge_migrations_failed_total Migrations that failed.\n");
        out.push_str("# TYPE vmforge_migrations_failed_total counter\n");
        out.push_str(&format!("vmforge_migrations_failed_total {}\n", inner.migrations_failed));

        out.push_str("# HELP vmforge_bytes_exported_total Bytes read from the source hypervisor.\n");
        out.push_str("# TYPE vmforge_bytes_exported_total counter\n");
        out.push_str(&format!("vmforge_bytes_exported_total {}\n", inner.bytes_exported));

        out.push_str("# HELP vmforge_bytes_converted_total Bytes produced by the converter.\n");
        out.push_str("# TYPE vmforge_bytes_converted_total counter\n");
        out.push_str(&format!("vmforge_bytes_converted_total {}\n", inner.bytes_converted));

        out.push_str("# HELP vmforge_bytes_uploaded_total Bytes written to the upload backend.\n");
        out.push_str("# TYPE vmforge_bytes_uploaded_total counter\n");
        out.push_str(&format!("vmforge_bytes_uploaded_total {}\n", inner.bytes_uploaded));

        out.push_str("# HELP vmforge_stage_duration_ms_total Cumulative stage durations in milliseconds.\n");
        out.push_str("# TYPE vmforge_stage_duration_ms_total counter\n");
        for (stage, total) in &inner.stage_duration_totals_ms {
            out.push_str(&format!("vmforge_stage_duration_ms_total{{stage=\"{stage}\"}} {total}\n"));
        }

        out.push_str("# HELP vmforge_provider_migrations_total Migrations per source provider.\n");
        out.push_str("# TYPE vmforge_provider_migrations_total counter\n");
        for (provider, count) in &inner.per_provider_migrations {
            out.push_str(&format!("vmforge_provider_migrations_total{{provider=\"{provider}\"}} {count}\n"));
        }

        out.push_str("# HELP vmforge_active_migrations Migrations currently running.\n");
        out.push_str("# TYPE vmforge_active_migrations gauge\n");
        out.push_str(&format!("vmforge_active_migrations {}\n", inner.active_migrations));

        out.push_str("# HELP vmforge_success_rate_percent Success rate over all migrations seen.\n");
        out.push_str("# TYPE vmforge_success_rate_percent gauge\n");
        out.push_str(&format!("vmforge_success_rate_percent {}\n", Self::success_rate(&inner)));

        out.push_str("# HELP vmforge_stage_duration_ms_avg Average stage duration in milliseconds.\n");
        out.push_str("# TYPE vmforge_stage_duration_ms_avg gauge\n");
        for (stage, avg) in Self::average_stage_durations(&inner) {
            out.push_str(&format!("vmforge_stage_duration_ms_avg{{stage=\"{stage}\"}} {avg}\n"));
        }

        out.push_str("# HELP vmforge_uptime_seconds Seconds since the process started.\n");
        out.push_str("# TYPE vmforge_uptime_seconds gauge\n");
        out.push_str(&format!("vmforge_uptime_seconds {}\n", self.started_at.elapsed().as_secs()));

        out
    }

    /// Render the same values as a JSON object, for the `/stats` endpoint
    ///.
    pub fn render_stats_json(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "migrations_total": inner.migrations_total,
            "migrations_succeeded": inner.migrations_succeeded,
            "migrations_failed": inner.migrations_failed,
            "bytes_exported": inner.bytes_exported,
            "bytes_converted": inner.bytes_converted,
            "bytes_uploaded": inner.bytes_uploaded,
            "active_migrations": inner.active_migrations,
            "success_rate_percent": Self::success_rate(&inner),
            "per_provider_migrations": inner.per_provider_migrations,
            "average_stage_duration_ms": Self::average_stage_durations(&inner),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_zero_with_no_migrations() {
        let metrics = Metrics::new();
        assert_eq!(metrics.render_stats_json()["success_rate_percent"], 0.0);
    }

    #[test]
    fn success_rate_reflects_outcomes() {
        let metrics = Metrics::new();
        metrics.record_migration_start(Provider::Vsphere);
        metrics.record_migration_start(Provider::Ec2);
        metrics.record_migration_success();
        metrics.record_migration_failure();
        assert_eq!(metrics.render_stats_json()["success_rate_percent"], 50.0);
        assert_eq!(metrics.render_stats_json()["active_migrations"], 0);
    }

    #[test]
    fn prometheus_exposition_contains_help_and_type_lines() {
        let metrics = Metrics::new();
        metrics.record_migration_start(Provider::Proxmox);
        let text = metrics.render_prometheus();
        assert!(text.contains("# HELP vmforge_migrations_total"));
        assert!(text.contains("# TYPE vmforge_migrations_total counter"));
        assert!(text.contains("vmforge_provider_migrations_total{provider=\"proxmox\"} 1"));
    }

    #[test]
    fn stage_duration_average_divides_by_count() {
        let metrics = Metrics::new();
        metrics.record_stage_duration("convert", 100);
        metrics.record_stage_duration("convert", 300);
        let text = metrics.render_prometheus();
        assert!(text.contains("vmforge_stage_duration_ms_avg{stage=\"convert\"} 200"));
    }

    #[test]
    fn bytes_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_bytes_exported(1024);
        metrics.add_bytes_exported(2048);
        assert_eq!(metrics.render_stats_json()["bytes_exported"], 3072);
    }
}
