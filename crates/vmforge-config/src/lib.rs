//! Typed configuration loading for the vmforge fleet.
//!
//! A root `.vmforge.toml` carries the knobs every other crate in this
//! workspace needs at startup: where the job store lives, how many workers
//! the engine runs, the default retry policy, webhook destinations, the
//! scheduler's tick resolution, pipeline defaults, and the audit log's
//! location and rotation policy. Every section is `serde(default)` so a
//! partial or even empty file is valid.
//!
//! Cloud storage credentials are the one thing this file should never
//! carry in plaintext for long-lived fleet hosts, so `VMFORGE_S3_*` env
//! vars override whatever the file says for that section only.
//!
//! # Example
//!
//! ```
//! use vmforge_config::{Config, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! let engine_config = config.engine.to_engine_config();
//! assert!(engine_config.worker_count >= 1);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vmforge_retry::RetryStrategyConfig;
use vmforge_storage::CloudStorageConfig;
use vmforge_types::{WebhookEventFilters, WebhookType};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".vmforge.toml";

/// Get the config file path for a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete vmforge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub job_store: JobStoreConfig,
    #[serde(default)]
    pub engine: EngineSectionConfig,
    #[serde(default)]
    pub scheduler: SchedulerSectionConfig,
    #[serde(default)]
    pub webhooks: Vec<WebhookDestinationConfig>,
    #[serde(default)]
    pub pipeline: PipelineSectionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_storage: Option<CloudStorageConfig>,
    #[serde(default)]
    pub audit: AuditSectionConfig,
    /// Where a job's exported artifacts land when the submitter doesn't
    /// give an explicit output directory.
    #[serde(default = "default_output_dir")]
    pub default_output_dir: PathBuf,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".vmforge/exports")
}

/// Job store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    #[serde(default = "default_job_store_path")]
    pub path: PathBuf,
}

fn default_job_store_path() -> PathBuf {
    PathBuf::from(".vmforge/jobs.sqlite3")
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self { path: default_job_store_path() }
    }
}

/// Worker pool sizing and default retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSectionConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub retry: RetryStrategyConfig,
}

fn default_worker_count() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

impl Default for EngineSectionConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval: default_poll_interval(),
            retry: RetryStrategyConfig::default(),
        }
    }
}

impl EngineSectionConfig {
    pub fn to_engine_config(&self) -> vmforge_engine::EngineConfig {
        vmforge_engine::EngineConfig {
            worker_count: self.worker_count.max(1),
            poll_interval: self.poll_interval,
            retry: self.retry.clone(),
        }
    }
}

/// Cron ticker cadence: fixed resolution, <= 1 second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSectionConfig {
    #[serde(default = "default_tick_resolution")]
    #[serde(with = "humantime_serde")]
    pub tick_resolution: Duration,
}

fn default_tick_resolution() -> Duration {
    Duration::from_secs(1)
}

impl Default for SchedulerSectionConfig {
    fn default() -> Self {
        Self { tick_resolution: default_tick_resolution() }
    }
}

/// One configured webhook target, in a serializable shape that
/// mirrors [`vmforge_webhook::WebhookDestination`] with humantime
/// durations instead of raw `Duration` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDestinationConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub webhook_type: WebhookType,
    #[serde(default)]
    pub filters: WebhookEventFilters,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_webhook_retry_delay")]
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_webhook_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_webhook_max_retries() -> u32 {
    3
}

fn default_webhook_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

impl WebhookDestinationConfig {
    pub fn to_destination(&self) -> vmforge_webhook::WebhookDestination {
        let mut destination =
            vmforge_webhook::WebhookDestination::new(self.name.clone(), self.url.clone(), self.webhook_type)
                .with_filters(self.filters);
        destination.max_retries = self.max_retries.max(1);
        destination.retry_delay = self.retry_delay;
        destination.timeout = self.timeout;
        destination
    }
}

/// Converter and libvirt defaults, mirroring
/// [`vmforge_pipeline::Hyper2KvmConfig`] field-for-field with humantime
/// durations so it can be parsed straight out of TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyper2kvm_path: Option<String>,
    #[serde(default)]
    pub manifest_path: String,
    #[serde(default)]
    pub libvirt_integration: bool,
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub use_daemon: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_instance: Option<String>,
    #[serde(default = "default_daemon_watch_dir")]
    pub daemon_watch_dir: PathBuf,
    #[serde(default = "default_daemon_output_dir")]
    pub daemon_output_dir: PathBuf,
    #[serde(default = "default_daemon_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub daemon_poll_interval: Duration,
    #[serde(default = "default_daemon_timeout")]
    #[serde(with = "humantime_serde")]
    pub daemon_timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_daemon_watch_dir() -> PathBuf {
    PathBuf::from("/var/lib/hyper2kvm/watch")
}

fn default_daemon_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/hyper2kvm/output")
}

fn default_daemon_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_daemon_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for PipelineSectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            hyper2kvm_path: None,
            manifest_path: String::new(),
            libvirt_integration: false,
            libvirt_uri: default_libvirt_uri(),
            autostart: false,
            verbose: false,
            dry_run: false,
            use_daemon: false,
            daemon_instance: None,
            daemon_watch_dir: default_daemon_watch_dir(),
            daemon_output_dir: default_daemon_output_dir(),
            daemon_poll_interval: default_daemon_poll_interval(),
            daemon_timeout: default_daemon_timeout(),
        }
    }
}

impl PipelineSectionConfig {
    pub fn to_pipeline_config(&self) -> vmforge_pipeline::Hyper2KvmConfig {
        vmforge_pipeline::Hyper2KvmConfig {
            enabled: self.enabled,
            hyper2kvm_path: self.hyper2kvm_path.clone(),
            manifest_path: self.manifest_path.clone(),
            libvirt_integration: self.libvirt_integration,
            libvirt_uri: self.libvirt_uri.clone(),
            autostart: self.autostart,
            verbose: self.verbose,
            dry_run: self.dry_run,
            use_daemon: self.use_daemon,
            daemon_instance: self.daemon_instance.clone(),
            daemon_watch_dir: self.daemon_watch_dir.clone(),
            daemon_output_dir: self.daemon_output_dir.clone(),
            daemon_poll_interval: self.daemon_poll_interval,
            daemon_timeout: self.daemon_timeout,
        }
    }
}

/// Audit log location and rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSectionConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    #[serde(default = "default_audit_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_audit_retain")]
    pub retain: u32,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from(".vmforge/audit.log")
}

fn default_audit_max_bytes() -> u64 {
    vmforge_audit::DEFAULT_MAX_BYTES
}

fn default_audit_retain() -> u32 {
    vmforge_audit::DEFAULT_RETAIN
}

impl Default for AuditSectionConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            max_bytes: default_audit_max_bytes(),
            retain: default_audit_retain(),
        }
    }
}

impl AuditSectionConfig {
    pub fn to_audit_log(&self) -> vmforge_audit::AuditLog {
        vmforge_audit::AuditLog::with_rotation(self.path.clone(), self.max_bytes, self.retain)
    }
}

const ENV_S3_ACCESS_KEY_ID: &str = "VMFORGE_S3_ACCESS_KEY_ID";
const ENV_S3_SECRET_ACCESS_KEY: &str = "VMFORGE_S3_SECRET_ACCESS_KEY";
const ENV_S3_SESSION_TOKEN: &str = "VMFORGE_S3_SESSION_TOKEN";

/// Overlay secret-bearing env vars onto whatever the file said, so
/// credentials never have to sit in `.vmforge.toml` on a long-lived host.
fn apply_env_overrides(config: &mut Config) {
    let Some(storage) = config.cloud_storage.as_mut() else { return };
    if let Ok(v) = std::env::var(ENV_S3_ACCESS_KEY_ID) {
        storage.access_key_id = Some(v);
    }
    if let Ok(v) = std::env::var(ENV_S3_SECRET_ACCESS_KEY) {
        storage.secret_access_key = Some(v);
    }
    if let Ok(v) = std::env::var(ENV_S3_SESSION_TOKEN) {
        storage.session_token = Some(v);
    }
}

/// Load configuration from a directory (looks for `.vmforge.toml`).
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path.
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return Ok(config);
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?;
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Save configuration to a file.
pub fn save_config(dir: &Path, config: &Config) -> Result<()> {
    let path = config_path(dir);
    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;
    std::fs::write(&path, content).with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Find a `.vmforge.toml` by walking up from `start_dir`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;
    use vmforge_storage::StorageType;

    #[test]
    fn default_config() {
        let config = Config::new();
        assert_eq!(config.engine.worker_count, 4);
        assert_eq!(config.job_store.path, PathBuf::from(".vmforge/jobs.sqlite3"));
        assert!(config.webhooks.is_empty());
        assert!(config.cloud_storage.is_none());
    }

    #[test]
    fn load_missing_config_returns_default() {
        let td = tempdir().expect("tempdir");
        let config = load_config(td.path()).expect("load");
        assert_eq!(config.scheduler.tick_resolution, Duration::from_secs(1));
    }

    #[test]
    fn save_and_load_config() {
        let td = tempdir().expect("tempdir");

        let mut config = Config::new();
        config.job_store.path = PathBuf::from("/data/jobs.sqlite3");
        config.engine.worker_count = 8;

        save_config(td.path(), &config).expect("save");

        let loaded = load_config(td.path()).expect("load");
        assert_eq!(loaded.job_store.path, PathBuf::from("/data/jobs.sqlite3"));
        assert_eq!(loaded.engine.worker_count, 8);
    }

    #[test]
    fn load_config_from_toml() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);

        let content = r#"
[job_store]
path = "/var/lib/vmforge/jobs.sqlite3"

[engine]
worker_count = 16
poll_interval = "250ms"

[scheduler]
tick_resolution = "500ms"

[[webhooks]]
name = "ops-slack"
url = "https://hooks.slack.com/services/x"
webhook_type = "slack"

[pipeline]
libvirt_integration = true
daemon_timeout = "10m"

[audit]
path = "/var/log/vmforge/audit.log"
"#;
        std::fs::write(&path, content).expect("write");

        let config = load_config(td.path()).expect("load");

        assert_eq!(config.job_store.path, PathBuf::from("/var/lib/vmforge/jobs.sqlite3"));
        assert_eq!(config.engine.worker_count, 16);
        assert_eq!(config.engine.poll_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.tick_resolution, Duration::from_millis(500));
        assert_eq!(config.webhooks.len(), 1);
        assert_eq!(config.webhooks[0].name, "ops-slack");
        assert_eq!(config.webhooks[0].webhook_type, WebhookType::Slack);
        assert!(config.pipeline.libvirt_integration);
        assert_eq!(config.pipeline.daemon_timeout, Duration::from_secs(600));
        assert_eq!(config.audit.path, PathBuf::from("/var/log/vmforge/audit.log"));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);

        std::fs::write(&path, "[engine]\nworker_count = 2\n").expect("write");

        let config = load_config(td.path()).expect("load");

        assert_eq!(config.engine.worker_count, 2);
        assert_eq!(config.engine.poll_interval, Duration::from_millis(500)); // default
        assert_eq!(config.audit.max_bytes, vmforge_audit::DEFAULT_MAX_BYTES); // default
    }

    #[test]
    fn find_config_walks_up() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).expect("create dirs");

        let config_file = td.path().join(CONFIG_FILE);
        std::fs::write(&config_file, "[job_store]\npath = 'jobs.sqlite3'\n").expect("write");

        let found = find_config(&nested);
        assert_eq!(found, Some(config_file));
    }

    #[test]
    fn find_config_returns_none_if_not_found() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create dirs");

        assert!(find_config(&nested).is_none());
    }

    #[test]
    fn config_path_helper() {
        let dir = PathBuf::from("/project");
        assert_eq!(config_path(&dir), PathBuf::from("/project/.vmforge.toml"));
    }

    #[test]
    fn webhook_destination_config_converts() {
        let cfg = WebhookDestinationConfig {
            name: "primary".to_string(),
            url: "https://example.invalid/hook".to_string(),
            webhook_type: WebhookType::Discord,
            filters: WebhookEventFilters { on_start: false, on_complete: true, on_error: true, on_warning: true },
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(3),
        };
        let destination = cfg.to_destination();
        assert_eq!(destination.name, "primary");
        assert_eq!(destination.max_retries, 5);
        assert_eq!(destination.timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn env_overrides_apply_only_to_secrets() {
        // SAFETY: serialized by #[serial] against other tests mutating the same env vars.
        unsafe {
            std::env::set_var(ENV_S3_SECRET_ACCESS_KEY, "from-env");
        }

        let mut config = Config {
            cloud_storage: Some(CloudStorageConfig::new(StorageType::S3, "exports-bucket")),
            ..Config::default()
        };
        apply_env_overrides(&mut config);

        assert_eq!(config.cloud_storage.unwrap().secret_access_key.as_deref(), Some("from-env"));

        unsafe {
            std::env::remove_var(ENV_S3_SECRET_ACCESS_KEY);
        }
    }
}
