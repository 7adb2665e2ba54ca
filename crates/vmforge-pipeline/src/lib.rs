//! Post-export pipeline executor: runs the disk converter either as
//! a direct subprocess or by dropping the manifest for a watching daemon,
//! then optionally defines a libvirt domain for the result.
//!
//! State machine (executor viewpoint):
//! `START → VALIDATE_INPUTS → CHOOSE_MODE → {DIRECT_RUN | DAEMON_SUBMIT+POLL}
//! → PARSE_OUTPUT → (LIBVIRT_DEFINE)? → DONE`, with libvirt failures demoted
//! to warnings rather than aborting the run.

pub mod libvirt;

use std::path::{Path, PathBuf};
use std::time::Duration;

use vmforge_manifest::ArtifactManifest;

pub use libvirt::DomainParams;

/// Converter and libvirt configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct Hyper2KvmConfig {
    pub enabled: bool,
    /// Converter binary path. Empty means "auto-resolve": well-known
    /// locations first, then `$PATH`.
    pub hyper2kvm_path: Option<String>,
    pub manifest_path: String,
    pub libvirt_integration: bool,
    pub libvirt_uri: String,
    pub autostart: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub use_daemon: bool,
    pub daemon_instance: Option<String>,
    pub daemon_watch_dir: PathBuf,
    pub daemon_output_dir: PathBuf,
    pub daemon_poll_interval: Duration,
    pub daemon_timeout: Duration,
}

impl Default for Hyper2KvmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hyper2kvm_path: None,
            manifest_path: String::new(),
            libvirt_integration: false,
            libvirt_uri: "qemu:///system".to_string(),
            autostart: false,
            verbose: false,
            dry_run: false,
            use_daemon: false,
            daemon_instance: None,
            daemon_watch_dir: PathBuf::from("/var/lib/hyper2kvm/watch"),
            daemon_output_dir: PathBuf::from("/var/lib/hyper2kvm/output"),
            daemon_poll_interval: Duration::from_secs(2),
            daemon_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Locations checked before falling back to `$PATH` when
/// [`Hyper2KvmConfig::hyper2kvm_path`] is unset.
const WELL_KNOWN_CONVERTER_PATHS: &[&str] = &[
    "/usr/local/bin/hyper2kvm",
    "/usr/bin/hyper2kvm",
    "/opt/hyper2kvm/bin/hyper2kvm",
];

/// Resolve the converter binary: explicit path, then well-known locations,
/// then `$PATH` via `which`.
pub fn resolve_converter_path(configured: Option<&str>) -> Result<String, PipelineError> {
    if let Some(path) = configured.filter(|p| !p.is_empty()) {
        return Ok(path.to_string());
    }
    for candidate in WELL_KNOWN_CONVERTER_PATHS {
        if Path::new(candidate).is_file() {
            return Ok((*candidate).to_string());
        }
    }
    vmforge_process::which("hyper2kvm")
        .map(|p| p.to_string_lossy().into_owned())
        .ok_or(PipelineError::ConverterNotFound)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Direct,
    Daemon,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub mode: ExecutionMode,
    pub output_path: Option<String>,
    pub output: Vec<String>,
    pub warnings: Vec<String>,
    pub libvirt_defined: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline disabled")]
    Disabled,
    #[error("could not resolve the hyper2kvm converter binary")]
    ConverterNotFound,
    #[error("converter exited with a non-zero status: {0}")]
    ConverterFailed(String),
    #[error("converter run timed out")]
    TimedOut,
    #[error("daemon reported a conversion error: {0}")]
    DaemonError(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Minimal human-facing reporter: info/warn/error lines plus a
/// structured-logging mirror.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Reporter that only emits through `tracing`.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Scan converter output lines for the recovered output path: lines
/// beginning with `Output:` or `Wrote:`.
pub fn scan_output_path(lines: &[String]) -> Option<String> {
    for line in lines {
        let trimmed = line.trim();
        for prefix in ["Output:", "Wrote:"] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let path = rest.trim();
                if !path.is_empty() {
                    return Some(path.to_string());
                }
            }
        }
    }
    None
}

/// Synthesize an output path from `manifest.output.{directory,filename}`
/// when the converter's own output doesn't surface one.
pub fn synthesize_output_path(manifest: &ArtifactManifest, output: &vmforge_manifest::OutputConfig) -> Option<String> {
    let filename = output.filename.clone().or_else(|| {
        manifest
            .vm
            .as_ref()
            .and_then(|vm| vm.os_hint.clone())
            .map(|_| format!("{}.qcow2", manifest.disks.first()?.id))
    })?;
    let directory = output.directory.clone().unwrap_or_else(|| ".".to_string());
    Some(format!("{}/{}", directory.trim_end_matches('/'), filename))
}

/// Check whether `hyper2kvm[@instance].service` is active, the way a
/// systemd host reports unit state. Missing `systemctl` (e.g. non-systemd
/// hosts, test sandboxes) is treated as inactive, not an error.
pub fn daemon_service_active(instance: Option<&str>) -> bool {
    let unit = match instance {
        Some(instance) => format!("hyper2kvm@{instance}.service"),
        None => "hyper2kvm.service".to_string(),
    };
    vmforge_process::run_command_simple("systemctl", &["is-active", "--quiet", &unit]).unwrap_or(false)
}

/// Choose [`ExecutionMode`]: daemon mode only when requested and
/// the host reports the unit active; direct mode otherwise, with a warning
/// surfaced through `reporter` when the fallback happens.
pub fn choose_mode(config: &Hyper2KvmConfig, reporter: &dyn Reporter) -> ExecutionMode {
    if config.use_daemon {
        if daemon_service_active(config.daemon_instance.as_deref()) {
            return ExecutionMode::Daemon;
        }
        reporter.warn("UseDaemon set but hyper2kvm service is not active; falling back to direct mode");
    }
    ExecutionMode::Direct
}

/// Run the converter in direct mode: spawn the binary, scan its output for
/// the recovered artifact path.
pub fn run_direct(
    converter_path: &str,
    config: &Hyper2KvmConfig,
    manifest: &ArtifactManifest,
    output_config: &vmforge_manifest::OutputConfig,
    reporter: &dyn Reporter,
) -> Result<PipelineResult, PipelineError> {
    let mut args: Vec<&str> = vec![&config.manifest_path];
    if config.verbose {
        args.push("-v");
    }
    if config.dry_run {
        args.push("--dry-run");
    }

    let working_dir = Path::new(".");
    let result = vmforge_process::run_command_with_timeout(converter_path, &args, working_dir, None)?;

    let lines: Vec<String> = result
        .stdout
        .lines()
        .chain(result.stderr.lines())
        .map(|l| l.to_string())
        .collect();
    for line in &lines {
        reporter.info(line);
    }

    if result.exit_code != 0 {
        return Err(PipelineError::ConverterFailed(format!(
            "exit code {}: {}",
            result.exit_code, result.stderr
        )));
    }

    let output_path = scan_output_path(&lines).or_else(|| synthesize_output_path(manifest, output_config));

    Ok(PipelineResult {
        mode: ExecutionMode::Direct,
        output_path,
        output: lines,
        warnings: Vec::new(),
        libvirt_defined: false,
    })
}

/// Drive daemon mode: drop the manifest into the watch directory, then poll
/// the output directory until the success/error marker appears or
/// `daemon_timeout` elapses.
pub async fn run_daemon(config: &Hyper2KvmConfig, vm_name: &str, reporter: &dyn Reporter) -> Result<PipelineResult, PipelineError> {
    let dropped = libvirt::copy_into(Path::new(&config.manifest_path), &config.daemon_watch_dir)?;
    reporter.info(&format!("dropped manifest at {}", dropped.display()));

    let success_marker = config.daemon_output_dir.join(format!("{vm_name}.qcow2"));
    let error_marker = config.daemon_output_dir.join(format!("{vm_name}.error"));

    let deadline = tokio::time::Instant::now() + config.daemon_timeout;
    loop {
        if success_marker.exists() {
            return Ok(PipelineResult {
                mode: ExecutionMode::Daemon,
                output_path: Some(success_marker.to_string_lossy().into_owned()),
                output: vec![format!("daemon produced {}", success_marker.display())],
                warnings: Vec::new(),
                libvirt_defined: false,
            });
        }
        if error_marker.exists() {
            let message = tokio::fs::read_to_string(&error_marker).await.unwrap_or_default();
            return Err(PipelineError::DaemonError(message));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PipelineError::TimedOut);
        }
        tokio::time::sleep(config.daemon_poll_interval).await;
    }
}

/// Apply the optional post-step: render and define a libvirt domain. Any
/// failure is appended to `result.warnings` rather than propagated — a
/// libvirt failure is logged but not fatal to the pipeline.
pub fn apply_libvirt_define(config: &Hyper2KvmConfig, params: &DomainParams, result: &mut PipelineResult, reporter: &dyn Reporter) {
    if !config.libvirt_integration {
        return;
    }
    let xml = libvirt::render_domain_xml(params);
    match libvirt::define_domain(&config.libvirt_uri, &xml) {
        Ok(define_result) if define_result.success => {
            result.libvirt_defined = true;
            reporter.info(&format!("defined libvirt domain {}", params.name));
            if config.autostart {
                if let Err(e) = libvirt::autostart_domain(&config.libvirt_uri, &params.name) {
                    let message = format!("libvirt autostart failed: {e}");
                    reporter.warn(&message);
                    result.warnings.push(message);
                }
            }
        }
        Ok(define_result) => {
            let message = format!("libvirt define failed: {}", define_result.stderr);
            reporter.warn(&message);
            result.warnings.push(message);
        }
        Err(e) => {
            let message = format!("libvirt define failed: {e}");
            reporter.warn(&message);
            result.warnings.push(message);
        }
    }
}

/// Run the full pipeline for one VM: mode selection, converter invocation,
/// and the optional libvirt define step.
pub async fn run_pipeline(
    config: &Hyper2KvmConfig,
    manifest: &ArtifactManifest,
    output_config: &vmforge_manifest::OutputConfig,
    vm_name: &str,
    domain_params: Option<&DomainParams>,
    reporter: &dyn Reporter,
) -> Result<PipelineResult, PipelineError> {
    if !config.enabled {
        return Err(PipelineError::Disabled);
    }

    let mode = choose_mode(config, reporter);
    let mut result = match mode {
        ExecutionMode::Direct => {
            let converter_path = resolve_converter_path(config.hyper2kvm_path.as_deref())?;
            run_direct(&converter_path, config, manifest, output_config, reporter)?
        }
        ExecutionMode::Daemon => run_daemon(config, vm_name, reporter).await?,
    };

    if let Some(params) = domain_params {
        apply_libvirt_define(config, params, &mut result, reporter);
    }

    Ok(result)
}
