//! Command-line entry point for the vmforge fleet.
//!
//! `submit`, `status`, `list`, `cancel` and `schedule` are short-lived: they
//! open the job store (and, for `schedule`, the persisted schedule file)
//! directly and exit. `serve` is the long-running process that owns the
//! engine's worker pool, the scheduler's ticker, and the HTTP surface —
//! `cancel` on a job already picked up by a worker can only be served by
//! the `serve` process that holds its live `CancellationToken`, so a
//! separate CLI invocation can cancel a `pending` job but not a `running`
//! one.

mod schedule_store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vmforge_config::Config;
use vmforge_engine::Engine;
use vmforge_jobstore::JobStore;
use vmforge_metrics::Metrics;
use vmforge_orchestrator::{MigrationConfig, MigrationOrchestrator, TransferConfig};
use vmforge_progress::Tracker;
use vmforge_scheduler::Scheduler;
use vmforge_types::{Job, JobDefinition, JobFilter, JobStatus, Provider, ScheduledJob};
use vmforge_webhook::Manager as WebhookManager;

#[derive(Parser)]
#[command(name = "vmforge", version, about = "Multi-provider VM export and migration fleet")]
struct Cli {
    /// Directory holding `.vmforge.toml`; relative store/audit/schedule
    /// paths in that file resolve against it.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new migration job.
    Submit {
        #[arg(long)]
        name: Option<String>,
        /// Display name of the VM being exported; defaults to the job name
        /// when omitted.
        #[arg(long)]
        vm_name: Option<String>,
        #[arg(long)]
        vm_path: String,
        #[arg(long, value_parser = parse_provider)]
        provider: Provider,
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Repeatable `key=value` metadata pair.
        #[arg(long = "metadata", value_parser = parse_metadata)]
        metadata: Vec<(String, serde_json::Value)>,
    },
    /// Show one job's current record.
    Status { job_id: String },
    /// List jobs, optionally filtered.
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long, value_parser = parse_provider)]
        provider: Option<Provider>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Cancel a pending job outright; refuse a running one with an
    /// explanation rather than silently doing nothing.
    Cancel { job_id: String },
    /// Manage cron-driven schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Run the worker pool, scheduler and HTTP surface until signalled.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Register a new schedule.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cron: String,
        /// Display name of the VM being exported; defaults to `name` when
        /// omitted.
        #[arg(long)]
        vm_name: Option<String>,
        #[arg(long)]
        vm_path: String,
        #[arg(long, value_parser = parse_provider)]
        provider: Provider,
        #[arg(long)]
        output_dir: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    List,
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Enqueue the schedule's job template immediately, without touching
    /// its `next_run`.
    Trigger { id: String },
    /// Check a cron expression parses, without registering anything.
    Validate { expr: String },
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    match s.to_ascii_lowercase().as_str() {
        "vsphere" => Ok(Provider::Vsphere),
        "ec2" => Ok(Provider::Ec2),
        "azure" => Ok(Provider::Azure),
        "gcp" => Ok(Provider::Gcp),
        "hyperv" | "hyper-v" => Ok(Provider::HyperV),
        "oci" => Ok(Provider::Oci),
        "openstack" => Ok(Provider::OpenStack),
        "alibaba" => Ok(Provider::Alibaba),
        "proxmox" => Ok(Provider::Proxmox),
        other => Err(format!("unknown provider {other:?}")),
    }
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    match s.to_ascii_lowercase().as_str() {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
        other => Err(format!("unknown status {other:?}")),
    }
}

fn parse_metadata(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.to_string(), serde_json::Value::String(value.to_string())))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(config: &Config, config_dir: &Path) -> Result<JobStore> {
    let path = config_dir.join(&config.job_store.path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    JobStore::open(&path).with_context(|| format!("opening job store at {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = vmforge_config::load_config(&cli.config_dir).context("loading .vmforge.toml")?;

    match cli.command {
        Command::Submit { name, vm_name, vm_path, provider, output_dir, user, metadata } => {
            cmd_submit(&cli.config_dir, &config, name, vm_name, vm_path, provider, output_dir, user, metadata)
        }
        Command::Status { job_id } => cmd_status(&cli.config_dir, &config, &job_id),
        Command::List { status, provider, user, limit, offset } => {
            cmd_list(&cli.config_dir, &config, status, provider, user, limit, offset)
        }
        Command::Cancel { job_id } => cmd_cancel(&cli.config_dir, &config, &job_id),
        Command::Schedule { action } => cmd_schedule(&cli.config_dir, &config, action),
        Command::Serve { bind } => cmd_serve(cli.config_dir, config, bind).await,
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_submit(
    config_dir: &Path,
    config: &Config,
    name: Option<String>,
    vm_name: Option<String>,
    vm_path: String,
    provider: Provider,
    output_dir: Option<String>,
    user: Option<String>,
    metadata: Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let store = open_store(config, config_dir)?;
    let id = uuid::Uuid::new_v4().to_string();
    let name = name.unwrap_or_else(|| format!("{provider}-{}", &id[..8]));
    let vm_name = vm_name.unwrap_or_else(|| name.clone());
    let output_dir = output_dir.unwrap_or_else(|| config.default_output_dir.join(&id).to_string_lossy().into_owned());

    let mut job = Job::new(id, name, vm_name, vm_path, provider, output_dir);
    job.user = user;
    job.metadata = metadata.into_iter().collect::<BTreeMap<_, _>>();
    store.save_job(&job).context("saving job")?;

    println!("{}", job.id);
    Ok(())
}

fn cmd_status(config_dir: &Path, config: &Config, job_id: &str) -> Result<()> {
    let store = open_store(config, config_dir)?;
    let job = store.load_job(job_id).context("loading job")?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_list(
    config_dir: &Path,
    config: &Config,
    status: Option<JobStatus>,
    provider: Option<Provider>,
    user: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<()> {
    let store = open_store(config, config_dir)?;
    let filter = JobFilter { status, provider, user, since: None, until: None, limit, offset };
    let jobs = store.list_jobs(&filter).context("listing jobs")?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

fn cmd_cancel(config_dir: &Path, config: &Config, job_id: &str) -> Result<()> {
    let store = open_store(config, config_dir)?;
    let job = store.load_job(job_id).context("loading job")?;
    match job.status {
        JobStatus::Pending => {
            store.update_job_status(job_id, JobStatus::Cancelled).context("cancelling job")?;
            println!("cancelled {job_id}");
            Ok(())
        }
        JobStatus::Running => bail!(
            "job {job_id} is running; only the `vmforge serve` process holding its CancellationToken can cancel \
             a running job — this invocation can only cancel pending jobs directly against the store"
        ),
        other => bail!("job {job_id} is already {other} and cannot be cancelled"),
    }
}

fn cmd_schedule(config_dir: &Path, config: &Config, action: ScheduleAction) -> Result<()> {
    let path = schedule_store::schedules_path(config_dir);

    match action {
        ScheduleAction::Validate { expr } => {
            let schedule = vmforge_scheduler::parse_cron(&expr)?;
            match schedule.after(&chrono::Utc::now()).next() {
                Some(at) => println!("valid, next occurrence: {at}"),
                None => println!("valid, but has no future occurrence"),
            }
            Ok(())
        }
        ScheduleAction::Add { name, cron, vm_name, vm_path, provider, output_dir, description, tags } => {
            let parsed = vmforge_scheduler::parse_cron(&cron)?;
            let next_run = parsed.after(&chrono::Utc::now()).next();
            let mut schedules = schedule_store::load(&path)?;
            let id = uuid::Uuid::new_v4().to_string();
            let now = chrono::Utc::now();
            let vm_name = vm_name.unwrap_or_else(|| name.clone());
            schedules.push(ScheduledJob {
                id: id.clone(),
                name: name.clone(),
                description,
                cron_expression: cron,
                job_template: JobDefinition { name, vm_name, vm_path, provider, output_dir, metadata: BTreeMap::new(), user: None },
                enabled: true,
                created_at: now,
                updated_at: now,
                next_run,
                last_run: None,
                run_count: 0,
                tags,
            });
            schedule_store::save(&path, &schedules)?;
            println!("{id}");
            Ok(())
        }
        ScheduleAction::List => {
            let schedules = schedule_store::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&schedules)?);
            Ok(())
        }
        ScheduleAction::Remove { id } => {
            let mut schedules = schedule_store::load(&path)?;
            let before = schedules.len();
            schedules.retain(|s| s.id != id);
            if schedules.len() == before {
                bail!("schedule {id} not found");
            }
            schedule_store::save(&path, &schedules)?;
            println!("removed {id}");
            Ok(())
        }
        ScheduleAction::Enable { id } => set_schedule_enabled(&path, &id, true),
        ScheduleAction::Disable { id } => set_schedule_enabled(&path, &id, false),
        ScheduleAction::Trigger { id } => {
            let mut schedules = schedule_store::load(&path)?;
            let schedule =
                schedules.iter_mut().find(|s| s.id == id).ok_or_else(|| anyhow::anyhow!("schedule {id} not found"))?;
            let job = schedule.job_template.instantiate(uuid::Uuid::new_v4().to_string());
            schedule.run_count += 1;
            schedule.last_run = Some(chrono::Utc::now());
            let store = open_store(config, config_dir)?;
            store.save_job(&job).context("enqueuing triggered job")?;
            schedule_store::save(&path, &schedules)?;
            println!("{}", job.id);
            Ok(())
        }
    }
}

fn set_schedule_enabled(path: &Path, id: &str, enabled: bool) -> Result<()> {
    let mut schedules = schedule_store::load(path)?;
    let schedule = schedules.iter_mut().find(|s| s.id == id).ok_or_else(|| anyhow::anyhow!("schedule {id} not found"))?;
    schedule.enabled = enabled;
    schedule.updated_at = chrono::Utc::now();
    if enabled && schedule.next_run.is_none() {
        schedule.next_run = vmforge_scheduler::parse_cron(&schedule.cron_expression)?.after(&chrono::Utc::now()).next();
    }
    schedule_store::save(path, &schedules)?;
    println!("{} {id}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

#[derive(Clone)]
struct ServeState {
    tracker: Arc<Tracker>,
    metrics: Arc<Metrics>,
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<ServeState>) -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render_prometheus())
}

async fn stats_handler(State(state): State<ServeState>) -> Json<serde_json::Value> {
    Json(state.metrics.render_stats_json())
}

/// SSE stream of one task's progress: the first event is the current
/// snapshot, every event after that is a change (mirrors
/// [`vmforge_progress::Tracker::subscribe`]'s own contract).
async fn progress_stream(
    State(state): State<ServeState>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let initial = state.tracker.get_progress(&task_id).map_err(|_| StatusCode::NOT_FOUND)?;
    let Some((_id, receiver)) = state.tracker.subscribe(&task_id) else {
        return Err(StatusCode::NOT_FOUND);
    };

    let updates = ReceiverStream::new(receiver);
    let stream = tokio_stream::once(initial).chain(updates).map(|info| Event::default().json_data(info));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cmd_serve(config_dir: PathBuf, config: Config, bind: String) -> Result<()> {
    let store = Arc::new(open_store(&config, &config_dir)?);
    let tracker = Arc::new(Tracker::new());
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(config.audit.to_audit_log());
    let webhooks =
        Arc::new(WebhookManager::new(config.webhooks.iter().map(|destination| destination.to_destination()).collect()));

    let migration_config = MigrationConfig {
        transfer: TransferConfig::default(),
        pipeline: config.pipeline.to_pipeline_config(),
        cloud_storage: config.cloud_storage.clone(),
    };
    // No provider `Exporter` is registered here: provider SDK integration
    // is out of scope. Every submitted job fails fast with
    // `OrchestratorError::NoExporter` until a downstream deployment
    // registers one via `MigrationOrchestrator::with_exporter`.
    let orchestrator =
        MigrationOrchestrator::new(tracker.clone(), metrics.clone(), audit.clone(), webhooks.clone(), migration_config);

    let engine = Arc::new(Engine::new(store.clone(), orchestrator, config.engine.to_engine_config()));
    let worker_handles = engine.spawn();

    let schedules_path = schedule_store::schedules_path(&config_dir);
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    for schedule in schedule_store::load(&schedules_path)? {
        scheduler.add_schedule(schedule).context("loading persisted schedule")?;
    }
    let shutdown = CancellationToken::new();
    let scheduler_handle = scheduler.clone().spawn(config.scheduler.tick_resolution, shutdown.clone());

    let state = ServeState { tracker: tracker.clone(), metrics: metrics.clone() };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/progress-stream/{task_id}", get(progress_stream))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "vmforge serve listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            serve_shutdown.cancel();
        })
        .await
        .context("http server")?;

    engine.shutdown();
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = scheduler_handle.await;
    schedule_store::save(&schedules_path, &scheduler.list_schedules())?;

    Ok(())
}
