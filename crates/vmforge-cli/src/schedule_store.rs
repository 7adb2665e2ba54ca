//! Atomic JSON persistence for [`ScheduledJob`] definitions.
//!
//! [`vmforge_scheduler::Scheduler`] only ever holds schedules in memory, so
//! a short-lived `vmforge schedule` invocation and the long-running
//! `vmforge serve` process exchange them through this file instead: `serve`
//! loads it at startup and saves it back on shutdown, and every other
//! subcommand reads and rewrites it directly. Writes go through a
//! temp-file-then-rename, the same trick [`vmforge_checkpoint`] uses, so a
//! crash mid-write never leaves a truncated file behind.
//!
//! `next_run`/`last_run`/`run_count` only live as accurately as the last
//! save — acceptable here since `next_run` is always recomputable from
//! `cron_expression` if it's ever missing or stale.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use vmforge_types::ScheduledJob;

pub fn schedules_path(config_dir: &Path) -> PathBuf {
    config_dir.join(".vmforge").join("schedules.json")
}

pub fn load(path: &Path) -> Result<Vec<ScheduledJob>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn save(path: &Path, schedules: &[ScheduledJob]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(schedules).context("serializing schedules")?;
    fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
