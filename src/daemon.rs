//! The daemon core: one instance per node.
//!
//! Owns the job store handle, the capacity accountant, the process registry
//! and the notifier registry, and exposes the operations the RPC layer
//! calls. The dispatcher loop and the per-job supervisors live in their own
//! modules and borrow the daemon through an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capacity::{CapacityMode, CpuAccountant};
use crate::config::Settings;
use crate::error::PybsError;
use crate::header;
use crate::jobstore::{Job, JobState, JobStore};
use crate::notify::Notifier;
use crate::supervisor::{self, ProcessRegistry};

pub struct Daemon {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) capacity: CpuAccountant,
    pub(crate) registry: ProcessRegistry,
    pub(crate) notifiers: HashMap<String, Arc<dyn Notifier>>,
    pub(crate) node: String,
    pub(crate) root: PathBuf,
    pub(crate) warmup: Duration,
    pub(crate) tick: Duration,
    /// Supervisor tasks currently alive; shutdown waits for zero.
    active: AtomicUsize,
}

/// One job as reported by the `list_*` RPC views. Timestamps are UNIX
/// seconds with fractional part, the format the clients have always shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub ncpus: i32,
    pub priority: i32,
    pub nodes: Option<String>,
    pub node: Option<String>,
    /// Absolute path under the daemon's root.
    pub filename: String,
    pub submitted: f64,
    pub started: Option<f64>,
    pub finished: Option<f64>,
}

impl JobInfo {
    fn from_job(job: &Job, root: &std::path::Path) -> Self {
        let to_unix = |ts: chrono::DateTime<Utc>| ts.timestamp_micros() as f64 / 1e6;
        JobInfo {
            id: job.id,
            name: job.name.clone(),
            username: job.username.clone(),
            ncpus: job.ncpus,
            priority: job.priority,
            nodes: job.nodes.clone(),
            node: job.node.clone(),
            filename: root.join(&job.filename).display().to_string(),
            submitted: to_unix(job.submitted),
            started: job.started.map(to_unix),
            finished: job.finished.map(to_unix),
        }
    }
}

/// Runtime parameters reported by the `config` RPC.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigView {
    pub ncpus: i64,
    pub node: String,
    pub root: String,
    pub capacity_mode: CapacityMode,
}

impl Daemon {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn JobStore>,
        notifiers: HashMap<String, Arc<dyn Notifier>>,
    ) -> Self {
        Daemon {
            store,
            capacity: CpuAccountant::new(settings.capacity_mode, settings.ncpus),
            registry: ProcessRegistry::new(),
            notifiers,
            node: settings.node_name(),
            root: settings.root.clone(),
            warmup: Duration::from_secs(settings.warmup_secs),
            tick: Duration::from_secs(settings.tick_secs),
            active: AtomicUsize::new(0),
        }
    }

    /// Startup reconciliation: RUNNING rows bound to this node have no
    /// supervisor anymore (they belonged to a previous daemon process), so
    /// stamp them finished before dispatching anything new.
    pub async fn start(&self) -> Result<(), PybsError> {
        let stamped = self.store.finish_stale(&self.node, Utc::now()).await?;
        if stamped > 0 {
            warn!(count = stamped, "closed orphaned running jobs from a previous daemon");
        }
        Ok(())
    }

    /// Parse a script's header and enqueue it as a WAITING row.
    pub async fn submit(&self, filename: &str, user: &str) -> Result<i64, PybsError> {
        let path = std::path::Path::new(filename);
        if !path.exists() {
            return Err(PybsError::validation("file does not exist"));
        }

        let job = header::job_request(path, &self.root, user)?;
        let id = self.store.insert(job).await?;
        info!(id, filename, user, "submitted new job");
        Ok(id)
    }

    pub async fn list_waiting(&self) -> Result<Vec<JobInfo>, PybsError> {
        let jobs = self.store.list_waiting().await?;
        Ok(jobs.iter().map(|j| JobInfo::from_job(j, &self.root)).collect())
    }

    pub async fn list_running(&self) -> Result<Vec<JobInfo>, PybsError> {
        let jobs = self.store.list_running().await?;
        Ok(jobs.iter().map(|j| JobInfo::from_job(j, &self.root)).collect())
    }

    pub async fn list_finished(&self, limit: i64) -> Result<Vec<JobInfo>, PybsError> {
        let jobs = self.store.list_finished(limit).await?;
        Ok(jobs.iter().map(|j| JobInfo::from_job(j, &self.root)).collect())
    }

    /// Delete a job in any state; the row is shared, so this works through
    /// any daemon in the cluster. A job running on this node is killed.
    /// Capacity is never touched here — the owning supervisor pairs the
    /// claim's charge with its release when it observes the exit (or the
    /// missing row).
    pub async fn remove(&self, job_id: i64) -> Result<(), PybsError> {
        let Some(job) = self.store.delete(job_id).await? else {
            return Err(PybsError::NotFound(job_id));
        };
        info!(job_id, "deleted job");

        if job.state() == JobState::Running
            && job.node.as_deref() == Some(&self.node)
            && let Some(pid) = self.registry.pid(job_id)
        {
            info!(job_id, pid, "killing running process");
            supervisor::kill_process(pid);
        }
        Ok(())
    }

    /// CPUs (used, total) on this node.
    pub async fn get_cpus(&self) -> Result<(i64, i64), PybsError> {
        let used = self.capacity.used(self.store.as_ref(), &self.node).await?;
        Ok((used, self.capacity.total()))
    }

    pub fn config_view(&self) -> ConfigView {
        ConfigView {
            ncpus: self.capacity.total(),
            node: self.node.clone(),
            root: self.root.display().to_string(),
            capacity_mode: self.capacity.mode(),
        }
    }

    /// Change a runtime parameter. Only `ncpus` is writable.
    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), PybsError> {
        match key {
            "ncpus" => {
                let ncpus = value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        PybsError::validation("ncpus must be a non-negative integer")
                    })?;
                info!(ncpus, "capacity changed");
                self.capacity.set_total(ncpus);
                Ok(())
            }
            other => Err(PybsError::Validation(format!("unknown config key: {other}"))),
        }
    }

    /// PID of a job's child process, if it is running on this node.
    pub fn process_pid(&self, job_id: i64) -> Option<u32> {
        self.registry.pid(job_id)
    }

    /// Number of live supervisor tasks on this node.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn job_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_ended(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wait for in-flight supervisors to drain. Called on shutdown after
    /// the dispatcher and RPC loops have stopped; running jobs are never
    /// force-terminated, their finish stamps must land.
    pub async fn drain(&self) {
        if self.active_jobs() > 0 {
            info!(jobs = self.active_jobs(), "waiting for running jobs to finish");
        }
        while self.active_jobs() > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Forced start (`run` RPC): bypass the eligibility filter and the capacity
/// check, stamp the row and hand it to a supervisor. The capacity accountant
/// is still charged so over-subscription corrects itself as jobs finish.
pub async fn force_start(daemon: &Arc<Daemon>, job_id: i64) -> Result<(), PybsError> {
    let Some(job) = daemon.store.get(job_id).await? else {
        return Err(PybsError::NotFound(job_id));
    };
    if job.state() != JobState::Waiting {
        return Err(PybsError::validation("job has already started"));
    }

    let Some(job) = daemon
        .store
        .mark_started(job_id, &daemon.node, Utc::now())
        .await?
    else {
        // Lost a race against a dispatcher claim or a remove.
        return Err(PybsError::validation("job has already started"));
    };

    daemon.capacity.charge(job.ncpus);
    info!(job_id, ncpus = job.ncpus, "forced start");
    supervisor::spawn(daemon, &job);
    Ok(())
}
