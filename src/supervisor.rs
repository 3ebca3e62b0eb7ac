//! Per-job process supervision.
//!
//! One supervisor task per running job: spawn the script through `sh` with
//! the script's directory as working directory, record the child in the
//! node-local process registry, await exit, write the advisory capture
//! files, stamp the row finished, release capacity, notify.
//!
//! The registry entry is removed before the finished stamp; `remove` may
//! still race the exit, which is why [`kill_process`] treats a missing
//! process as success.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::error::PybsError;
use crate::header::{self, Header};
use crate::jobstore::Job;
use crate::notify;

/// Node-local map of job id → child PID. Inserted/removed by supervisors,
/// read by `remove` to kill a running job. The lock is never held across a
/// suspension point.
pub struct ProcessRegistry {
    pids: Mutex<HashMap<i64, u32>>,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        ProcessRegistry {
            pids: Mutex::new(HashMap::new()),
        }
    }

    pub fn pid(&self, job_id: i64) -> Option<u32> {
        self.pids.lock().expect("registry lock").get(&job_id).copied()
    }

    fn insert(&self, job_id: i64, pid: u32) {
        self.pids.lock().expect("registry lock").insert(job_id, pid);
    }

    fn remove(&self, job_id: i64) -> Option<u32> {
        self.pids.lock().expect("registry lock").remove(&job_id)
    }
}

/// Launch a supervisor task for a claimed job. The claim's `ncpus` rides
/// along so the charge can be returned even if the row vanishes.
pub(crate) fn spawn(daemon: &Arc<Daemon>, job: &Job) {
    daemon.job_started();
    let daemon = Arc::clone(daemon);
    let (job_id, ncpus) = (job.id, job.ncpus);
    tokio::spawn(async move {
        if let Err(e) = run_job(&daemon, job_id, ncpus).await {
            warn!(job_id, error = %e, "job supervision failed");
        }
        daemon.job_ended();
    });
}

/// Run one claimed job to completion.
///
/// A spawn failure is accounted as exit code −1; the finish path runs in
/// every case so the row reaches FINISHED and the CPUs come back. The
/// supervisor alone pairs the claim's capacity charge with a release —
/// `remove` never touches the accountant, no matter which daemon it went
/// through.
async fn run_job(daemon: &Daemon, job_id: i64, ncpus: i32) -> Result<(), PybsError> {
    let Some(job) = daemon.store.get(job_id).await? else {
        // remove() raced the claim; nothing was started yet, but the
        // claim's charge is still ours to return.
        debug!(job_id, "job row gone before start");
        daemon.capacity.release(ncpus);
        return Ok(());
    };

    let script = daemon.root.join(&job.filename);
    // Re-parse the header for the capture paths and the notification mode.
    let header = match header::parse_header(&script) {
        Ok(h) => h,
        Err(e) => {
            warn!(job_id, error = %e, "cannot re-read script header");
            Header::default()
        }
    };
    let cwd = script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| daemon.root.clone());

    let (return_code, stdout, stderr) = match spawn_child(&script, &cwd) {
        Ok(child) => {
            if let Some(pid) = child.id() {
                daemon.registry.insert(job_id, pid);
                info!(job_id, pid, script = %script.display(), "job started");
            }
            match child.wait_with_output().await {
                Ok(output) => (
                    exit_code(&output.status),
                    Some(output.stdout),
                    Some(output.stderr),
                ),
                Err(e) => {
                    warn!(job_id, error = %e, "waiting for job process failed");
                    (-1, None, None)
                }
            }
        }
        Err(e) => {
            warn!(job_id, error = %e, "job process did not start");
            (-1, None, None)
        }
    };

    // Captures are advisory; failures are logged and swallowed.
    for (path, bytes) in [
        (header.output(), stdout.as_deref()),
        (header.error(), stderr.as_deref()),
    ] {
        if let (Some(rel), Some(bytes)) = (path, bytes)
            && let Err(e) = write_capture(&cwd.join(rel), bytes).await
        {
            warn!(job_id, error = %e, "capture not written");
        }
    }

    // Deregister before stamping finished so remove() cannot kill a PID
    // that is being reused.
    daemon.registry.remove(job_id);

    match daemon.store.finish(job_id, Utc::now()).await? {
        None => {
            // The row was deleted while the job ran, possibly through a
            // daemon on another node. The charge from our claim is still
            // outstanding.
            debug!(job_id, "job row removed while running");
            daemon.capacity.release(job.ncpus);
        }
        Some(job) => {
            daemon.capacity.release(job.ncpus);
            info!(job_id, return_code, "job finished");
            maybe_notify(
                daemon,
                &header,
                &job,
                return_code,
                stdout.as_deref(),
                stderr.as_deref(),
            )
            .await;
        }
    }
    Ok(())
}

fn spawn_child(script: &Path, cwd: &Path) -> Result<tokio::process::Child, PybsError> {
    Command::new("sh")
        .arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PybsError::Spawn(e.to_string()))
}

/// Exit code of a finished child; signal terminations map to the negated
/// signal number, anything else unknowable to −1.
fn exit_code(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Write captured bytes to `path` with mode 0664.
async fn write_capture(path: &Path, bytes: &[u8]) -> Result<(), PybsError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(PybsError::Capture)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o664))
            .await
            .map_err(PybsError::Capture)?;
    }
    Ok(())
}

/// Kill a job's child process. Used by `remove`; the supervisor notices the
/// exit and takes its normal finish path.
#[cfg(unix)]
pub(crate) fn kill_process(pid: u32) {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the process exited on its own first — same outcome.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "kill failed");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process(pid: u32) {
    warn!(pid, "kill not supported on this platform");
}

/// Fire notifications when the header asked for them and the exit code
/// matches the requested mode. Transports are selected by header key; a
/// requested transport with no configured notifier is a logged no-op.
async fn maybe_notify(
    daemon: &Daemon,
    header: &Header,
    job: &Job,
    return_code: i32,
    stdout: Option<&[u8]>,
    stderr: Option<&[u8]>,
) {
    let Some(mode) = header.send_mail() else {
        return;
    };
    if !notify::mode_matches(mode, return_code) {
        return;
    }

    let subject = notify::render_subject(job, return_code);
    let body = notify::render_body(job, return_code, stdout, stderr);

    for (key, transport) in [("email", "email"), ("slack", "slack")] {
        let Some(recipient) = header.get(key) else {
            continue;
        };
        match daemon.notifiers.get(transport) {
            None => debug!(job_id = job.id, transport, "no notifier configured"),
            Some(notifier) => {
                if let Err(e) = notifier.send(recipient, &subject, &body).await {
                    warn!(job_id = job.id, transport, error = %e, "notification failed");
                }
            }
        }
    }
}
