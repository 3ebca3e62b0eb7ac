//! Completion notifications.
//!
//! The daemon holds zero or more notifiers keyed by transport name
//! (`email`, `slack`, ...); the supervisor picks transports by which header
//! keys the script carried and renders one body for all of them. Failures
//! are logged and swallowed — a lost notification must never affect the
//! job's accounting.

use async_trait::async_trait;

use crate::error::PybsError;
use crate::jobstore::Job;

/// A notification sink for one transport. Implementations live outside the
/// scheduler core (SMTP relays, chat webhooks); tests use a recording
/// double.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), PybsError>;
}

/// Whether the header's `send_mail` mode asks for a notification for this
/// exit code. The letters act independently: `e` notifies on success, `a`
/// on failure, `ae` on both.
pub fn mode_matches(mode: &str, return_code: i32) -> bool {
    if return_code == 0 {
        mode.contains('e')
    } else {
        mode.contains('a')
    }
}

/// Subject line: `PyBS JOB <id> <name> <finished|failed>`.
pub fn render_subject(job: &Job, return_code: i32) -> String {
    let outcome = if return_code == 0 { "finished" } else { "failed" };
    format!("PyBS JOB {} {} {}", job.id, job.name, outcome)
}

/// Render the notification body for a finished job.
///
/// Captures are optional; a missing capture renders as `None`, matching
/// what clients have always parsed out of these messages.
pub fn render_body(
    job: &Job,
    return_code: i32,
    stdout: Option<&[u8]>,
    stderr: Option<&[u8]>,
) -> String {
    format!(
        "PBS Job Id: {id}\n\
         Job Name:   {name}\n\
         \n\
         Submitted:  {submitted}\n\
         Started:    {started}\n\
         Finished:   {finished}\n\
         \n\
         Filename:   {filename}\n\
         Exit code:  {return_code}\n\
         \n\
         Last 10 lines of standard output (if any):\n\
         {out}\n\
         \n\
         Last 10 lines of error output (if any):\n\
         {err}",
        id = job.id,
        name = job.name,
        submitted = format_ts(Some(job.submitted)),
        started = format_ts(job.started),
        finished = format_ts(job.finished),
        filename = job.filename,
        out = tail_or_none(stdout),
        err = tail_or_none(stderr),
    )
}

fn format_ts(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match ts {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "None".to_string(),
    }
}

fn tail_or_none(bytes: Option<&[u8]>) -> String {
    match bytes {
        Some(b) => last_lines(b, 10),
        None => "None".to_string(),
    }
}

/// Last `n` lines of a lossily-decoded byte capture.
fn last_lines(bytes: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn finished_job() -> Job {
        Job {
            id: 7,
            name: "reduce".to_string(),
            username: "alice".to_string(),
            filename: "night/reduce.sh".to_string(),
            ncpus: 2,
            priority: 0,
            nodes: None,
            node: Some("n1".to_string()),
            submitted: Utc.with_ymd_and_hms(2021, 3, 1, 10, 0, 0).unwrap(),
            started: Some(Utc.with_ymd_and_hms(2021, 3, 1, 10, 0, 5).unwrap()),
            finished: Some(Utc.with_ymd_and_hms(2021, 3, 1, 10, 2, 0).unwrap()),
        }
    }

    #[test]
    fn mode_letters_are_independent() {
        assert!(mode_matches("e", 0));
        assert!(!mode_matches("e", 1));
        assert!(mode_matches("a", 1));
        assert!(!mode_matches("a", 0));
        assert!(mode_matches("ae", 0));
        assert!(mode_matches("ae", 1));
        assert!(!mode_matches("", 0));
    }

    #[test]
    fn subject_reflects_the_exit_code() {
        let job = finished_job();
        assert_eq!(render_subject(&job, 0), "PyBS JOB 7 reduce finished");
        assert_eq!(render_subject(&job, 2), "PyBS JOB 7 reduce failed");
    }

    #[test]
    fn body_contains_the_expected_fields() {
        let job = finished_job();
        let body = render_body(&job, 0, Some(b"line1\nline2\n"), None);

        assert!(body.starts_with("PBS Job Id: 7\n"), "{body}");
        assert!(body.contains("Job Name:   reduce\n"));
        assert!(body.contains("Submitted:  2021-03-01 10:00:00\n"));
        assert!(body.contains("Started:    2021-03-01 10:00:05\n"));
        assert!(body.contains("Finished:   2021-03-01 10:02:00\n"));
        assert!(body.contains("Filename:   night/reduce.sh\n"));
        assert!(body.contains("Exit code:  0\n"));
        assert!(body.contains("standard output (if any):\nline1\nline2\n"));
        assert!(body.contains("error output (if any):\nNone"));
    }

    #[test]
    fn capture_tail_keeps_last_ten_lines() {
        let many: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        let tail = last_lines(many.as_bytes(), 10);
        assert!(tail.starts_with("line 6"));
        assert!(tail.ends_with("line 15"));
        assert_eq!(tail.lines().count(), 10);
    }
}
