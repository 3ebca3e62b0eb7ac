//! Job row model and the store contract shared by all backends.
//!
//! One table, one entity. The row's state is never stored; it is derived
//! from its timestamps:
//!
//!   WAITING   started = ∅ ∧ finished = ∅
//!   RUNNING   started ≠ ∅ ∧ finished = ∅
//!   FINISHED  started ≠ ∅ ∧ finished ≠ ∅
//!
//! Backends must guarantee that two concurrent [`JobStore::claim_next`]
//! calls cannot both win the same row: PostgreSQL does it with a row lock
//! inside a transaction, the in-memory store with a mutex around the table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job row as stored in the shared database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub username: String,
    /// Script path relative to the configured root.
    pub filename: String,
    pub ncpus: i32,
    pub priority: i32,
    /// Affinity filter: comma-separated node names, or none for "anywhere".
    pub nodes: Option<String>,
    /// The node that runs / ran this job; set when the job is claimed.
    pub node: Option<String>,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Derived job state, see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Running,
    Finished,
}

impl Job {
    pub fn state(&self) -> JobState {
        match (&self.started, &self.finished) {
            (None, _) => JobState::Waiting,
            (Some(_), None) => JobState::Running,
            (Some(_), Some(_)) => JobState::Finished,
        }
    }
}

/// Fields of a row about to be inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub username: String,
    pub filename: String,
    pub ncpus: i32,
    pub priority: i32,
    pub nodes: Option<String>,
    pub submitted: DateTime<Utc>,
}

/// Membership test against a comma-separated affinity list.
///
/// Only whole, comma-delimited entries match: `n1` is a member of
/// `n1,n2` but not of `n10` or `xn1`.
pub fn node_matches(nodes: &str, node: &str) -> bool {
    nodes.split(',').any(|entry| entry == node)
}

/// Dispatch eligibility of `job` for `node` with `free_cpus` CPUs free.
pub fn eligible(job: &Job, node: &str, free_cpus: i32) -> bool {
    job.state() == JobState::Waiting
        && job.ncpus <= free_cpus
        && job
            .nodes
            .as_deref()
            .is_none_or(|nodes| node_matches(nodes, node))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The store contract used by the daemon. All methods are single logical
/// operations; `claim_next` and `finish` are transactional.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new WAITING row, returning its id.
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError>;

    /// Fetch a row by id.
    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError>;

    /// Atomically pick, lock and claim the best eligible WAITING row for
    /// `node`: highest priority first, then oldest submission, then lowest
    /// id. Stamps `started` and `node` before returning. `None` when no row
    /// qualifies.
    async fn claim_next(&self, node: &str, free_cpus: i32) -> Result<Option<Job>, StoreError>;

    /// Forced-start stamp: set `started` and `node` on a row that has not
    /// started yet, skipping the eligibility filter. `None` if the row is
    /// missing or already started.
    async fn mark_started(
        &self,
        id: i64,
        node: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Stamp `finished` on a started row and return the final row. Rows
    /// that already finished (or never started) are returned unchanged;
    /// `finished` is never cleared or moved. `None` if the row is gone.
    async fn finish(&self, id: i64, ts: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Delete a row in any state, returning it so the caller can rebate
    /// capacity and kill a local child. `None` if the row is already gone.
    async fn delete(&self, id: i64) -> Result<Option<Job>, StoreError>;

    /// WAITING rows, highest priority first, oldest submission first.
    async fn list_waiting(&self) -> Result<Vec<Job>, StoreError>;

    /// RUNNING rows, oldest start first.
    async fn list_running(&self) -> Result<Vec<Job>, StoreError>;

    /// FINISHED rows, most recent finish first, at most `limit`.
    async fn list_finished(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Σ ncpus over RUNNING rows bound to `node`.
    async fn used_cpus(&self, node: &str) -> Result<i64, StoreError>;

    /// Startup reconciliation: stamp `finished` on all RUNNING rows bound to
    /// `node` (their supervisors died with a previous daemon process).
    /// Returns the number of rows stamped.
    async fn finish_stale(&self, node: &str, ts: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(ncpus: i32, nodes: Option<&str>) -> Job {
        Job {
            id: 1,
            name: "j".to_string(),
            username: "u".to_string(),
            filename: "j.sh".to_string(),
            ncpus,
            priority: 0,
            nodes: nodes.map(str::to_string),
            node: None,
            submitted: Utc::now(),
            started: None,
            finished: None,
        }
    }

    #[test]
    fn state_is_derived_from_timestamps() {
        let mut j = job(1, None);
        assert_eq!(j.state(), JobState::Waiting);
        j.started = Some(Utc::now());
        assert_eq!(j.state(), JobState::Running);
        j.finished = Some(Utc::now());
        assert_eq!(j.state(), JobState::Finished);
    }

    #[test]
    fn node_matches_is_comma_delimited() {
        assert!(node_matches("n1", "n1"));
        assert!(node_matches("n1,n2", "n1"));
        assert!(node_matches("n2,n1", "n1"));
        assert!(node_matches("n2,n1,n3", "n1"));

        // Substrings must not match.
        assert!(!node_matches("n10", "n1"));
        assert!(!node_matches("n10,n11", "n1"));
        assert!(!node_matches("xn1", "n1"));
        assert!(!node_matches("n2", "n1"));
    }

    #[test]
    fn eligibility_checks_state_cpus_and_affinity() {
        let j = job(2, None);
        assert!(eligible(&j, "n1", 2));
        assert!(!eligible(&j, "n1", 1));

        let pinned = job(1, Some("n2,n3"));
        assert!(eligible(&pinned, "n2", 4));
        assert!(!eligible(&pinned, "n1", 4));

        let mut running = job(1, None);
        running.started = Some(Utc::now());
        assert!(!eligible(&running, "n1", 4));
    }
}
