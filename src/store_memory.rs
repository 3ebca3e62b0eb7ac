//! In-memory job store.
//!
//! Backs the test suite and single-node daemons (`database = "memory"` in
//! the config). One mutex guards the whole table, so claims serialize the
//! same way the PostgreSQL row lock serializes them — just without the
//! cross-process reach.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::jobstore::{Job, JobState, JobStore, NewJob, StoreError, eligible};

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Job>,
}

#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError> {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(
            id,
            Job {
                id,
                name: job.name,
                username: job.username,
                filename: job.filename,
                ncpus: job.ncpus,
                priority: job.priority,
                nodes: job.nodes,
                node: None,
                submitted: job.submitted,
                started: None,
                finished: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.get(&id).cloned())
    }

    async fn claim_next(&self, node: &str, free_cpus: i32) -> Result<Option<Job>, StoreError> {
        let mut table = self.table.lock().await;
        let winner = table
            .rows
            .values()
            .filter(|job| eligible(job, node, free_cpus))
            .min_by_key(|job| (Reverse(job.priority), job.submitted, job.id))
            .map(|job| job.id);

        let Some(id) = winner else {
            return Ok(None);
        };
        let row = table.rows.get_mut(&id).expect("winner row present");
        row.started = Some(Utc::now());
        row.node = Some(node.to_string());
        Ok(Some(row.clone()))
    }

    async fn mark_started(
        &self,
        id: i64,
        node: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut table = self.table.lock().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.started.is_some() {
            return Ok(None);
        }
        row.started = Some(ts);
        row.node = Some(node.to_string());
        Ok(Some(row.clone()))
    }

    async fn finish(&self, id: i64, ts: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut table = self.table.lock().await;
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        // A row that never started cannot finish.
        if row.started.is_some() && row.finished.is_none() {
            row.finished = Some(ts);
        }
        Ok(Some(row.clone()))
    }

    async fn delete(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let mut table = self.table.lock().await;
        Ok(table.rows.remove(&id))
    }

    async fn list_waiting(&self) -> Result<Vec<Job>, StoreError> {
        let table = self.table.lock().await;
        let mut jobs: Vec<Job> = table
            .rows
            .values()
            .filter(|j| j.state() == JobState::Waiting)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (Reverse(j.priority), j.submitted, j.id));
        Ok(jobs)
    }

    async fn list_running(&self) -> Result<Vec<Job>, StoreError> {
        let table = self.table.lock().await;
        let mut jobs: Vec<Job> = table
            .rows
            .values()
            .filter(|j| j.state() == JobState::Running)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.started, j.id));
        Ok(jobs)
    }

    async fn list_finished(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let table = self.table.lock().await;
        let mut jobs: Vec<Job> = table
            .rows
            .values()
            .filter(|j| j.state() == JobState::Finished)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (Reverse(j.finished), Reverse(j.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn used_cpus(&self, node: &str) -> Result<i64, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|j| j.state() == JobState::Running && j.node.as_deref() == Some(node))
            .map(|j| j.ncpus as i64)
            .sum())
    }

    async fn finish_stale(&self, node: &str, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut table = self.table.lock().await;
        let mut stamped = 0;
        for row in table.rows.values_mut() {
            if row.state() == JobState::Running && row.node.as_deref() == Some(node) {
                row.finished = Some(ts);
                stamped += 1;
            }
        }
        Ok(stamped)
    }
}
