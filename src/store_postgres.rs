//! PostgreSQL job store.
//!
//! This is the backend that makes a cluster: every daemon connects to the
//! same database and serializes its claims through row locks. All queries
//! are runtime-checked so the crate builds without a live database.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::jobstore::{Job, JobStore, NewJob, StoreError, eligible};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job (
    id        BIGSERIAL PRIMARY KEY,
    name      VARCHAR(100) NOT NULL,
    username  VARCHAR(20)  NOT NULL,
    filename  VARCHAR(200) NOT NULL,
    ncpus     INTEGER      NOT NULL,
    priority  INTEGER      NOT NULL DEFAULT 0,
    nodes     VARCHAR(100),
    node      VARCHAR(100),
    submitted TIMESTAMPTZ  NOT NULL,
    started   TIMESTAMPTZ,
    finished  TIMESTAMPTZ
)
"#;

const COLUMNS: &str = "id, name, username, filename, ncpus, priority, nodes, node, \
                       submitted, started, finished";

pub struct PostgresStore {
    pool: PgPool,
}

/// Escape LIKE metacharacters in a value bound into a pattern.
fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl PostgresStore {
    /// Connect and make sure the job table exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        info!("connected to job database");
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    async fn insert(&self, job: NewJob) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO job (name, username, filename, ncpus, priority, nodes, submitted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&job.name)
        .bind(&job.username)
        .bind(&job.filename)
        .bind(job.ncpus)
        .bind(job.priority)
        .bind(&job.nodes)
        .bind(job.submitted)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {COLUMNS} FROM job WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_next(&self, node: &str, free_cpus: i32) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Pick the winner under a row lock. The affinity test only accepts
        // the node name as a whole comma-delimited entry, so `n1` does not
        // match `nodes = 'n10'`. The LIKE patterns get an escaped copy of
        // the name: a host called `n_1` or `n%` must not widen the filter
        // and lock somebody else's candidate.
        let candidate = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM job \
             WHERE started IS NULL AND finished IS NULL \
               AND ncpus <= $1 \
               AND (nodes IS NULL \
                    OR nodes = $2 \
                    OR nodes LIKE $3 || ',%' ESCAPE '\\' \
                    OR nodes LIKE '%,' || $3 || ',%' ESCAPE '\\' \
                    OR nodes LIKE '%,' || $3 ESCAPE '\\') \
             ORDER BY priority DESC, submitted ASC, id ASC \
             LIMIT 1 \
             FOR UPDATE"
        ))
        .bind(free_cpus)
        .bind(node)
        .bind(escape_like(node))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            return Ok(None);
        };

        // The row version can have moved between the scan and the lock;
        // re-check before stamping.
        if !eligible(&job, node, free_cpus) {
            debug!(job_id = job.id, "candidate no longer eligible under lock");
            return Ok(None);
        }

        let ts = Utc::now();
        sqlx::query("UPDATE job SET started = $1, node = $2 WHERE id = $3")
            .bind(ts)
            .bind(node)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(Job {
            started: Some(ts),
            node: Some(node.to_string()),
            ..job
        }))
    }

    async fn mark_started(
        &self,
        id: i64,
        node: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "UPDATE job SET started = $1, node = $2 \
             WHERE id = $3 AND started IS NULL \
             RETURNING {COLUMNS}"
        ))
        .bind(ts)
        .bind(node)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn finish(&self, id: i64, ts: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE job SET finished = $1 \
             WHERE id = $2 AND started IS NOT NULL AND finished IS NULL",
        )
            .bind(ts)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {COLUMNS} FROM job WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn delete(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "DELETE FROM job WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_waiting(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM job \
             WHERE started IS NULL AND finished IS NULL \
             ORDER BY priority DESC, submitted ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_running(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM job \
             WHERE started IS NOT NULL AND finished IS NULL \
             ORDER BY started ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_finished(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM job \
             WHERE finished IS NOT NULL \
             ORDER BY finished DESC, id DESC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn used_cpus(&self, node: &str) -> Result<i64, StoreError> {
        let used = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(ncpus), 0) FROM job \
             WHERE started IS NOT NULL AND finished IS NULL AND node = $1",
        )
        .bind(node)
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    async fn finish_stale(&self, node: &str, ts: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE job SET finished = $1 \
             WHERE node = $2 AND started IS NOT NULL AND finished IS NULL",
        )
        .bind(ts)
        .bind(node)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
