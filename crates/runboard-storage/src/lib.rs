//! Relational sync store: idempotent upserts keyed by upstream id, run pruning,
//! and the read queries behind the HTTP API.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use runboard_core::{
    format_timestamp, parse_timestamp, EnvironmentRecord, JobListing, JobRecord, LatestRun,
    ProjectRecord, RunRecord, SourceId,
};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "runboard-storage";

/// Runs kept per job when no retention is configured.
pub const DEFAULT_RETAIN_RUNS: u32 = 3;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unreadable timestamp in {column}: {value:?}")]
    Timestamp { column: &'static str, value: String },
}

/// Outcome of one upsert call. Records whose parent source keys did not
/// resolve are left out of the write and listed in `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub written: usize,
    pub skipped: Vec<SourceId>,
}

impl UpsertReport {
    fn record(&mut self, source_id: SourceId, rows_affected: u64) {
        if rows_affected == 0 {
            self.skipped.push(source_id);
        } else {
            self.written += 1;
        }
    }

    pub fn merge(&mut self, other: UpsertReport) {
        self.written += other.written;
        self.skipped.extend(other.skipped);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub projects: i64,
    pub environments: i64,
    pub jobs: i64,
    pub runs: i64,
}

const UPSERT_PROJECT: &str = r#"
    INSERT INTO project (dbt_id, name)
    VALUES (?1, ?2)
    ON CONFLICT (dbt_id) DO UPDATE SET
        name = excluded.name
"#;

// Parents are resolved by joining on their upstream id. No match means no row.
const UPSERT_ENVIRONMENT: &str = r#"
    INSERT INTO environment (dbt_id, name, type, repo_name, project_id)
    SELECT ?1, ?2, ?3, ?4, project.project_id
      FROM project
     WHERE project.dbt_id = ?5
    ON CONFLICT (dbt_id) DO UPDATE SET
        name = excluded.name,
        type = excluded.type,
        repo_name = excluded.repo_name,
        project_id = excluded.project_id
"#;

const UPSERT_JOB: &str = r#"
    INSERT INTO job (dbt_id, name, project_id, environment_id)
    SELECT ?1, ?2, project.project_id, environment.environment_id
      FROM project, environment
     WHERE project.dbt_id = ?3
       AND environment.dbt_id = ?4
    ON CONFLICT (dbt_id) DO UPDATE SET
        name = excluded.name,
        project_id = excluded.project_id,
        environment_id = excluded.environment_id
"#;

const UPSERT_RUN: &str = r#"
    INSERT INTO run (dbt_id, project_id, environment_id, job_id, git_branch,
                     git_hash, started_at, finished_at, is_error, duration)
    SELECT ?1, project.project_id, environment.environment_id, job.job_id,
           ?5, ?6, ?7, ?8, ?9, ?10
      FROM project, environment, job
     WHERE project.dbt_id = ?2
       AND environment.dbt_id = ?3
       AND job.dbt_id = ?4
    ON CONFLICT (dbt_id) DO UPDATE SET
        project_id = excluded.project_id,
        environment_id = excluded.environment_id,
        job_id = excluded.job_id,
        git_branch = excluded.git_branch,
        git_hash = excluded.git_hash,
        started_at = excluded.started_at,
        finished_at = excluded.finished_at,
        is_error = excluded.is_error,
        duration = excluded.duration
"#;

// Pruning and the latest-run query must rank identically.
const PRUNE_RUNS: &str = r#"
    DELETE FROM run
     WHERE run_id IN (
        SELECT run_id
          FROM (
            SELECT run_id,
                   ROW_NUMBER() OVER (
                       PARTITION BY job_id
                       ORDER BY started_at DESC, run_id DESC
                   ) AS position
              FROM run
          )
         WHERE position > ?1
     )
"#;

const LATEST_RUN_PER_JOB: &str = r#"
    WITH ranked AS (
        SELECT run_id,
               ROW_NUMBER() OVER (
                   PARTITION BY job_id
                   ORDER BY started_at DESC, run_id DESC
               ) AS position
          FROM run
    )
    SELECT run.dbt_id,
           run.git_branch,
           run.git_hash,
           run.started_at,
           run.finished_at,
           run.is_error,
           run.duration,
           environment.name AS environment_name,
           project.name     AS project_name,
           job.name         AS job_name
      FROM run
      JOIN ranked
        ON ranked.run_id = run.run_id
       AND ranked.position = 1
      LEFT JOIN environment ON environment.environment_id = run.environment_id
      LEFT JOIN project     ON project.project_id = run.project_id
      LEFT JOIN job         ON job.job_id = run.job_id
     ORDER BY run.started_at DESC, run.run_id DESC
"#;

const ALL_JOBS: &str = r#"
    SELECT job.job_id,
           job.dbt_id,
           job.name,
           project.name     AS project_name,
           environment.name AS environment_name
      FROM job
      LEFT JOIN project     ON project.project_id = job.project_id
      LEFT JOIN environment ON environment.environment_id = job.environment_id
     ORDER BY job.job_id
"#;

/// Handle to the sync database. Cheap to clone; every clone shares one pool.
#[derive(Debug, Clone)]
pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    /// Connect using a `sqlite:` URL, creating the database file if needed.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_projects(&self, projects: &[ProjectRecord]) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        for project in projects {
            let result = sqlx::query(UPSERT_PROJECT)
                .bind(project.source_id)
                .bind(&project.name)
                .execute(&mut *tx)
                .await?;
            report.record(project.source_id, result.rows_affected());
        }
        tx.commit().await?;
        log_report("project", &report);
        Ok(report)
    }

    pub async fn upsert_environments(
        &self,
        environments: &[EnvironmentRecord],
    ) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        for environment in environments {
            let result = sqlx::query(UPSERT_ENVIRONMENT)
                .bind(environment.source_id)
                .bind(&environment.name)
                .bind(&environment.kind)
                .bind(&environment.repo_name)
                .bind(environment.project_source_id)
                .execute(&mut *tx)
                .await?;
            report.record(environment.source_id, result.rows_affected());
        }
        tx.commit().await?;
        log_report("environment", &report);
        Ok(report)
    }

    pub async fn upsert_jobs(&self, jobs: &[JobRecord]) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        for job in jobs {
            let result = sqlx::query(UPSERT_JOB)
                .bind(job.source_id)
                .bind(&job.name)
                .bind(job.project_source_id)
                .bind(job.environment_source_id)
                .execute(&mut *tx)
                .await?;
            report.record(job.source_id, result.rows_affected());
        }
        tx.commit().await?;
        log_report("job", &report);
        Ok(report)
    }

    pub async fn upsert_runs(&self, runs: &[RunRecord]) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        for run in runs {
            let result = sqlx::query(UPSERT_RUN)
                .bind(run.source_id)
                .bind(run.project_source_id)
                .bind(run.environment_source_id)
                .bind(run.job_source_id)
                .bind(&run.git_branch)
                .bind(&run.git_hash)
                .bind(format_timestamp(run.started_at))
                .bind(run.finished_at.map(format_timestamp))
                .bind(run.is_error)
                .bind(&run.duration)
                .execute(&mut *tx)
                .await?;
            report.record(run.source_id, result.rows_affected());
        }
        tx.commit().await?;
        log_report("run", &report);
        Ok(report)
    }

    /// Keep the `retain` most recently started runs of every job; hard-delete the rest.
    pub async fn prune_runs(&self, retain: u32) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(PRUNE_RUNS)
            .bind(i64::from(retain))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        info!(retain, deleted, "pruned run history");
        Ok(deleted)
    }

    /// Latest stored run start, the incremental backfill watermark.
    pub async fn max_run_started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MAX(started_at) AS watermark FROM run")
            .fetch_one(&self.pool)
            .await?;
        let raw: Option<String> = row.try_get("watermark")?;
        raw.map(|value| decode_timestamp("run.started_at", value))
            .transpose()
    }

    pub async fn latest_run_per_job(&self) -> Result<Vec<LatestRun>, StoreError> {
        let rows = sqlx::query(LATEST_RUN_PER_JOB).fetch_all(&self.pool).await?;
        rows.iter().map(latest_run_from_row).collect()
    }

    pub async fn all_jobs(&self) -> Result<Vec<JobListing>, StoreError> {
        let rows = sqlx::query(ALL_JOBS).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobListing {
                job_id: row.try_get("job_id")?,
                source_id: row.try_get("dbt_id")?,
                project_name: row.try_get("project_name")?,
                environment_name: row.try_get("environment_name")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM project)     AS projects,
                   (SELECT COUNT(*) FROM environment) AS environments,
                   (SELECT COUNT(*) FROM job)         AS jobs,
                   (SELECT COUNT(*) FROM run)         AS runs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TableCounts {
            projects: row.try_get("projects")?,
            environments: row.try_get("environments")?,
            jobs: row.try_get("jobs")?,
            runs: row.try_get("runs")?,
        })
    }
}

fn log_report(table: &'static str, report: &UpsertReport) {
    info!(
        table,
        written = report.written,
        skipped = report.skipped.len(),
        "upserted rows"
    );
    if !report.skipped.is_empty() {
        debug!(table, skipped = ?report.skipped, "rows without resolvable parents");
    }
}

fn decode_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(&value).map_err(|_| StoreError::Timestamp { column, value })
}

fn latest_run_from_row(row: &SqliteRow) -> Result<LatestRun, StoreError> {
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(LatestRun {
        source_id: row.try_get("dbt_id")?,
        environment_name: row.try_get("environment_name")?,
        project_name: row.try_get("project_name")?,
        job_name: row.try_get("job_name")?,
        git_branch: row.try_get("git_branch")?,
        git_hash: row.try_get("git_hash")?,
        started_at: decode_timestamp("run.started_at", started_at)?,
        finished_at: finished_at
            .map(|value| decode_timestamp("run.finished_at", value))
            .transpose()?,
        is_error: row.try_get("is_error")?,
        duration: row.try_get("duration")?,
    })
}
