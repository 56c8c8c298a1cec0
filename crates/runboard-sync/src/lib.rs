//! Sync orchestration: full refresh, incremental run backfill, retention, and
//! the optional cron schedule that drives them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use runboard_adapters::{
    environment_record, job_record, project_record, run_record, ApiClientConfig, ApiError,
    CloudApiClient, OrchestrationApi,
};
use runboard_core::SourceId;
use runboard_storage::{StoreError, SyncStore, UpsertReport, DEFAULT_RETAIN_RUNS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "runboard-sync";

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_SYNC_CRON: &str = "0 0 * * * *";

/// Lookback for `POST /api/refresh/runs`.
pub const RUNS_REFRESH_LOOKBACK_WEEKS: i64 = 4;
/// Lookback for `POST /api/refresh/all` and the scheduled refresh.
pub const FULL_REFRESH_LOOKBACK_WEEKS: i64 = 1;

pub fn runs_refresh_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::weeks(RUNS_REFRESH_LOOKBACK_WEEKS)
}

pub fn full_refresh_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::weeks(FULL_REFRESH_LOOKBACK_WEEKS)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid setting {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub api_endpoint: String,
    pub api_token: String,
    pub database_url: String,
    pub page_size: usize,
    pub retain_runs: u32,
    pub project_ids: Vec<SourceId>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_endpoint", &self.api_endpoint)
            .field("api_token", &"<redacted>")
            .field("database_url", &self.database_url)
            .field("page_size", &self.page_size)
            .field("retain_runs", &self.retain_runs)
            .field("project_ids", &self.project_ids)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let api_token = required("API_TOKEN")?;
        let api_endpoint = required("API_ENDPOINT")?;
        require_prefix("API_ENDPOINT", &api_endpoint, "https://")?;
        let database_url = required("DATABASE_URL")?;
        require_prefix("DATABASE_URL", &database_url, "sqlite:")?;

        let page_size: usize = parse_var(&lookup, "RUNBOARD_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            return Err(ConfigError::Invalid {
                var: "RUNBOARD_PAGE_SIZE",
                reason: "must be greater than zero".to_string(),
            });
        }
        let retain_runs: u32 = parse_var(&lookup, "RUNBOARD_RETAIN_RUNS", DEFAULT_RETAIN_RUNS)?;
        if retain_runs == 0 {
            return Err(ConfigError::Invalid {
                var: "RUNBOARD_RETAIN_RUNS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let project_ids = match lookup("RUNBOARD_PROJECT_IDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<SourceId>().map_err(|e| ConfigError::Invalid {
                        var: "RUNBOARD_PROJECT_IDS",
                        reason: format!("{s:?}: {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            api_endpoint,
            api_token,
            database_url,
            page_size,
            retain_runs,
            project_ids,
            http_timeout_secs: parse_var(&lookup, "RUNBOARD_HTTP_TIMEOUT_SECS", 30)?,
            scheduler_enabled: lookup("RUNBOARD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.page_size,
            retain_runs: self.retain_runs,
            project_ids: self.project_ids.clone(),
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            endpoint: self.api_endpoint.clone(),
            token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("runboard/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

fn require_prefix(var: &'static str, value: &str, prefix: &str) -> Result<(), ConfigError> {
    if value.starts_with(prefix) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            var,
            reason: format!("should start with {prefix}, is {value}"),
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: usize,
    pub retain_runs: u32,
    pub project_ids: Vec<SourceId>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            retain_runs: DEFAULT_RETAIN_RUNS,
            project_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub sync_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_start: DateTime<Utc>,
    pub effective_start: DateTime<Utc>,
    pub pages_fetched: usize,
    pub earliest_seen: Option<DateTime<Utc>>,
    pub runs: UpsertReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub sync_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub projects: UpsertReport,
    pub environments: UpsertReport,
    pub jobs: UpsertReport,
    pub backfill: BackfillSummary,
    pub pruned_runs: u64,
}

/// The backfill never starts earlier than requested; a later stored
/// watermark moves it forward.
pub fn effective_start(requested: DateTime<Utc>, watermark: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match watermark {
        Some(mark) if mark > requested => mark,
        _ => requested,
    }
}

/// Synchronizer backed by the production HTTP client, shareable across handlers.
pub type SharedSynchronizer = Synchronizer<Arc<dyn OrchestrationApi>>;

/// Drives the write path. Workflows are serialized through `write_gate`.
pub struct Synchronizer<A> {
    api: A,
    store: SyncStore,
    settings: SyncSettings,
    write_gate: Mutex<()>,
}

impl<A: OrchestrationApi> Synchronizer<A> {
    pub fn new(api: A, store: SyncStore, settings: SyncSettings) -> Self {
        Self {
            api,
            store,
            settings,
            write_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Projects, environments and jobs in parent-first order, then a
    /// watermark-bounded run backfill, then retention pruning.
    pub async fn full_refresh(&self, load_runs_from: DateTime<Utc>) -> Result<RefreshSummary, SyncError> {
        let _gate = self.write_gate.lock().await;
        let sync_id = Uuid::new_v4();
        let span = info_span!("sync", %sync_id, workflow = "full_refresh");

        async move {
            info!("doing a full refresh of all data");
            let started_at = Utc::now();

            let projects = self.api.fetch_projects().await?;
            let records = projects.iter().map(project_record).collect::<Vec<_>>();
            let projects = self.store.upsert_projects(&records).await?;
            warn_skipped("project", &projects);

            let environments = self.api.fetch_environments().await?;
            let records = environments.iter().map(environment_record).collect::<Vec<_>>();
            let environments = self.store.upsert_environments(&records).await?;
            warn_skipped("environment", &environments);

            let jobs = self.api.fetch_jobs().await?;
            let records = jobs.iter().map(job_record).collect::<Vec<_>>();
            let jobs = self.store.upsert_jobs(&records).await?;
            warn_skipped("job", &jobs);

            let backfill = self.backfill_locked(sync_id, load_runs_from, true).await?;
            let pruned_runs = self.store.prune_runs(self.settings.retain_runs).await?;

            let finished_at = Utc::now();
            info!(pruned_runs, "full refresh complete");
            Ok(RefreshSummary {
                sync_id,
                started_at,
                finished_at,
                projects,
                environments,
                jobs,
                backfill,
                pruned_runs,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn backfill_runs(
        &self,
        start: DateTime<Utc>,
        use_watermark: bool,
    ) -> Result<BackfillSummary, SyncError> {
        let _gate = self.write_gate.lock().await;
        let sync_id = Uuid::new_v4();
        let span = info_span!("sync", %sync_id, workflow = "backfill_runs");
        self.backfill_locked(sync_id, start, use_watermark)
            .instrument(span)
            .await
    }

    async fn resolve_start(&self, requested: DateTime<Utc>, use_watermark: bool) -> DateTime<Utc> {
        if !use_watermark {
            info!("ignoring watermark value");
            return requested;
        }
        let watermark = match self.store.max_run_started_at().await {
            Ok(mark) => mark,
            Err(err) => {
                warn!(%err, "failed to read the run watermark; using the requested start");
                return requested;
            }
        };
        if let Some(mark) = watermark.filter(|mark| *mark <= requested) {
            warn!(watermark = %mark, %requested, "last stored run is before the start date; runs may be missing");
        }
        effective_start(requested, watermark)
    }

    // Caller must hold `write_gate`.
    async fn backfill_locked(
        &self,
        sync_id: Uuid,
        requested_start: DateTime<Utc>,
        use_watermark: bool,
    ) -> Result<BackfillSummary, SyncError> {
        let started_at = Utc::now();
        let effective_start = self.resolve_start(requested_start, use_watermark).await;
        info!(%effective_start, "loading runs back to effective start");

        let page_size = self.settings.page_size.max(1);
        let mut offset = 0usize;
        let mut pages_fetched = 0usize;
        let mut earliest_seen: Option<DateTime<Utc>> = None;
        let mut runs = UpsertReport::default();

        loop {
            debug!(offset, "loading runs page");
            let page = self
                .api
                .fetch_runs(page_size, offset, &self.settings.project_ids)
                .await?;
            pages_fetched += 1;

            let records = page.iter().map(run_record).collect::<Vec<_>>();
            if let Some(page_min) = records.iter().map(|r| r.started_at).min() {
                earliest_seen = Some(earliest_seen.map_or(page_min, |seen| seen.min(page_min)));
            }
            debug!(earliest_seen = ?earliest_seen, "earliest run start retrieved");

            if !records.is_empty() {
                runs.merge(self.store.upsert_runs(&records).await?);
            }

            if records.len() < page_size {
                debug!("upstream run history exhausted");
                break;
            }
            if earliest_seen.is_some_and(|seen| seen <= effective_start) {
                break;
            }
            offset += page_size;
        }

        warn_skipped("run", &runs);
        Ok(BackfillSummary {
            sync_id,
            started_at,
            finished_at: Utc::now(),
            requested_start,
            effective_start,
            pages_fetched,
            earliest_seen,
            runs,
        })
    }
}

fn warn_skipped(entity: &'static str, report: &UpsertReport) {
    if !report.skipped.is_empty() {
        warn!(
            entity,
            skipped = ?report.skipped,
            "parent records not found; these records were not stored"
        );
    }
}

/// Connect the store, apply migrations, and wire the HTTP client.
pub async fn synchronizer_from_config(config: &SyncConfig) -> Result<SharedSynchronizer> {
    let store = SyncStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("migrating sync store")?;
    let api: Arc<dyn OrchestrationApi> = Arc::new(CloudApiClient::new(config.api_client_config())?);
    Ok(Synchronizer::new(api, store, config.settings()))
}

pub async fn maybe_build_scheduler<A>(
    config: &SyncConfig,
    synchronizer: Arc<Synchronizer<A>>,
) -> Result<Option<JobScheduler>>
where
    A: OrchestrationApi + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let synchronizer = Arc::clone(&synchronizer);
        Box::pin(async move {
            match synchronizer.full_refresh(full_refresh_start(Utc::now())).await {
                Ok(summary) => info!(
                    sync_id = %summary.sync_id,
                    runs = summary.backfill.runs.written,
                    pruned = summary.pruned_runs,
                    "scheduled refresh finished"
                ),
                Err(err) => error!(%err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
