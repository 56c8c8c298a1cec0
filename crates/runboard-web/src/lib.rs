//! Axum JSON API over the sync store: latest runs, job listing, and refresh triggers.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use runboard_core::{JobListing, LatestRun};
use runboard_storage::{StoreError, SyncStore};
use runboard_sync::{
    full_refresh_start, maybe_build_scheduler, runs_refresh_start, synchronizer_from_config,
    SharedSynchronizer, SyncConfig,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "runboard-web";

pub const DEFAULT_WEB_PORT: u16 = 8000;

/// Read side of the store; never writes.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: SyncStore,
}

impl QueryService {
    pub fn new(store: SyncStore) -> Self {
        Self { store }
    }

    pub async fn latest_run_per_job(&self) -> Result<Vec<LatestRun>, StoreError> {
        self.store.latest_run_per_job().await
    }

    pub async fn all_jobs(&self) -> Result<Vec<JobListing>, StoreError> {
        self.store.all_jobs().await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryService,
    pub synchronizer: Arc<SharedSynchronizer>,
}

impl AppState {
    pub fn new(synchronizer: Arc<SharedSynchronizer>) -> Self {
        Self {
            queries: QueryService::new(synchronizer.store().clone()),
            synchronizer,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/runs", get(runs_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/refresh/runs", post(refresh_runs_handler))
        .route("/api/refresh/all", post(refresh_all_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving runboard API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port: u16 = std::env::var("RUNBOARD_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);

    let synchronizer = Arc::new(synchronizer_from_config(&config).await?);
    let scheduler = maybe_build_scheduler(&config, Arc::clone(&synchronizer)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduled refresh enabled");
    }

    serve(AppState::new(synchronizer), port).await
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.queries.latest_run_per_job().await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.queries.all_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_runs_handler(State(state): State<Arc<AppState>>) -> Response {
    let start = runs_refresh_start(Utc::now());
    match state.synchronizer.backfill_runs(start, true).await {
        Ok(_) => success(),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let load_runs_from = full_refresh_start(Utc::now());
    match state.synchronizer.full_refresh(load_runs_from).await {
        Ok(_) => success(),
        Err(err) => server_error(err.into()),
    }
}

fn success() -> Response {
    Json(json!({ "status": "success" })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Duration};
    use http_body_util::BodyExt;
    use runboard_adapters::{
        ApiEnvironment, ApiError, ApiJob, ApiProject, ApiRepository, ApiRun, OrchestrationApi,
    };
    use runboard_core::SourceId;
    use runboard_sync::{SyncSettings, Synchronizer};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StubApi {
        run_started_at: DateTime<Utc>,
        fail: bool,
    }

    impl StubApi {
        fn check(&self) -> Result<(), ApiError> {
            if self.fail {
                return Err(ApiError::UnexpectedStatus {
                    status: 502,
                    url: "stub://upstream".to_string(),
                    body: "bad gateway".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OrchestrationApi for StubApi {
        async fn fetch_projects(&self) -> Result<Vec<ApiProject>, ApiError> {
            self.check()?;
            Ok(vec![ApiProject {
                id: 1,
                name: "analytics".to_string(),
            }])
        }

        async fn fetch_environments(&self) -> Result<Vec<ApiEnvironment>, ApiError> {
            self.check()?;
            Ok(vec![ApiEnvironment {
                id: 10,
                name: "production".to_string(),
                kind: "deployment".to_string(),
                repository: ApiRepository {
                    full_name: "acme/analytics".to_string(),
                },
                project_id: 1,
            }])
        }

        async fn fetch_jobs(&self) -> Result<Vec<ApiJob>, ApiError> {
            self.check()?;
            Ok(vec![ApiJob {
                id: 100,
                project_id: 1,
                environment_id: 10,
                name: "nightly build".to_string(),
            }])
        }

        async fn fetch_runs(
            &self,
            _limit: usize,
            offset: usize,
            _project_ids: &[SourceId],
        ) -> Result<Vec<ApiRun>, ApiError> {
            self.check()?;
            if offset > 0 {
                return Ok(Vec::new());
            }
            Ok(vec![ApiRun {
                id: 5000,
                environment_id: 10,
                project_id: 1,
                job_id: 100,
                git_branch: Some("main".to_string()),
                git_sha: Some("abc123".to_string()),
                started_at: self.run_started_at,
                finished_at: None,
                is_error: false,
                duration: "00:01:10".to_string(),
            }])
        }
    }

    async fn test_app(fail: bool) -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStore::open_path(dir.path().join("web.db")).await.unwrap();
        store.migrate().await.unwrap();
        let run_started_at = Utc::now() - Duration::hours(2);
        let started = runboard_core::normalize_timestamp(run_started_at);
        let api: Arc<dyn OrchestrationApi> = Arc::new(StubApi {
            run_started_at: started,
            fail,
        });
        let synchronizer = Arc::new(Synchronizer::new(api, store, SyncSettings::default()));
        (dir, app(AppState::new(synchronizer)))
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn empty_store_serves_empty_lists() {
        let (_dir, app) = test_app(false).await;
        let (status, runs) = send(&app, "GET", "/api/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs, json!([]));

        let (status, jobs) = send(&app, "GET", "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs, json!([]));
    }

    #[tokio::test]
    async fn refresh_all_then_read_back() {
        let (_dir, app) = test_app(false).await;
        let (status, body) = send(&app, "POST", "/api/refresh/all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "success" }));

        let (_, jobs) = send(&app, "GET", "/api/jobs").await;
        let jobs = jobs.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["dbt_id"], 100);
        assert_eq!(jobs[0]["name"], "nightly build");
        assert_eq!(jobs[0]["project_name"], "analytics");
        assert_eq!(jobs[0]["environment_name"], "production");
        assert!(jobs[0]["job_id"].is_i64());

        let (_, runs) = send(&app, "GET", "/api/runs").await;
        let runs = runs.as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["dbt_id"], 5000);
        assert_eq!(runs[0]["job_name"], "nightly build");
        assert_eq!(runs[0]["git_hash"], "abc123");
        assert!(runs[0]["finished_at"].is_null());
    }

    #[tokio::test]
    async fn refresh_runs_without_parents_succeeds_and_stores_nothing() {
        let (_dir, app) = test_app(false).await;
        let (status, body) = send(&app, "POST", "/api/refresh/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let (_, runs) = send(&app, "GET", "/api/runs").await;
        assert_eq!(runs, json!([]));
    }

    #[tokio::test]
    async fn failed_refresh_is_a_server_error() {
        let (_dir, app) = test_app(true).await;
        for uri in ["/api/refresh/all", "/api/refresh/runs"] {
            let (status, body) = send(&app, "POST", uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["status"], "error");
            assert!(body["message"].as_str().unwrap().contains("502"));
        }
    }
}
