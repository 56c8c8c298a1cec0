//! Upstream orchestration API client and the mapping from its payloads into
//! upsert-ready records.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use runboard_core::{
    parse_timestamp, EnvironmentRecord, JobRecord, ProjectRecord, RunRecord, SourceId,
};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "runboard-adapters";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    UnexpectedStatus { status: u16, url: String, body: String },
    #[error("malformed response body from {url}: {reason}")]
    MalformedBody { url: String, reason: String },
    #[error("record {index} from {url} does not match the expected schema: {reason}")]
    SchemaViolation {
        url: String,
        index: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiProject {
    pub id: SourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiRepository {
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiEnvironment {
    pub id: SourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub repository: ApiRepository,
    pub project_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiJob {
    pub id: SourceId,
    pub project_id: SourceId,
    pub environment_id: SourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiRun {
    pub id: SourceId,
    pub environment_id: SourceId,
    pub project_id: SourceId,
    pub job_id: SourceId,
    // Nullable but never absent.
    #[serde(deserialize_with = "Option::deserialize")]
    pub git_branch: Option<String>,
    #[serde(deserialize_with = "Option::deserialize")]
    pub git_sha: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(deserialize_with = "de_opt_timestamp")]
    pub finished_at: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub duration: String,
}

fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_timestamp(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

pub fn project_record(api: &ApiProject) -> ProjectRecord {
    ProjectRecord {
        source_id: api.id,
        name: api.name.clone(),
    }
}

pub fn environment_record(api: &ApiEnvironment) -> EnvironmentRecord {
    EnvironmentRecord {
        source_id: api.id,
        name: api.name.clone(),
        kind: api.kind.clone(),
        repo_name: api.repository.full_name.clone(),
        project_source_id: api.project_id,
    }
}

pub fn job_record(api: &ApiJob) -> JobRecord {
    JobRecord {
        source_id: api.id,
        name: api.name.clone(),
        project_source_id: api.project_id,
        environment_source_id: api.environment_id,
    }
}

pub fn run_record(api: &ApiRun) -> RunRecord {
    RunRecord {
        source_id: api.id,
        project_source_id: api.project_id,
        environment_source_id: api.environment_id,
        job_source_id: api.job_id,
        git_branch: api.git_branch.clone(),
        git_hash: api.git_sha.clone(),
        started_at: api.started_at,
        finished_at: api.finished_at,
        is_error: api.is_error,
        duration: api.duration.clone(),
    }
}

/// Decode a `{"data": [...]}` envelope. Either every record decodes or the
/// whole response is rejected.
pub fn decode_envelope<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<Vec<T>, ApiError> {
    let malformed = |reason: String| ApiError::MalformedBody {
        url: url.to_string(),
        reason,
    };

    let value: JsonValue = serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
    let items = match value {
        JsonValue::Object(mut map) => match map.remove("data") {
            Some(JsonValue::Array(items)) => items,
            Some(_) => return Err(malformed("`data` is not an array".to_string())),
            None => return Err(malformed("missing `data` field".to_string())),
        },
        _ => return Err(malformed("expected a JSON object envelope".to_string())),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item).map_err(|e| ApiError::SchemaViolation {
                url: url.to_string(),
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// The four upstream collections the sync pipeline reads.
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    async fn fetch_projects(&self) -> Result<Vec<ApiProject>, ApiError>;

    async fn fetch_environments(&self) -> Result<Vec<ApiEnvironment>, ApiError>;

    async fn fetch_jobs(&self) -> Result<Vec<ApiJob>, ApiError>;

    /// Runs newest-first by creation time.
    async fn fetch_runs(
        &self,
        limit: usize,
        offset: usize,
        project_ids: &[SourceId],
    ) -> Result<Vec<ApiRun>, ApiError>;
}

#[async_trait]
impl<T: OrchestrationApi + ?Sized> OrchestrationApi for Arc<T> {
    async fn fetch_projects(&self) -> Result<Vec<ApiProject>, ApiError> {
        (**self).fetch_projects().await
    }

    async fn fetch_environments(&self) -> Result<Vec<ApiEnvironment>, ApiError> {
        (**self).fetch_environments().await
    }

    async fn fetch_jobs(&self) -> Result<Vec<ApiJob>, ApiError> {
        (**self).fetch_jobs().await
    }

    async fn fetch_runs(
        &self,
        limit: usize,
        offset: usize,
        project_ids: &[SourceId],
    ) -> Result<Vec<ApiRun>, ApiError> {
        (**self).fetch_runs(limit, offset, project_ids).await
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub endpoint: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloudApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl CloudApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    pub fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }

    async fn get_collection<T: DeserializeOwned>(
        &self,
        resource: &'static str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let url = self.resource_url(resource);
        let span = info_span!("api_fetch", resource, %url);

        async {
            info!("querying upstream endpoint");
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header(ACCEPT, "application/json")
                .query(query)
                .send()
                .await
                .map_err(|source| ApiError::Transport {
                    url: url.clone(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                error!(status = status.as_u16(), %body, "upstream returned an error status");
                return Err(ApiError::UnexpectedStatus {
                    status: status.as_u16(),
                    url: url.clone(),
                    body,
                });
            }

            let body = resp.bytes().await.map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;
            let records = decode_envelope(&url, &body)?;
            info!(count = records.len(), "decoded upstream records");
            Ok(records)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl OrchestrationApi for CloudApiClient {
    async fn fetch_projects(&self) -> Result<Vec<ApiProject>, ApiError> {
        self.get_collection("projects", &[]).await
    }

    async fn fetch_environments(&self) -> Result<Vec<ApiEnvironment>, ApiError> {
        self.get_collection("environments", &[]).await
    }

    async fn fetch_jobs(&self) -> Result<Vec<ApiJob>, ApiError> {
        self.get_collection("jobs", &[]).await
    }

    async fn fetch_runs(
        &self,
        limit: usize,
        offset: usize,
        project_ids: &[SourceId],
    ) -> Result<Vec<ApiRun>, ApiError> {
        let mut query = vec![
            ("order_by", "-created_at".to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if !project_ids.is_empty() {
            let ids = project_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            query.push(("project_id__in", ids));
        }
        self.get_collection("runs", &query).await
    }
}
