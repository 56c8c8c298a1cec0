//! Core domain records shared by the Runboard sync pipeline.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "runboard-core";

/// Identifier assigned by the upstream orchestration service.
pub type SourceId = i64;

/// Upsert-ready project keyed by its upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub source_id: SourceId,
    pub name: String,
}

/// Upsert-ready environment. The parent project is referenced by source key
/// and resolved to a surrogate key by the store at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub source_id: SourceId,
    pub name: String,
    pub kind: String,
    pub repo_name: String,
    pub project_source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub source_id: SourceId,
    pub name: String,
    pub project_source_id: SourceId,
    pub environment_source_id: SourceId,
}

/// Upsert-ready run. `duration` is the upstream's formatted string, kept as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub source_id: SourceId,
    pub project_source_id: SourceId,
    pub environment_source_id: SourceId,
    pub job_source_id: SourceId,
    pub git_branch: Option<String>,
    pub git_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub duration: String,
}

/// Most recent run of a job with display names joined in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRun {
    #[serde(rename = "dbt_id")]
    pub source_id: SourceId,
    pub environment_name: Option<String>,
    pub project_name: Option<String>,
    pub job_name: Option<String>,
    pub git_branch: Option<String>,
    pub git_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub job_id: i64,
    #[serde(rename = "dbt_id")]
    pub source_id: SourceId,
    pub project_name: Option<String>,
    pub environment_name: Option<String>,
    pub name: String,
}

/// Drop sub-second precision. Watermark comparisons work at whole seconds.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Parse an upstream or stored timestamp into whole-second UTC.
///
/// Accepts RFC 3339 with either `T` or a space between date and time
/// (`2024-03-01 10:11:12.987654+00:00`). Values without an offset are read as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let trimmed = value.trim();
    let rfc = if trimmed.len() > 10 && trimmed.as_bytes()[10] == b' ' {
        format!("{}T{}", &trimmed[..10], &trimmed[11..])
    } else {
        trimmed.to_string()
    };

    match DateTime::parse_from_rfc3339(&rfc) {
        Ok(ts) => Ok(normalize_timestamp(ts.with_timezone(&Utc))),
        Err(_) => {
            let whole_seconds = rfc.split('.').next().unwrap_or(&rfc);
            let naive = NaiveDateTime::parse_from_str(whole_seconds, "%Y-%m-%dT%H:%M:%S")?;
            Ok(naive.and_utc())
        }
    }
}

/// Canonical stored form, e.g. `2024-03-01T10:11:12Z`. Sorts chronologically as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    normalize_timestamp(ts).to_rfc3339_opts(SecondsFormat::Secs, true)
}
