//! Wire shapes exchanged with the feed backend.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{BatchStatus, DisplayMeta, MetricsRecord, Priority};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
    pub source_catalog_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_entry_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    #[serde(default)]
    pub entries: Vec<WireEntry>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total_entries: Option<u64>,
    #[serde(default)]
    pub source_catalog_titles: Option<Vec<String>>,
}

/// An entry as the backend sends it. Some endpoints wrap the entry with the
/// display metadata they have cached; others send it bare.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireEntry {
    Wrapped(WrappedEntry),
    Raw(RawEntry),
    Unrecognized(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WrappedEntry {
    pub entry: RawEntry,
    #[serde(default)]
    pub display: DisplayMeta,
}

/// Every field is optional on the wire so one bad record cannot fail the
/// whole response; validation happens during normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawEntry {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub published_at: Value,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsBatchRequest {
    pub identities: Vec<String>,
}

/// Metrics come back either keyed by identity or aligned with the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricsBatchResponse {
    Keyed(HashMap<String, MetricsRecord>),
    Positional(Vec<MetricsRecord>),
}

impl MetricsBatchResponse {
    pub fn into_map(self, requested: &[String]) -> HashMap<String, MetricsRecord> {
        match self {
            MetricsBatchResponse::Keyed(map) => map,
            MetricsBatchResponse::Positional(records) => requested
                .iter()
                .cloned()
                .zip(records)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub source_catalog_signature: String,
    pub existing_identities: Vec<String>,
    pub newest_known_published_at: Option<DateTime<Utc>>,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    #[serde(default)]
    pub refreshed_any: bool,
    #[serde(default)]
    pub entries: Vec<WireEntry>,
    #[serde(default)]
    pub source_catalog_titles: Vec<String>,
    #[serde(default)]
    pub total_entries: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default)]
    pub processed_directly: bool,
    #[serde(default)]
    pub result: Option<RefreshResult>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What a refresh submission resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The backend processed the refresh synchronously.
    Direct(RefreshResult),
    /// An asynchronous job was queued.
    Queued { batch_id: String },
}

impl SubmitResponse {
    pub fn into_submission(self) -> Result<Submission> {
        if !self.success {
            return Err(anyhow!(
                "refresh submission rejected: {}",
                self.error.unwrap_or_else(|| "no reason given".into())
            ));
        }
        if self.processed_directly {
            return Ok(Submission::Direct(self.result.unwrap_or_default()));
        }
        match self.batch_id.filter(|id| !id.trim().is_empty()) {
            Some(batch_id) => Ok(Submission::Queued { batch_id }),
            None => Err(anyhow!("refresh submission returned neither a result nor a batch id")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusResponse {
    pub status: BatchStatus,
    #[serde(default)]
    pub result: Option<RefreshResult>,
    #[serde(default)]
    pub error: Option<String>,
}
