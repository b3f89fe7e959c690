#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use feed_sync::backend::model::RawEntry;
use feed_sync::backend::{
    BatchStatusResponse, FeedService, PageRequest, PageResponse, RefreshRequest, RefreshResult,
    Submission, WireEntry,
};
use feed_sync::model::{BatchStatus, DisplayMeta, Entry, MetricsRecord};
use feed_sync::ActivityGate;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn entry(id: &str, secs: i64) -> Entry {
    Entry {
        identity: id.into(),
        source_id: "news".into(),
        published_at: at(secs),
        display: DisplayMeta::default(),
        payload: json!({ "body": id }),
    }
}

pub fn wire(id: &str, secs: i64) -> WireEntry {
    WireEntry::Raw(RawEntry {
        identity: Some(id.into()),
        source_id: Some("news".into()),
        published_at: json!(secs),
        thumbnail: Some(format!("{id}.png")),
        payload: json!({ "body": id }),
    })
}

pub fn page(entries: Vec<WireEntry>, has_more: bool) -> Result<PageResponse> {
    Ok(PageResponse {
        entries,
        has_more,
        total_entries: None,
        source_catalog_titles: None,
    })
}

pub fn likes(pairs: &[(&str, u64)]) -> Result<HashMap<String, MetricsRecord>> {
    Ok(pairs
        .iter()
        .map(|(id, n)| {
            (
                id.to_string(),
                MetricsRecord {
                    like_count: *n,
                    ..Default::default()
                },
            )
        })
        .collect())
}

pub fn status(status: BatchStatus) -> Result<BatchStatusResponse> {
    Ok(BatchStatusResponse {
        status,
        result: None,
        error: None,
    })
}

pub fn completed(entries: Vec<WireEntry>) -> Result<BatchStatusResponse> {
    Ok(BatchStatusResponse {
        status: BatchStatus::Completed,
        result: Some(refreshed(entries)),
        error: None,
    })
}

pub fn refreshed(entries: Vec<WireEntry>) -> RefreshResult {
    RefreshResult {
        refreshed_any: !entries.is_empty(),
        entries,
        source_catalog_titles: Vec::new(),
        total_entries: None,
    }
}

pub fn queued(batch_id: &str) -> Result<Submission> {
    Ok(Submission::Queued {
        batch_id: batch_id.into(),
    })
}

pub fn failure<T>(message: &str) -> Result<T> {
    Err(anyhow!("{message}"))
}

/// Mock backend: responses are queued per endpoint and every call is
/// recorded. Page and metrics calls can be held open until released.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    pages: Arc<Mutex<VecDeque<Result<PageResponse>>>>,
    metrics: Arc<Mutex<VecDeque<Result<HashMap<String, MetricsRecord>>>>>,
    submits: Arc<Mutex<VecDeque<Result<Submission>>>>,
    polls: Arc<Mutex<VecDeque<Result<BatchStatusResponse>>>>,
    directs: Arc<Mutex<VecDeque<Result<RefreshResult>>>>,

    page_calls: Arc<Mutex<Vec<PageRequest>>>,
    metrics_calls: Arc<Mutex<Vec<Vec<String>>>>,
    submit_calls: Arc<Mutex<Vec<RefreshRequest>>>,
    poll_calls: Arc<Mutex<Vec<String>>>,
    direct_calls: Arc<Mutex<Vec<RefreshRequest>>>,

    page_hold: Arc<Mutex<Option<Arc<Notify>>>>,
    metrics_hold: Arc<Mutex<Option<Arc<Notify>>>>,
    /// (poll number, active) toggles applied to the gate when that poll runs.
    poll_toggles: Arc<Mutex<VecDeque<(usize, bool)>>>,
    gate: Arc<Mutex<Option<Arc<ActivityGate>>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_page(&self, response: Result<PageResponse>) {
        self.pages.lock().await.push_back(response);
    }

    pub async fn push_metrics(&self, response: Result<HashMap<String, MetricsRecord>>) {
        self.metrics.lock().await.push_back(response);
    }

    pub async fn push_submit(&self, response: Result<Submission>) {
        self.submits.lock().await.push_back(response);
    }

    pub async fn push_poll(&self, response: Result<BatchStatusResponse>) {
        self.polls.lock().await.push_back(response);
    }

    pub async fn push_direct(&self, response: Result<RefreshResult>) {
        self.directs.lock().await.push_back(response);
    }

    /// Hold page fetches open until the returned handle is notified.
    pub async fn hold_pages(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.page_hold.lock().await = Some(notify.clone());
        notify
    }

    pub async fn hold_metrics(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.metrics_hold.lock().await = Some(notify.clone());
        notify
    }

    /// Flip `gate` to `active` while serving the `poll`-th poll (1-based).
    pub async fn toggle_gate_on_poll(&self, gate: Arc<ActivityGate>, poll: usize, active: bool) {
        *self.gate.lock().await = Some(gate);
        self.poll_toggles.lock().await.push_back((poll, active));
    }

    pub async fn page_calls(&self) -> Vec<PageRequest> {
        self.page_calls.lock().await.clone()
    }

    pub async fn metrics_calls(&self) -> Vec<Vec<String>> {
        self.metrics_calls.lock().await.clone()
    }

    pub async fn submit_calls(&self) -> Vec<RefreshRequest> {
        self.submit_calls.lock().await.clone()
    }

    pub async fn poll_calls(&self) -> Vec<String> {
        self.poll_calls.lock().await.clone()
    }

    pub async fn direct_calls(&self) -> Vec<RefreshRequest> {
        self.direct_calls.lock().await.clone()
    }

    async fn wait(hold: &Mutex<Option<Arc<Notify>>>) {
        let notify = hold.lock().await.clone();
        if let Some(notify) = notify {
            notify.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl FeedService for RecordingBackend {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse> {
        self.page_calls.lock().await.push(request.clone());
        Self::wait(&self.page_hold).await;
        let mut guard = self.pages.lock().await;
        guard.pop_front().unwrap_or_else(|| page(Vec::new(), false))
    }

    async fn fetch_metrics(&self, identities: &[String]) -> Result<HashMap<String, MetricsRecord>> {
        self.metrics_calls.lock().await.push(identities.to_vec());
        Self::wait(&self.metrics_hold).await;
        let mut guard = self.metrics.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(HashMap::new()))
    }

    async fn submit_refresh(&self, request: &RefreshRequest) -> Result<Submission> {
        self.submit_calls.lock().await.push(request.clone());
        let mut guard = self.submits.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| Ok(Submission::Direct(RefreshResult::default())))
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse> {
        let polls = {
            let mut calls = self.poll_calls.lock().await;
            calls.push(batch_id.to_string());
            calls.len()
        };
        {
            let mut toggles = self.poll_toggles.lock().await;
            while matches!(toggles.front(), Some((n, _)) if *n == polls) {
                if let (Some((_, active)), Some(gate)) =
                    (toggles.pop_front(), self.gate.lock().await.as_ref())
                {
                    gate.set_active(active);
                }
            }
        }
        let mut guard = self.polls.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| status(BatchStatus::Processing))
    }

    async fn refresh_direct(&self, request: &RefreshRequest) -> Result<RefreshResult> {
        self.direct_calls.lock().await.push(request.clone());
        let mut guard = self.directs.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| Ok(RefreshResult::default()))
    }
}
