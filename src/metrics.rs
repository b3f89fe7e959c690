//! Batched, de-duplicated cache of per-entry interaction counts.
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::FeedService;
use crate::lock;
use crate::model::MetricsRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics fetch for {count} identities failed: {message}", count = .identities.len())]
    Transient {
        identities: Vec<String>,
        message: String,
    },
    #[error("metrics fetch for {count} identities timed out", count = .identities.len())]
    Timeout { identities: Vec<String> },
}

impl MetricsError {
    /// Identities whose records could not be fetched; retrying them is safe.
    pub fn identities(&self) -> &[String] {
        match self {
            MetricsError::Transient { identities, .. } | MetricsError::Timeout { identities } => {
                identities
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    pub batch_size: usize,
    pub timeout: Duration,
}

/// Records resolved for one `get_or_fetch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsLookup {
    records: HashMap<String, MetricsRecord>,
}

impl MetricsLookup {
    /// The record for `identity`, or the zero record when none exists.
    pub fn get(&self, identity: &str) -> MetricsRecord {
        self.records.get(identity).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
enum BatchFailure {
    Transient(String),
    Timeout,
}

type BatchOutput = Result<Arc<HashMap<String, MetricsRecord>>, BatchFailure>;
type BatchFuture = Shared<BoxFuture<'static, BatchOutput>>;

#[derive(Default)]
struct MetricsState {
    records: HashMap<String, MetricsRecord>,
    /// identity -> (batch id, shared request covering it)
    in_flight: HashMap<String, (u64, BatchFuture)>,
    next_batch: u64,
    epoch: u64,
}

pub struct MetricsCache {
    service: Arc<dyn FeedService>,
    settings: MetricsSettings,
    state: Mutex<MetricsState>,
}

impl MetricsCache {
    pub fn new(service: Arc<dyn FeedService>, settings: MetricsSettings) -> Self {
        Self {
            service,
            settings: MetricsSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn cached(&self, identity: &str) -> Option<MetricsRecord> {
        lock(&self.state).records.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).records.is_empty()
    }

    /// Forget every cached record. Requests still in flight resolve for their
    /// callers but are not merged into the cache.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.epoch += 1;
        st.records.clear();
        st.in_flight.clear();
    }

    /// Resolve metrics for `identities`.
    ///
    /// Cached identities are answered locally, identities already covered by
    /// an in-flight request join that request, and only the remainder is
    /// fetched, in chunks of at most `batch_size`.
    ///
    /// If any chunk fails the call returns that chunk's error and the records
    /// of the other chunks are not returned, though they are still cached and
    /// answered locally by the next call.
    #[instrument(skip_all, fields(requested = identities.len()))]
    pub async fn get_or_fetch(&self, identities: &[String]) -> Result<MetricsLookup, MetricsError> {
        let mut resolved = HashMap::new();
        let (waits, epoch) = {
            let mut st = lock(&self.state);
            let mut waits: HashMap<u64, (BatchFuture, Vec<String>)> = HashMap::new();
            let mut needs_fetch = Vec::new();
            let mut seen = HashSet::new();
            for id in identities {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                if let Some(record) = st.records.get(id) {
                    resolved.insert(id.clone(), *record);
                } else if let Some((batch, fut)) = st.in_flight.get(id) {
                    waits
                        .entry(*batch)
                        .or_insert_with(|| (fut.clone(), Vec::new()))
                        .1
                        .push(id.clone());
                } else {
                    needs_fetch.push(id.clone());
                }
            }
            let joined: usize = waits.values().map(|(_, ids)| ids.len()).sum();
            for chunk in needs_fetch.chunks(self.settings.batch_size) {
                let batch = st.next_batch;
                st.next_batch += 1;
                let fut = self.start_batch(batch, chunk.to_vec());
                for id in chunk {
                    st.in_flight.insert(id.clone(), (batch, fut.clone()));
                }
                waits.insert(batch, (fut, chunk.to_vec()));
            }
            debug!(
                cached = resolved.len(),
                joined,
                fetching = needs_fetch.len(),
                "partitioned metrics request"
            );
            (waits, st.epoch)
        };

        if waits.is_empty() {
            return Ok(MetricsLookup { records: resolved });
        }

        let outcomes = join_all(
            waits
                .into_iter()
                .map(|(batch, (fut, ids))| async move { (batch, ids, fut.await) }),
        )
        .await;

        let mut st = lock(&self.state);
        let mut failure = None;
        for (batch, ids, outcome) in outcomes {
            for id in &ids {
                if matches!(st.in_flight.get(id), Some((b, _)) if *b == batch) {
                    st.in_flight.remove(id);
                }
            }
            match outcome {
                Ok(records) => {
                    for id in ids {
                        // Identities the backend did not answer count as zero
                        // so they are not requested again.
                        let record = records.get(&id).copied().unwrap_or_default();
                        if st.epoch == epoch {
                            st.records.insert(id.clone(), record);
                        }
                        resolved.insert(id, record);
                    }
                }
                Err(BatchFailure::Transient(message)) => {
                    failure = Some(MetricsError::Transient {
                        identities: ids,
                        message,
                    });
                }
                Err(BatchFailure::Timeout) => {
                    failure = Some(MetricsError::Timeout { identities: ids });
                }
            }
        }

        match failure {
            Some(err) => {
                warn!(%err, "metrics fetch failed");
                Err(err)
            }
            None => Ok(MetricsLookup { records: resolved }),
        }
    }

    fn start_batch(&self, batch: u64, identities: Vec<String>) -> BatchFuture {
        let service = self.service.clone();
        let timeout = self.settings.timeout;
        async move {
            info!(batch, count = identities.len(), "fetching metrics batch");
            match tokio::time::timeout(timeout, service.fetch_metrics(&identities)).await {
                Ok(Ok(records)) => Ok(Arc::new(records)),
                Ok(Err(err)) => Err(BatchFailure::Transient(format!("{err:#}"))),
                Err(_) => Err(BatchFailure::Timeout),
            }
        }
        .boxed()
        .shared()
    }
}
