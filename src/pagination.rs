//! Backward pagination over the merged feed.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::{FeedService, PageRequest, PageResponse, WireEntry};
use crate::buffer::MergeBuffer;
use crate::lock;
use crate::model::{normalize_timestamp, DisplayMeta, Entry, SourceCatalog};

#[derive(Debug, Error)]
pub enum PageError {
    #[error("a page fetch is already in flight")]
    AlreadyLoading,
    #[error("no more pages to load")]
    NoMorePages,
    #[error("page fetch at offset {offset} failed: {message}", offset = .request.offset)]
    Transient { request: PageRequest, message: String },
    #[error("page fetch at offset {offset} timed out", offset = .request.offset)]
    Timeout { request: PageRequest },
    #[error("page fetch superseded by a session reset")]
    Superseded,
}

impl PageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PageError::Transient { .. } | PageError::Timeout { .. })
    }

    /// The request that failed; the next call re-issues it unchanged.
    pub fn request(&self) -> Option<&PageRequest> {
        match self {
            PageError::Transient { request, .. } | PageError::Timeout { request } => Some(request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationSettings {
    pub page_size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// 1-based; page 1 is the initial snapshot.
    pub current_page: u32,
    pub has_more: bool,
    /// Advisory, may be stale.
    pub total_known: Option<u64>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            current_page: 1,
            has_more: true,
            total_known: None,
        }
    }
}

/// First page of a fresh session, normalized and ready to seed a buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialSnapshot {
    pub entries: Vec<Entry>,
    pub has_more: bool,
    pub total_entries: Option<u64>,
    pub source_catalog_titles: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    pub page: u32,
    /// Entries that survived dedup and were merged.
    pub inserted: usize,
    /// Malformed entries dropped during normalization.
    pub dropped: usize,
    pub has_more: bool,
    pub total_known: Option<u64>,
    pub source_catalog_titles: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct PagerState {
    cursor: PageCursor,
    loading: bool,
    failed: Option<PageRequest>,
    epoch: u64,
    signature: String,
    /// source id -> title, learned from the catalog and wrapped entries.
    source_titles: HashMap<String, String>,
}

pub struct PaginationController {
    service: Arc<dyn FeedService>,
    buffer: Arc<Mutex<MergeBuffer>>,
    settings: PaginationSettings,
    state: Mutex<PagerState>,
}

/// A claimed page fetch. Dropping it before [`PageTicket::complete`]
/// finishes releases the slot and keeps the request for the next attempt.
pub struct PageTicket<'a> {
    controller: &'a PaginationController,
    request: PageRequest,
    epoch: u64,
    armed: bool,
}

impl PageTicket<'_> {
    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    #[instrument(skip_all, fields(offset = self.request.offset))]
    pub async fn complete(mut self) -> Result<PageOutcome, PageError> {
        let controller = self.controller;
        debug!(limit = self.request.limit, "requesting page");
        let result = controller.fetch(&self.request).await;
        self.armed = false;

        let mut st = lock(&controller.state);
        if st.epoch != self.epoch {
            debug!("discarding page from a previous session");
            return Err(PageError::Superseded);
        }
        st.loading = false;
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%err, "page fetch failed; request retained for retry");
                st.failed = Some(self.request.clone());
                return Err(err);
            }
        };

        let (entries, dropped) = normalize_into(&mut st.source_titles, resp.entries);
        let inserted = lock(&controller.buffer).append(entries);
        st.cursor.current_page += 1;
        st.cursor.has_more = resp.has_more;
        if resp.total_entries.is_some() {
            st.cursor.total_known = resp.total_entries;
        }
        info!(
            page = st.cursor.current_page,
            inserted,
            dropped,
            has_more = resp.has_more,
            "page merged"
        );
        Ok(PageOutcome {
            page: st.cursor.current_page,
            inserted,
            dropped,
            has_more: resp.has_more,
            total_known: st.cursor.total_known,
            source_catalog_titles: resp.source_catalog_titles,
        })
    }
}

impl Drop for PageTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock(&self.controller.state);
        if st.epoch == self.epoch {
            st.loading = false;
            st.failed = Some(self.request.clone());
        }
    }
}

impl PaginationController {
    pub fn new(
        service: Arc<dyn FeedService>,
        buffer: Arc<Mutex<MergeBuffer>>,
        settings: PaginationSettings,
    ) -> Self {
        Self {
            service,
            buffer,
            settings,
            state: Mutex::new(PagerState::default()),
        }
    }

    pub fn cursor(&self) -> PageCursor {
        lock(&self.state).cursor
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    /// Request retained from the last failed fetch, if any.
    pub fn pending_retry(&self) -> Option<PageRequest> {
        lock(&self.state).failed.clone()
    }

    pub fn set_catalog(&self, catalog: &SourceCatalog) {
        let mut st = lock(&self.state);
        st.signature = catalog.signature();
        for source in &catalog.sources {
            if let Some(title) = &source.title {
                st.source_titles.insert(source.id.clone(), title.clone());
            }
        }
    }

    /// Drop cursor state and invalidate in-flight fetches. Titles learned for
    /// the catalog survive; they describe sources, not the session.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.epoch += 1;
        st.cursor = PageCursor::default();
        st.loading = false;
        st.failed = None;
    }

    /// Record the cursor of a freshly seeded session.
    pub fn start_session(&self, has_more: bool, total_known: Option<u64>) {
        let mut st = lock(&self.state);
        st.cursor = PageCursor {
            current_page: 1,
            has_more,
            total_known,
        };
    }

    /// Fetch page 1 for a session that has no host-provided snapshot.
    #[instrument(skip_all)]
    pub async fn fetch_initial_snapshot(&self) -> Result<InitialSnapshot, PageError> {
        let mut ticket = {
            let mut st = lock(&self.state);
            if st.loading {
                return Err(PageError::AlreadyLoading);
            }
            st.loading = true;
            PageTicket {
                controller: self,
                request: PageRequest {
                    offset: 0,
                    limit: self.settings.page_size,
                    source_catalog_signature: st.signature.clone(),
                    known_entry_count: Some(0),
                },
                epoch: st.epoch,
                armed: true,
            }
        };

        let result = self.fetch(&ticket.request).await;
        ticket.armed = false;

        let mut st = lock(&self.state);
        if st.epoch != ticket.epoch {
            return Err(PageError::Superseded);
        }
        st.loading = false;
        let resp = result?;
        let (entries, dropped) = normalize_into(&mut st.source_titles, resp.entries);
        info!(received = entries.len(), dropped, has_more = resp.has_more, "fetched initial snapshot");
        Ok(InitialSnapshot {
            entries,
            has_more: resp.has_more,
            total_entries: resp.total_entries,
            source_catalog_titles: resp.source_catalog_titles,
        })
    }

    /// Claim the single in-flight slot for the next page. Fails with
    /// `AlreadyLoading` or `NoMorePages` without touching the network.
    ///
    /// The offset is the number of feed positions the buffer has consumed, so
    /// entries prepended by a refresh shift it forward. A request that failed
    /// is retained and re-issued verbatim.
    pub fn reserve_next_page(&self) -> Result<PageTicket<'_>, PageError> {
        let mut st = lock(&self.state);
        if st.loading {
            return Err(PageError::AlreadyLoading);
        }
        if !st.cursor.has_more {
            return Err(PageError::NoMorePages);
        }
        let request = match st.failed.take() {
            Some(request) => request,
            None => {
                let buf = lock(&self.buffer);
                PageRequest {
                    offset: buf.consumed(),
                    limit: self.settings.page_size,
                    source_catalog_signature: st.signature.clone(),
                    known_entry_count: Some(buf.len()),
                }
            }
        };
        st.loading = true;
        Ok(PageTicket {
            controller: self,
            request,
            epoch: st.epoch,
            armed: true,
        })
    }

    /// Load the next page of older entries into the buffer.
    pub async fn request_next_page(&self) -> Result<PageOutcome, PageError> {
        self.reserve_next_page()?.complete().await
    }

    /// Surface a fresher advisory total, e.g. from a refresh result.
    pub fn note_total_known(&self, total: Option<u64>) {
        if total.is_some() {
            lock(&self.state).cursor.total_known = total;
        }
    }

    /// Resolve wire entries into canonical entries, dropping malformed ones.
    pub fn normalize(&self, items: Vec<WireEntry>) -> Vec<Entry> {
        let mut st = lock(&self.state);
        normalize_into(&mut st.source_titles, items).0
    }

    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, PageError> {
        match tokio::time::timeout(self.settings.timeout, self.service.fetch_page(request)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => Err(PageError::Transient {
                request: request.clone(),
                message: format!("{err:#}"),
            }),
            Err(_) => Err(PageError::Timeout {
                request: request.clone(),
            }),
        }
    }
}

fn normalize_into(
    source_titles: &mut HashMap<String, String>,
    items: Vec<WireEntry>,
) -> (Vec<Entry>, usize) {
    let mut entries = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for item in items {
        let (raw, display) = match item {
            WireEntry::Wrapped(wrapped) => {
                if let (Some(source_id), Some(title)) =
                    (&wrapped.entry.source_id, &wrapped.display.source_title)
                {
                    source_titles.insert(source_id.clone(), title.clone());
                }
                let mut display = wrapped.display;
                if display.thumbnail.is_none() {
                    display.thumbnail = wrapped.entry.thumbnail.clone();
                }
                (wrapped.entry, Some(display))
            }
            WireEntry::Raw(raw) => (raw, None),
            WireEntry::Unrecognized(value) => {
                warn!(%value, "dropping entry with unrecognized shape");
                dropped += 1;
                continue;
            }
        };

        let identity = raw.identity.filter(|id| !id.trim().is_empty());
        let published_at = normalize_timestamp(&raw.published_at);
        let (Some(identity), Some(published_at)) = (identity, published_at) else {
            warn!(published_at = %raw.published_at, "dropping malformed entry");
            dropped += 1;
            continue;
        };
        let source_id = raw.source_id.unwrap_or_default();
        let display = display.unwrap_or_else(|| DisplayMeta {
            source_title: source_titles.get(&source_id).cloned(),
            thumbnail: raw.thumbnail,
        });
        entries.push(Entry {
            identity,
            source_id,
            published_at,
            display,
            payload: raw.payload,
        });
    }
    (entries, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::model::{RawEntry, WrappedEntry};
    use serde_json::json;

    fn raw(id: Option<&str>, source: &str, ts: serde_json::Value) -> RawEntry {
        RawEntry {
            identity: id.map(str::to_string),
            source_id: Some(source.into()),
            published_at: ts,
            thumbnail: None,
            payload: json!({ "body": "x" }),
        }
    }

    #[test]
    fn raw_entries_take_display_from_cache_or_default() {
        let mut titles = HashMap::from([("news".to_string(), "Newsroom".to_string())]);
        let (entries, dropped) = normalize_into(
            &mut titles,
            vec![
                WireEntry::Raw(raw(Some("a"), "news", json!(10))),
                WireEntry::Raw(raw(Some("b"), "other", json!(9))),
            ],
        );
        assert_eq!(dropped, 0);
        assert_eq!(entries[0].display.source_title.as_deref(), Some("Newsroom"));
        assert_eq!(entries[1].display, DisplayMeta::default());
    }

    #[test]
    fn wrapped_entries_keep_their_display_and_teach_the_cache() {
        let mut titles = HashMap::new();
        let (entries, _) = normalize_into(
            &mut titles,
            vec![
                WireEntry::Wrapped(WrappedEntry {
                    entry: raw(Some("a"), "blog", json!("2024-01-02T00:00:00Z")),
                    display: DisplayMeta {
                        source_title: Some("Blog".into()),
                        thumbnail: Some("a.png".into()),
                    },
                }),
                WireEntry::Raw(raw(Some("b"), "blog", json!("2024-01-01T00:00:00Z"))),
            ],
        );
        assert_eq!(entries[0].display.thumbnail.as_deref(), Some("a.png"));
        assert_eq!(entries[1].display.source_title.as_deref(), Some("Blog"));
        assert_eq!(titles["blog"], "Blog");
    }

    #[test]
    fn malformed_entries_are_dropped_not_fatal() {
        let mut titles = HashMap::new();
        let (entries, dropped) = normalize_into(
            &mut titles,
            vec![
                WireEntry::Raw(raw(None, "s", json!(10))),
                WireEntry::Raw(raw(Some(" "), "s", json!(10))),
                WireEntry::Raw(raw(Some("bad-ts"), "s", json!("not a date"))),
                WireEntry::Unrecognized(json!(5)),
                WireEntry::Raw(raw(Some("ok"), "s", json!(10))),
            ],
        );
        assert_eq!(dropped, 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, "ok");
    }

    #[test]
    fn page_error_exposes_request_for_retry() {
        let request = PageRequest {
            offset: 35,
            limit: 30,
            source_catalog_signature: "a".into(),
            known_entry_count: Some(35),
        };
        let err = PageError::Timeout {
            request: request.clone(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.request(), Some(&request));
        assert!(err.to_string().contains("offset 35"));
        assert!(!PageError::AlreadyLoading.is_retryable());
    }
}
