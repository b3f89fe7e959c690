use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Epoch values above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// Display metadata attached to an entry. Some page responses ship it
/// pre-wrapped; for raw entries it is filled from the local display cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMeta {
    #[serde(default)]
    pub source_title: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// One piece of content pulled from an upstream source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub identity: String,
    pub source_id: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub display: DisplayMeta,
    #[serde(default)]
    pub payload: Value,
}

impl Entry {
    pub fn key(&self) -> EntryKey<'_> {
        EntryKey {
            published_at: self.published_at,
            identity: &self.identity,
        }
    }
}

/// Feed position of an entry: newest first, ties broken by identity
/// ascending. Sorting a slice of keys ascending yields feed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryKey<'a> {
    pub published_at: DateTime<Utc>,
    pub identity: &'a str,
}

impl Ord for EntryKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .published_at
            .cmp(&self.published_at)
            .then_with(|| self.identity.cmp(other.identity))
    }
}

impl PartialOrd for EntryKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two entries by feed position.
pub fn feed_order(a: &Entry, b: &Entry) -> Ordering {
    a.key().cmp(&b.key())
}

/// Normalize the many timestamp shapes upstream sources emit into UTC.
///
/// Accepts RFC 3339, RFC 2822, naive date-times (read as UTC), bare dates and
/// epoch seconds/milliseconds, either as JSON numbers or numeric strings.
pub fn normalize_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return from_epoch(n);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n.unsigned_abs() > EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

/// The set of upstream feeds merged into one view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCatalog {
    pub sources: Vec<Source>,
    /// Whether the host knows the full catalog yet.
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl SourceCatalog {
    pub fn new(sources: Vec<Source>, complete: bool) -> Self {
        Self { sources, complete }
    }

    /// Stable serialization of which sources are merged: sorted, de-duplicated
    /// ids joined with `,`.
    pub fn signature(&self) -> String {
        let mut ids: Vec<&str> = self.sources.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.join(",")
    }

    /// Apply titles reported by the backend, aligned positionally with
    /// `sources`. Extra titles are ignored.
    pub fn apply_titles(&mut self, titles: &[String]) {
        for (source, title) in self.sources.iter_mut().zip(titles) {
            if !title.trim().is_empty() {
                source.title = Some(title.clone());
            }
        }
    }

    pub fn title_of(&self, source_id: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.id == source_id)
            .and_then(|s| s.title.as_deref())
    }
}

/// Per-entry interaction counts. The zero value is the default consumers see
/// for identities without a record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsRecord {
    pub like_count: u64,
    pub liked_by_viewer: bool,
    pub comment_count: u64,
    pub share_count: u64,
    pub shared_by_viewer: bool,
    pub bookmarked: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}
