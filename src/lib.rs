//! Incremental synchronization engine for a merged, multi-source feed.
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod orchestrator;
pub mod pagination;
pub mod refresh;
pub mod schedule;

pub use backend::{FeedService, HttpFeedClient};
pub use buffer::MergeBuffer;
pub use metrics::{MetricsCache, MetricsError, MetricsLookup};
pub use model::{Entry, EntryKey, MetricsRecord, SourceCatalog};
pub use notifier::{NewEntryNotifier, Notification};
pub use orchestrator::{Activation, FeedState, RefreshReport, SyncOrchestrator, SyncSettings};
pub use pagination::{PageError, PaginationController};
pub use refresh::{RefreshError, RefreshJobClient, RefreshPhase};
pub use schedule::{ActivityGate, ManualScheduler, Scheduler, TokioScheduler};

/// Lock a std mutex, recovering the data if a holder panicked. Guards are
/// never held across an await point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
