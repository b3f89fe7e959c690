//! Per-view coordinator: owns one buffer plus the components that feed it and
//! exposes a single observable [`FeedState`].
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{FeedService, RefreshRequest, RefreshResult};
use crate::buffer::MergeBuffer;
use crate::config::Config;
use crate::lock;
use crate::metrics::{MetricsCache, MetricsError, MetricsLookup, MetricsSettings};
use crate::model::{Entry, Priority, SourceCatalog};
use crate::notifier::{NewEntryNotifier, Notification, NotifierSettings};
use crate::pagination::{
    InitialSnapshot, PageError, PageOutcome, PaginationController, PaginationSettings,
};
use crate::refresh::{RefreshError, RefreshJobClient, RefreshSettings};
use crate::schedule::{ActivityGate, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_buffer_size: usize,
    pub pagination: PaginationSettings,
    pub metrics: MetricsSettings,
    pub refresh: RefreshSettings,
    pub notifier: NotifierSettings,
}

impl SyncSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let timeout = cfg.request_timeout();
        Self {
            max_buffer_size: cfg.app.max_buffer_size,
            pagination: PaginationSettings {
                page_size: cfg.app.page_size,
                timeout,
            },
            metrics: MetricsSettings {
                batch_size: cfg.metrics.batch_size,
                timeout,
            },
            refresh: RefreshSettings {
                poll_backoff: cfg.poll_backoff(),
                poll_budget: cfg.poll_budget(),
                submit_retries: cfg.refresh.submit_retries,
                poll_failure_retries: cfg.refresh.poll_failure_retries,
                request_timeout: timeout,
            },
            notifier: NotifierSettings {
                policy: cfg.notifications.policy,
                preview_count: cfg.notifications.preview_count,
                display_timeout: cfg.display_timeout(),
            },
        }
    }
}

/// Everything a view renders.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedState {
    pub entries: Vec<Entry>,
    pub is_loading_more: bool,
    pub has_more: bool,
    pub is_refreshing: bool,
    pub refresh_error: Option<String>,
    pub load_error: Option<String>,
    pub notification: Option<Notification>,
    pub current_page: u32,
    pub total_known: Option<u64>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            is_loading_more: false,
            has_more: true,
            is_refreshing: false,
            refresh_error: None,
            load_error: None,
            notification: None,
            current_page: 1,
            total_known: None,
        }
    }
}

/// Result of [`SyncOrchestrator::activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// The buffer was reset and seeded from the snapshot.
    pub seeded: bool,
    /// The once-per-session refresh, run when seeding found the source
    /// catalog already complete.
    pub refresh: Option<RefreshReport>,
}

/// What a refresh attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReport {
    /// No snapshot yet, or the source catalog is not fully known.
    NotReady,
    /// The automatic refresh already ran this session.
    AlreadyRefreshed,
    /// Another refresh is in flight.
    Busy,
    NothingNew,
    Staged(Notification),
    Failed(RefreshError),
    /// The session was reset while the refresh was running.
    Superseded,
}

#[derive(Debug, Default)]
struct Session {
    initialized: bool,
    restored: bool,
    catalog: Option<SourceCatalog>,
    refresh_error: Option<String>,
    load_error: Option<String>,
}

pub struct SyncOrchestrator {
    view_id: Uuid,
    buffer: Arc<Mutex<MergeBuffer>>,
    pagination: PaginationController,
    metrics: MetricsCache,
    refresh: RefreshJobClient,
    notifier: NewEntryNotifier,
    gate: Arc<ActivityGate>,
    session: Mutex<Session>,
    state_tx: Arc<watch::Sender<FeedState>>,
    /// Clears the banner on the scheduler clock and republishes.
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        service: Arc<dyn FeedService>,
        scheduler: Arc<dyn Scheduler>,
        settings: SyncSettings,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(MergeBuffer::new(settings.max_buffer_size)));
        let gate = Arc::new(ActivityGate::new(false));
        let (state_tx, _) = watch::channel(FeedState::default());
        let view_id = Uuid::new_v4();
        debug!(%view_id, "created feed view");
        Self {
            view_id,
            pagination: PaginationController::new(
                service.clone(),
                buffer.clone(),
                settings.pagination,
            ),
            metrics: MetricsCache::new(service.clone(), settings.metrics),
            refresh: RefreshJobClient::new(
                service,
                scheduler.clone(),
                gate.clone(),
                settings.refresh,
            ),
            notifier: NewEntryNotifier::new(settings.notifier, scheduler, buffer.clone()),
            buffer,
            gate,
            session: Mutex::new(Session::default()),
            state_tx: Arc::new(state_tx),
            expiry: Mutex::new(None),
        }
    }

    pub fn view_id(&self) -> Uuid {
        self.view_id
    }

    /// The host restored persisted session state; the next activation starts
    /// over from its snapshot.
    pub fn session_restored(&self) {
        lock(&self.session).restored = true;
        info!(view_id = %self.view_id, "session restored; next activation resets the feed");
    }

    /// Whether the next [`activate`](Self::activate) will seed the buffer.
    pub fn needs_initialization(&self) -> bool {
        let session = lock(&self.session);
        !session.initialized || session.restored
    }

    /// Make the view active. On first activation, or after
    /// [`session_restored`](Self::session_restored), every component is reset
    /// and the buffer is seeded from `snapshot`; if the source catalog is
    /// already complete the session's refresh runs before this returns.
    /// Otherwise the snapshot is ignored and polling resumes.
    pub async fn activate(&self, snapshot: InitialSnapshot) -> Activation {
        let seeded = self.seed_if_needed(snapshot);
        self.gate.set_active(true);
        self.publish();
        let catalog_complete = lock(&self.session)
            .catalog
            .as_ref()
            .is_some_and(|c| c.complete);
        let refresh = if seeded && catalog_complete {
            Some(self.refresh_if_due().await)
        } else {
            None
        };
        Activation { seeded, refresh }
    }

    /// Activate without a host snapshot, fetching page 1 when a new session
    /// needs one.
    #[instrument(skip_all, fields(view_id = %self.view_id))]
    pub async fn activate_from_backend(&self) -> Result<Activation, PageError> {
        if !self.needs_initialization() {
            return Ok(self.activate(InitialSnapshot::default()).await);
        }
        match self.pagination.fetch_initial_snapshot().await {
            Ok(snapshot) => Ok(self.activate(snapshot).await),
            Err(err) => {
                warn!(%err, "initial snapshot failed");
                lock(&self.session).load_error = Some(err.to_string());
                self.publish();
                Err(err)
            }
        }
    }

    /// Host visibility. Polling parks while inactive and restarts at the
    /// initial interval once the view comes back.
    pub fn set_active(&self, active: bool) {
        debug!(view_id = %self.view_id, active, "view visibility changed");
        self.gate.set_active(active);
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    /// Record the source catalog. A fully known catalog on an initialized
    /// session triggers the once-per-session refresh.
    pub async fn set_source_catalog(&self, catalog: SourceCatalog) -> RefreshReport {
        self.pagination.set_catalog(&catalog);
        let complete = catalog.complete;
        lock(&self.session).catalog = Some(catalog);
        if !complete {
            return RefreshReport::NotReady;
        }
        self.refresh_if_due().await
    }

    /// Run the automatic refresh if this session has not had one yet.
    pub async fn refresh_if_due(&self) -> RefreshReport {
        if self.refresh.has_refreshed() {
            return RefreshReport::AlreadyRefreshed;
        }
        self.run_refresh(Priority::Normal).await
    }

    /// User-initiated refresh after a failure; bypasses the session guard.
    pub async fn retry_refresh(&self) -> RefreshReport {
        self.run_refresh(Priority::High).await
    }

    /// Load the next page of older entries. Failures are recorded in
    /// `load_error`; the loaded feed is never touched by them.
    #[instrument(skip_all, fields(view_id = %self.view_id))]
    pub async fn load_more(&self) -> Result<PageOutcome, PageError> {
        let ticket = self.pagination.reserve_next_page()?;
        lock(&self.session).load_error = None;
        self.publish();

        let result = ticket.complete().await;
        match &result {
            Ok(outcome) => {
                if let Some(titles) = &outcome.source_catalog_titles {
                    self.apply_catalog_titles(titles);
                }
            }
            Err(PageError::Superseded) => {}
            Err(err) => lock(&self.session).load_error = Some(err.to_string()),
        }
        self.publish();
        result
    }

    pub fn accept_notification(&self) -> usize {
        self.cancel_expiry();
        let inserted = self.notifier.accept();
        self.publish();
        inserted
    }

    pub fn dismiss_notification(&self) -> bool {
        self.cancel_expiry();
        let dismissed = self.notifier.dismiss();
        self.publish();
        dismissed
    }

    pub async fn metrics_for(&self, identities: &[String]) -> Result<MetricsLookup, MetricsError> {
        self.metrics.get_or_fetch(identities).await
    }

    pub fn state(&self) -> FeedState {
        let entries = lock(&self.buffer).entries().to_vec();
        let cursor = self.pagination.cursor();
        let (refresh_error, load_error) = {
            let session = lock(&self.session);
            (session.refresh_error.clone(), session.load_error.clone())
        };
        FeedState {
            entries,
            is_loading_more: self.pagination.is_loading(),
            has_more: cursor.has_more,
            is_refreshing: self.refresh.is_running(),
            refresh_error,
            load_error,
            notification: self.notifier.current(),
            current_page: cursor.current_page,
            total_known: cursor.total_known,
        }
    }

    /// Receives a fresh [`FeedState`] after every state change.
    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state_tx.subscribe()
    }

    fn seed_if_needed(&self, snapshot: InitialSnapshot) -> bool {
        if !self.needs_initialization() {
            return false;
        }
        self.reset_components();
        let inserted = lock(&self.buffer).seed(snapshot.entries);
        self.pagination
            .start_session(snapshot.has_more, snapshot.total_entries);
        let mut session = lock(&self.session);
        session.initialized = true;
        session.restored = false;
        if let (Some(catalog), Some(titles)) =
            (session.catalog.as_mut(), snapshot.source_catalog_titles.as_deref())
        {
            catalog.apply_titles(titles);
            self.pagination.set_catalog(catalog);
        }
        info!(view_id = %self.view_id, inserted, "feed seeded");
        true
    }

    #[instrument(skip_all, fields(view_id = %self.view_id, priority = priority.as_str()))]
    async fn run_refresh(&self, priority: Priority) -> RefreshReport {
        let request = {
            let session = lock(&self.session);
            match &session.catalog {
                Some(catalog) if session.initialized && catalog.complete => {
                    let buf = lock(&self.buffer);
                    RefreshRequest {
                        source_catalog_signature: catalog.signature(),
                        existing_identities: buf.identities(),
                        newest_known_published_at: buf.newest_published_at(),
                        priority,
                    }
                }
                _ => return RefreshReport::NotReady,
            }
        };
        let run = match self.refresh.begin(request) {
            Ok(run) => run,
            Err(_) => return RefreshReport::Busy,
        };
        self.refresh.mark_refreshed();
        lock(&self.session).refresh_error = None;
        self.publish();

        let report = match run.execute().await {
            Ok(outcome) => self.apply_refresh(outcome.result),
            Err(RefreshError::Superseded) => RefreshReport::Superseded,
            Err(err) => {
                lock(&self.session).refresh_error = Some(err.to_string());
                RefreshReport::Failed(err)
            }
        };
        self.publish();
        report
    }

    fn apply_refresh(&self, result: RefreshResult) -> RefreshReport {
        if !result.source_catalog_titles.is_empty() {
            self.apply_catalog_titles(&result.source_catalog_titles);
        }
        self.pagination.note_total_known(result.total_entries);
        let entries = self.pagination.normalize(result.entries);
        debug!(refreshed_any = result.refreshed_any, received = entries.len(), "refresh result");
        match self.notifier.stage(entries) {
            Some(notification) => {
                self.schedule_expiry();
                RefreshReport::Staged(notification)
            }
            None => RefreshReport::NothingNew,
        }
    }

    fn schedule_expiry(&self) {
        let Some(expiry) = self.notifier.expiry() else {
            return;
        };
        let state_tx = self.state_tx.clone();
        let task = tokio::spawn(async move {
            if let Some(expired) = expiry.await {
                state_tx.send_if_modified(|state| {
                    if state.notification.as_ref() != Some(&expired) {
                        return false;
                    }
                    state.notification = None;
                    true
                });
            }
        });
        if let Some(previous) = lock(&self.expiry).replace(task) {
            previous.abort();
        }
    }

    fn cancel_expiry(&self) {
        if let Some(task) = lock(&self.expiry).take() {
            task.abort();
        }
    }

    fn apply_catalog_titles(&self, titles: &[String]) {
        let mut session = lock(&self.session);
        if let Some(catalog) = session.catalog.as_mut() {
            catalog.apply_titles(titles);
            self.pagination.set_catalog(catalog);
        }
    }

    fn reset_components(&self) {
        self.cancel_expiry();
        lock(&self.buffer).reset();
        self.pagination.reset();
        self.metrics.reset();
        self.notifier.clear();
        self.refresh.reset();
        let mut session = lock(&self.session);
        session.refresh_error = None;
        session.load_error = None;
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state());
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}
