//! Refresh job client: submit a "what's new" request to the job backend and
//! see it through to a result.
//!
//! ```text
//! Idle -> Submitting -> DirectlyCompleted
//!                    -> Queued <-> Processing -> Completed | Failed
//! ```
//!
//! Polls are serialized and spaced by exponential backoff. Polling parks
//! while the view is inactive and restarts at the initial interval when it
//! becomes active again. Once the poll budget is spent the client stops
//! polling and asks the backend for a direct synchronous refresh instead.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::{FeedService, RefreshRequest, RefreshResult, Submission};
use crate::backoff::BackoffPolicy;
use crate::lock;
use crate::model::BatchStatus;
use crate::schedule::{ActivityGate, Scheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Submitting,
    Queued { batch_id: String },
    Processing { batch_id: String },
    Completed,
    DirectlyCompleted,
    Failed,
}

impl RefreshPhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RefreshPhase::Submitting | RefreshPhase::Queued { .. } | RefreshPhase::Processing { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("a refresh job is already in flight")]
    AlreadyRunning,
    #[error("refresh submission failed after {attempts} attempts: {message}")]
    Submit { attempts: u32, message: String },
    #[error("refresh job {batch_id} failed: {message}")]
    JobFailed { batch_id: String, message: String },
    #[error("polling refresh job {batch_id} failed: {message}")]
    Poll { batch_id: String, message: String },
    #[error("direct refresh failed: {message}")]
    Fallback { message: String },
    #[error("refresh superseded by a session reset")]
    Superseded,
}

impl RefreshError {
    /// Whether the user should be offered a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RefreshError::AlreadyRunning | RefreshError::Superseded)
    }
}

/// How a completed refresh obtained its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPath {
    Direct,
    Polled { batch_id: String, polls: u32 },
    Fallback { batch_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub result: RefreshResult,
    pub path: RefreshPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    pub poll_backoff: BackoffPolicy,
    /// Wall-clock time the client may spend polling one batch.
    pub poll_budget: Duration,
    pub submit_retries: u32,
    pub poll_failure_retries: u32,
    pub request_timeout: Duration,
}

#[derive(Debug)]
struct ClientState {
    phase: RefreshPhase,
    running: bool,
    refreshed: bool,
    epoch: u64,
}

pub struct RefreshJobClient {
    service: Arc<dyn FeedService>,
    scheduler: Arc<dyn Scheduler>,
    gate: Arc<ActivityGate>,
    settings: RefreshSettings,
    state: Mutex<ClientState>,
}

/// A reserved refresh run. Dropping it before [`RefreshRun::execute`]
/// finishes releases the in-flight slot.
pub struct RefreshRun<'a> {
    client: &'a RefreshJobClient,
    request: RefreshRequest,
    epoch: u64,
    finished: bool,
}

impl RefreshRun<'_> {
    pub fn request(&self) -> &RefreshRequest {
        &self.request
    }

    #[instrument(skip_all, fields(priority = self.request.priority.as_str()))]
    pub async fn execute(mut self) -> Result<RefreshOutcome, RefreshError> {
        let result = self.client.drive(&self.request, self.epoch).await;
        self.finished = true;
        self.client.finish(self.epoch, result)
    }
}

impl Drop for RefreshRun<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut st = lock(&self.client.state);
        if st.epoch == self.epoch {
            st.running = false;
            st.phase = RefreshPhase::Idle;
        }
    }
}

impl RefreshJobClient {
    pub fn new(
        service: Arc<dyn FeedService>,
        scheduler: Arc<dyn Scheduler>,
        gate: Arc<ActivityGate>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            service,
            scheduler,
            gate,
            settings,
            state: Mutex::new(ClientState {
                phase: RefreshPhase::Idle,
                running: false,
                refreshed: false,
                epoch: 0,
            }),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        lock(&self.state).phase.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Whether this session already ran its automatic refresh.
    pub fn has_refreshed(&self) -> bool {
        lock(&self.state).refreshed
    }

    pub fn mark_refreshed(&self) {
        lock(&self.state).refreshed = true;
    }

    /// Return to `Idle`, clear the once-per-session guard and abort any run
    /// in flight at its next suspension point.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.epoch += 1;
        st.phase = RefreshPhase::Idle;
        st.running = false;
        st.refreshed = false;
    }

    /// Reserve the single in-flight slot.
    pub fn begin(&self, request: RefreshRequest) -> Result<RefreshRun<'_>, RefreshError> {
        let mut st = lock(&self.state);
        if st.running {
            return Err(RefreshError::AlreadyRunning);
        }
        st.running = true;
        st.phase = RefreshPhase::Submitting;
        Ok(RefreshRun {
            client: self,
            request,
            epoch: st.epoch,
            finished: false,
        })
    }

    pub async fn run(&self, request: RefreshRequest) -> Result<RefreshOutcome, RefreshError> {
        self.begin(request)?.execute().await
    }

    fn finish(
        &self,
        epoch: u64,
        result: Result<RefreshOutcome, RefreshError>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let mut st = lock(&self.state);
        if st.epoch != epoch {
            return Err(RefreshError::Superseded);
        }
        st.running = false;
        st.phase = match &result {
            Ok(RefreshOutcome {
                path: RefreshPath::Direct,
                ..
            }) => RefreshPhase::DirectlyCompleted,
            Ok(_) => RefreshPhase::Completed,
            Err(_) => RefreshPhase::Failed,
        };
        match &result {
            Ok(outcome) => info!(
                path = ?outcome.path,
                entries = outcome.result.entries.len(),
                "refresh completed"
            ),
            Err(err) => warn!(%err, "refresh failed"),
        }
        result
    }

    fn set_phase(&self, epoch: u64, phase: RefreshPhase) -> Result<(), RefreshError> {
        let mut st = lock(&self.state);
        if st.epoch != epoch {
            return Err(RefreshError::Superseded);
        }
        st.phase = phase;
        Ok(())
    }

    fn check_epoch(&self, epoch: u64) -> Result<(), RefreshError> {
        if lock(&self.state).epoch == epoch {
            Ok(())
        } else {
            Err(RefreshError::Superseded)
        }
    }

    async fn drive(
        &self,
        request: &RefreshRequest,
        epoch: u64,
    ) -> Result<RefreshOutcome, RefreshError> {
        match self.submit_with_retry(request, epoch).await? {
            Submission::Direct(result) => {
                debug!("backend processed refresh directly");
                Ok(RefreshOutcome {
                    result,
                    path: RefreshPath::Direct,
                })
            }
            Submission::Queued { batch_id } => {
                info!(%batch_id, "refresh job queued");
                self.set_phase(
                    epoch,
                    RefreshPhase::Queued {
                        batch_id: batch_id.clone(),
                    },
                )?;
                self.poll_until_done(request, batch_id, epoch).await
            }
        }
    }

    async fn submit_with_retry(
        &self,
        request: &RefreshRequest,
        epoch: u64,
    ) -> Result<Submission, RefreshError> {
        let mut attempt = 0u32;
        loop {
            self.check_epoch(epoch)?;
            let message = match self.timed(self.service.submit_refresh(request)).await {
                Ok(submission) => return Ok(submission),
                Err(message) => message,
            };
            if attempt >= self.settings.submit_retries {
                return Err(RefreshError::Submit {
                    attempts: attempt + 1,
                    message,
                });
            }
            let delay = self.settings.poll_backoff.delay(attempt);
            warn!(attempt, ?delay, %message, "refresh submission failed; retrying");
            self.scheduler.sleep(delay).await;
            attempt += 1;
        }
    }

    async fn poll_until_done(
        &self,
        request: &RefreshRequest,
        batch_id: String,
        epoch: u64,
    ) -> Result<RefreshOutcome, RefreshError> {
        let mut attempt = 0u32;
        let mut polls = 0u32;
        let mut consecutive_failures = 0u32;
        let mut spent = Duration::ZERO;
        let mut seen_resumes = self.gate.resumes();

        loop {
            let resumes = self.gate.wait_active().await;
            self.check_epoch(epoch)?;
            if resumes != seen_resumes {
                debug!(%batch_id, "view resumed; polling restarts at the initial interval");
                attempt = 0;
                seen_resumes = resumes;
            }

            let delay = self.settings.poll_backoff.delay(attempt);
            if spent + delay > self.settings.poll_budget {
                info!(%batch_id, polls, ?spent, "poll budget exhausted; refreshing directly");
                return self.direct_fallback(request, batch_id).await;
            }

            let started = self.scheduler.now();
            self.scheduler.sleep(delay).await;
            if !self.gate.is_active() {
                spent += self.scheduler.now().saturating_duration_since(started);
                continue;
            }
            self.check_epoch(epoch)?;

            let polled = self.timed(self.service.poll_batch(&batch_id)).await;
            polls += 1;
            attempt += 1;
            spent += self.scheduler.now().saturating_duration_since(started);

            let status = match polled {
                Ok(status) => status,
                Err(message) => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.settings.poll_failure_retries {
                        return Err(RefreshError::Poll { batch_id, message });
                    }
                    warn!(%batch_id, consecutive_failures, %message, "poll failed; backing off");
                    continue;
                }
            };
            consecutive_failures = 0;
            debug!(%batch_id, status = status.status.as_str(), polls, "polled refresh job");

            match status.status {
                BatchStatus::Queued => self.set_phase(
                    epoch,
                    RefreshPhase::Queued {
                        batch_id: batch_id.clone(),
                    },
                )?,
                BatchStatus::Processing => self.set_phase(
                    epoch,
                    RefreshPhase::Processing {
                        batch_id: batch_id.clone(),
                    },
                )?,
                BatchStatus::Completed => {
                    return Ok(RefreshOutcome {
                        result: status.result.unwrap_or_default(),
                        path: RefreshPath::Polled { batch_id, polls },
                    });
                }
                BatchStatus::Failed => {
                    return Err(RefreshError::JobFailed {
                        batch_id,
                        message: status
                            .error
                            .unwrap_or_else(|| "job reported failure".into()),
                    });
                }
            }
        }
    }

    async fn direct_fallback(
        &self,
        request: &RefreshRequest,
        batch_id: String,
    ) -> Result<RefreshOutcome, RefreshError> {
        match self.timed(self.service.refresh_direct(request)).await {
            Ok(result) => Ok(RefreshOutcome {
                result,
                path: RefreshPath::Fallback { batch_id },
            }),
            Err(message) => Err(RefreshError::Fallback { message }),
        }
    }

    async fn timed<T>(&self, call: impl Future<Output = anyhow::Result<T>>) -> Result<T, String> {
        match tokio::time::timeout(self.settings.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(_) => Err(format!(
                "timed out after {:?}",
                self.settings.request_timeout
            )),
        }
    }
}
