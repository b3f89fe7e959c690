//! Injectable time source and the host activity gate.
//!
//! Everything that waits (poll backoff, submit retries) or reads the clock
//! (notification deadlines, poll budget) goes through a [`Scheduler`], so
//! tests can drive the engine on a virtual clock. Dropping a pending
//! `sleep` future cancels it.
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, delay: Duration);

    /// Wait until the clock reaches `deadline`.
    async fn sleep_until(&self, deadline: Instant);
}

/// Real timers on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Virtual clock. `sleep` returns immediately after advancing `now` and
/// recording the requested delay; `sleep_until` parks until the clock is
/// moved past the deadline by `advance` or another `sleep`.
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    clock: Arc<watch::Sender<Instant>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        let (clock, _rx) = watch::channel(Instant::now());
        Self {
            clock: Arc::new(clock),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.send_modify(|now| *now += by);
    }

    /// Every delay passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        *self.clock.borrow()
    }

    async fn sleep(&self, delay: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(delay);
        self.advance(delay);
        tokio::task::yield_now().await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut rx = self.clock.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activity {
    active: bool,
    resumes: u64,
}

/// Tracks whether the consuming view is visible. Pollers park on
/// [`ActivityGate::wait_active`] while the view is hidden and use the resume
/// counter to notice an inactive→active transition.
#[derive(Debug)]
pub struct ActivityGate {
    tx: watch::Sender<Activity>,
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ActivityGate {
    pub fn new(active: bool) -> Self {
        let (tx, _rx) = watch::channel(Activity { active, resumes: 0 });
        Self { tx }
    }

    pub fn set_active(&self, active: bool) {
        self.tx.send_modify(|a| {
            if active && !a.active {
                a.resumes += 1;
            }
            a.active = active;
        });
    }

    pub fn is_active(&self) -> bool {
        self.tx.borrow().active
    }

    /// Number of inactive→active transitions observed so far.
    pub fn resumes(&self) -> u64 {
        self.tx.borrow().resumes
    }

    /// Resolve once the view is active; returns the resume counter at that
    /// moment.
    pub async fn wait_active(&self) -> u64 {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current.active {
                return current.resumes;
            }
            if rx.changed().await.is_err() {
                return current.resumes;
            }
        }
    }
}
