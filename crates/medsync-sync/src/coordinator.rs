//! # Debounced Refetch Coordinator
//!
//! Turns a stream of change notifications into a small number of refetches.
//! One coordinator exists per (scope, category) pair and owns the only
//! authoritative fetch for it.
//!
//! ## Timeline (trailing, 250ms window)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  t=0      spawn ──► initial fetch (always)                             │
//! │  t=300    notify ──► timer armed for t=550                             │
//! │  t=310    notify ──► timer re-armed for t=560                          │
//! │  t=340    notify ──► timer re-armed for t=590                          │
//! │  t=590    timer ──► fetch                                              │
//! │                                                                         │
//! │  A timer that expires while a fetch is in flight marks the fetch as    │
//! │  dirty; exactly one follow-up fetch runs when the current one settles. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown cancels the token, which drops the pending timer and the
//! in-flight fetch future. Dropping the future aborts its HTTP request.

use futures_util::future::BoxFuture;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DebouncePolicy, MIN_DEBOUNCE_MS};

/// Produces one fetch. Called at most once at a time per coordinator.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub window: Duration,
    pub policy: DebouncePolicy,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            window: Duration::from_millis(MIN_DEBOUNCE_MS),
            policy: DebouncePolicy::Trailing,
        }
    }
}

impl DebounceConfig {
    pub fn trailing(window: Duration) -> Self {
        DebounceConfig {
            window,
            policy: DebouncePolicy::Trailing,
        }
    }

    pub fn leading(window: Duration) -> Self {
        DebounceConfig {
            window,
            policy: DebouncePolicy::Leading,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum CoordinatorCommand {
    /// A change arrived.
    Notify,
    /// Explicit reload: fetch now, skipping the window.
    Refresh,
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    /// Signals a change. Never blocks; safe to call from feed callbacks.
    pub fn notify(&self) {
        if self.cmd_tx.send(CoordinatorCommand::Notify).is_err() {
            debug!("Notify after coordinator stopped");
        }
    }

    /// Requests an immediate fetch.
    pub fn refresh(&self) {
        if self.cmd_tx.send(CoordinatorCommand::Refresh).is_err() {
            debug!("Refresh after coordinator stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the timer and any in-flight fetch, then waits for the task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(?e, "Coordinator task ended abnormally");
            }
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct RefetchCoordinator {
    config: DebounceConfig,
    fetch: FetchFn,
    cancel: CancellationToken,
    cmd_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    label: String,

    deadline: Option<Instant>,
    /// Leading policy: events before this instant belong to the current burst.
    quiet_until: Option<Instant>,
    in_flight: Option<BoxFuture<'static, ()>>,
    /// A fetch was requested while one was running.
    dirty: bool,
}

impl RefetchCoordinator {
    /// Spawns the coordinator. The first fetch starts immediately.
    pub fn spawn(
        config: DebounceConfig,
        fetch: FetchFn,
        cancel: CancellationToken,
        label: impl Into<String>,
    ) -> CoordinatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let coordinator = RefetchCoordinator {
            config,
            fetch,
            cancel: cancel.clone(),
            cmd_rx,
            label: label.into(),
            deadline: None,
            quiet_until: None,
            in_flight: None,
            dirty: false,
        };

        let task = tokio::spawn(coordinator.run());

        CoordinatorHandle {
            cmd_tx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        debug!(label = %self.label, policy = %self.config.policy, "Coordinator started");
        self.trigger();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if self.in_flight.is_some() || self.deadline.is_some() {
                        debug!(label = %self.label, "Dropping pending fetch on shutdown");
                    }
                    break;
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(CoordinatorCommand::Notify) => self.on_notify(),
                    Some(CoordinatorCommand::Refresh) => {
                        self.deadline = None;
                        self.trigger();
                    }
                    None => break,
                },

                _ = run_in_flight(&mut self.in_flight) => {
                    self.in_flight = None;
                    if self.dirty {
                        self.dirty = false;
                        self.trigger();
                    }
                }

                _ = sleep_until_deadline(self.deadline) => {
                    self.deadline = None;
                    self.trigger();
                }
            }
        }

        debug!(label = %self.label, "Coordinator stopped");
    }

    fn on_notify(&mut self) {
        let now = Instant::now();
        match self.config.policy {
            DebouncePolicy::Trailing => {
                self.deadline = Some(now + self.config.window);
            }
            DebouncePolicy::Leading => {
                let in_burst = self.quiet_until.map(|q| now < q).unwrap_or(false);
                if in_burst {
                    self.deadline = Some(now + self.config.window);
                } else {
                    self.trigger();
                }
                self.quiet_until = Some(now + self.config.window);
            }
        }
    }

    fn trigger(&mut self) {
        if self.in_flight.is_some() {
            self.dirty = true;
        } else {
            debug!(label = %self.label, "Fetch started");
            self.in_flight = Some((self.fetch)());
        }
    }
}

async fn run_in_flight(fetch: &mut Option<BoxFuture<'static, ()>>) {
    match fetch.as_mut() {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
