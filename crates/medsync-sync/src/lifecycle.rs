//! # Subscription Lifecycle Manager
//!
//! Keeps exactly one live subscription set per resource category and moves
//! it whenever the watched scope changes.
//!
//! ## States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────┐  scope=Some  ┌─────────────┐ handles+coordinator ┌────────┐ │
//! │   │ Idle │─────────────►│ Subscribing │────────────────────►│ Active │ │
//! │   └──────┘              └─────────────┘                     └───┬────┘ │
//! │      ▲                                                          │      │
//! │      │          ┌──────────────┐      scope changed / shutdown  │      │
//! │      └──────────│ TearingDown  │◄───────────────────────────────┘      │
//! │   unsubscribed  └──────────────┘                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stale-Response Guard
//! Every scope assignment gets a fresh [`ScopeTag`]. A fetch captures the tag
//! it was started under and commits only while that tag is still current.
//! Handles created for a scope that was replaced mid-subscribe are released
//! before the next scope is processed.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use medsync_core::{ChangeEvent, ResourceCategory, Scope};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, ScopeTag};
use crate::change_feed::{ChangeCallback, ChangeFeed, ChannelSpec, FeedHandle};
use crate::coordinator::{CoordinatorHandle, DebounceConfig, FetchFn, RefetchCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::loading::LoadingState;

/// Fetches one category's value for a scope.
pub type Loader<T> = Arc<dyn Fn(Scope) -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

/// Channels a category watches for a scope.
pub type ChannelPlan = Arc<dyn Fn(&Scope) -> Vec<ChannelSpec> + Send + Sync>;

/// Whether an absent scope is a final answer rather than one still pending.
pub type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Subscribing,
    Active,
    TearingDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Subscribing => "subscribing",
            LifecycleState::Active => "active",
            LifecycleState::TearingDown => "tearing_down",
        };
        write!(f, "{}", s)
    }
}

/// Everything a manager needs besides its scope source.
pub struct CategoryBinding<T> {
    pub category: ResourceCategory,
    pub loader: Loader<T>,
    pub plan: ChannelPlan,
    pub cache: Arc<CacheEntry<T>>,
    /// Settles the flag on a `None` scope while it returns true and raises
    /// it otherwise. Without one, a `None` scope leaves the flag alone.
    pub unscoped_ready: Option<ReadyCheck>,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    category: ResourceCategory,
    state_rx: watch::Receiver<LifecycleState>,
    coordinator: Arc<Mutex<Option<CoordinatorHandle>>>,
    cancel: CancellationToken,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ManagerHandle {
    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Refetches the active scope now. No-op while idle.
    pub fn refresh(&self) {
        let coordinator = self
            .coordinator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        match coordinator {
            Some(coordinator) => coordinator.refresh(),
            None => debug!(category = %self.category, "Refresh while idle"),
        }
    }

    /// Tears down the active scope and waits for the manager to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(category = %self.category, ?e, "Lifecycle manager panicked");
            }
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct ActiveScope {
    handles: Vec<FeedHandle>,
    coordinator: CoordinatorHandle,
}

pub struct LifecycleManager<T> {
    binding: CategoryBinding<T>,
    feed: Arc<dyn ChangeFeed>,
    loading: LoadingState,
    debounce: DebounceConfig,
    scope_rx: watch::Receiver<Option<Scope>>,
    state_tx: watch::Sender<LifecycleState>,
    coordinator: Arc<Mutex<Option<CoordinatorHandle>>>,
    cancel: CancellationToken,
    generation: u64,
    active: Option<ActiveScope>,
}

impl<T: Send + Sync + 'static> LifecycleManager<T> {
    /// Spawns a manager that follows `scope_rx`.
    pub fn spawn(
        binding: CategoryBinding<T>,
        feed: Arc<dyn ChangeFeed>,
        loading: LoadingState,
        debounce: DebounceConfig,
        scope_rx: watch::Receiver<Option<Scope>>,
        cancel: CancellationToken,
    ) -> ManagerHandle {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let coordinator = Arc::new(Mutex::new(None));
        let category = binding.category;

        let manager = LifecycleManager {
            binding,
            feed,
            loading,
            debounce,
            scope_rx,
            state_tx,
            coordinator: coordinator.clone(),
            cancel: cancel.clone(),
            generation: 0,
            active: None,
        };

        let task = tokio::spawn(manager.run());

        ManagerHandle {
            category,
            state_rx,
            coordinator,
            cancel,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    fn category(&self) -> ResourceCategory {
        self.binding.category
    }

    fn set_state(&self, state: LifecycleState) {
        self.state_tx.send_replace(state);
    }

    async fn run(mut self) {
        debug!(category = %self.category(), "Lifecycle manager started");

        loop {
            let scope = self.scope_rx.borrow_and_update().clone();
            self.teardown().await;

            match scope {
                Some(scope) => self.activate(scope).await,
                None => self.unscope(),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.scope_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
        debug!(category = %self.category(), "Lifecycle manager stopped");
    }

    /// Subscribes `scope` and starts its coordinator, unless the scope is
    /// replaced while handles are being created.
    async fn activate(&mut self, scope: Scope) {
        let category = self.category();
        self.set_state(LifecycleState::Subscribing);

        self.generation += 1;
        let tag = ScopeTag {
            scope: Some(scope.clone()),
            generation: self.generation,
        };
        self.binding.cache.bind(tag.clone());
        self.loading.begin(category);

        let notifier: Arc<OnceLock<CoordinatorHandle>> = Arc::new(OnceLock::new());
        let plan = (self.binding.plan)(&scope);
        let mut handles = Vec::with_capacity(plan.len());
        for spec in plan {
            let target = notifier.clone();
            let callback: ChangeCallback = Arc::new(move |_: &ChangeEvent| {
                if let Some(coordinator) = target.get() {
                    coordinator.notify();
                }
            });
            match self.feed.subscribe(spec, callback).await {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(%category, %scope, error = %e, "Channel unavailable, realtime updates degraded"),
            }
        }

        let superseded = self.scope_rx.has_changed().unwrap_or(true);
        if superseded || self.cancel.is_cancelled() {
            debug!(%category, %scope, handles = handles.len(), "Scope replaced while subscribing");
            self.release(handles).await;
            self.set_state(LifecycleState::Idle);
            return;
        }

        let coordinator = RefetchCoordinator::spawn(
            self.debounce,
            self.fetch_fn(scope.clone(), tag),
            self.cancel.child_token(),
            format!("{}:{}", category, scope),
        );
        // Set exactly once per activation.
        let _ = notifier.set(coordinator.clone());
        *self.coordinator.lock().unwrap_or_else(|p| p.into_inner()) = Some(coordinator.clone());

        info!(%category, %scope, channels = handles.len(), "Scope active");
        self.active = Some(ActiveScope {
            handles,
            coordinator,
        });
        self.set_state(LifecycleState::Active);
    }

    fn unscope(&self) {
        let category = self.category();
        self.binding.cache.clear();
        match &self.binding.unscoped_ready {
            Some(ready) if ready() => {
                debug!(%category, "Nothing to scope, settling empty");
                self.loading.settle(category);
            }
            Some(_) => self.loading.begin(category),
            None => {}
        }
    }

    fn fetch_fn(&self, scope: Scope, tag: ScopeTag) -> FetchFn {
        let category = self.category();
        let loader = self.binding.loader.clone();
        let cache = self.binding.cache.clone();
        let loading = self.loading.clone();

        Arc::new(move || {
            let fetch = loader(scope.clone());
            let cache = cache.clone();
            let loading = loading.clone();
            let tag = tag.clone();
            async move {
                let result = fetch.await;
                complete(category, &cache, &loading, &tag, result);
            }
            .boxed()
        })
    }

    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.set_state(LifecycleState::TearingDown);

        self.coordinator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        active.coordinator.shutdown().await;
        self.release(active.handles).await;

        debug!(category = %self.category(), "Scope torn down");
        self.set_state(LifecycleState::Idle);
    }

    async fn release(&self, handles: Vec<FeedHandle>) {
        for handle in handles {
            let channel = handle.channel().to_string();
            if let Err(e) = self.feed.unsubscribe(handle).await {
                warn!(category = %self.category(), %channel, error = %e, "Unsubscribe failed");
            }
        }
    }
}

/// Applies a settled fetch to the cache and loading flag. The flag is only
/// touched under the cache's tag lock, so a concurrent rebind or clear either
/// happens first and voids the settle or happens after it.
fn complete<T>(
    category: ResourceCategory,
    cache: &CacheEntry<T>,
    loading: &LoadingState,
    tag: &ScopeTag,
    result: SyncResult<T>,
) {
    if !cache.is_current(tag) {
        debug!(%category, generation = tag.generation, "Discarding stale fetch result");
        return;
    }

    let settle = || loading.settle(category);
    match result {
        Ok(value) => {
            if cache.commit_with(tag, value, settle) {
                debug!(%category, "Cache updated");
            }
        }
        Err(SyncError::AuthUnavailable) => {
            debug!(%category, "No session yet, fetch skipped");
        }
        Err(SyncError::Unsupported { kind, .. }) => {
            debug!(%category, %kind, "Category not offered by source, settling empty");
            cache.settle_if_current(tag, settle);
        }
        Err(e) if e.is_retryable() => {
            warn!(%category, error = %e, "Fetch failed, keeping last known data");
            cache.settle_if_current(tag, settle);
        }
        Err(e) => {
            error!(%category, error = %e, code = ?e.code(), "Fetch rejected");
            cache.settle_if_current(tag, settle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::LocalFeed;
    use async_trait::async_trait;
    use medsync_core::{ChangeOperation, RowFilter};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn owned(key: &str) -> Scope {
        Scope::owned(key).unwrap()
    }

    fn medicines_plan() -> ChannelPlan {
        Arc::new(|scope: &Scope| {
            vec![ChannelSpec::filtered("medicines", "calendar_id", scope.key())]
        })
    }

    /// Loader returning the scope key after a per-key latency.
    fn echo_loader(calls: Arc<AtomicUsize>) -> Loader<String> {
        Arc::new(move |scope: Scope| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let latency = if scope.key() == "slow" { 500 } else { 10 };
                sleep(ms(latency)).await;
                Ok(scope.key().to_string())
            }
            .boxed()
        })
    }

    /// Holds every subscribe until the test releases a permit.
    struct GatedFeed {
        inner: LocalFeed,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ChangeFeed for GatedFeed {
        async fn subscribe(&self, spec: ChannelSpec, callback: ChangeCallback) -> SyncResult<FeedHandle> {
            let permit = self.gate.acquire().await.map_err(|_| SyncError::ShuttingDown)?;
            permit.forget();
            self.inner.subscribe(spec, callback).await
        }

        async fn unsubscribe(&self, handle: FeedHandle) -> SyncResult<()> {
            self.inner.unsubscribe(handle).await
        }
    }

    struct Fixture {
        feed: LocalFeed,
        cache: Arc<CacheEntry<String>>,
        loading: LoadingState,
        scope_tx: watch::Sender<Option<Scope>>,
        calls: Arc<AtomicUsize>,
        handle: ManagerHandle,
    }

    fn fixture(loader: Option<Loader<String>>) -> Fixture {
        build(loader, None, None)
    }

    fn build(
        loader: Option<Loader<String>>,
        unscoped_ready: Option<ReadyCheck>,
        gate: Option<Arc<Semaphore>>,
    ) -> Fixture {
        let feed = LocalFeed::new();
        let dyn_feed: Arc<dyn ChangeFeed> = match gate {
            Some(gate) => Arc::new(GatedFeed {
                inner: feed.clone(),
                gate,
            }),
            None => Arc::new(feed.clone()),
        };
        let cache = Arc::new(CacheEntry::new());
        let loading = LoadingState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (scope_tx, scope_rx) = watch::channel(None);

        let handle = LifecycleManager::spawn(
            CategoryBinding {
                category: ResourceCategory::Medicines,
                loader: loader.unwrap_or_else(|| echo_loader(calls.clone())),
                plan: medicines_plan(),
                cache: cache.clone(),
                unscoped_ready,
            },
            dyn_feed,
            loading.clone(),
            DebounceConfig::trailing(ms(250)),
            scope_rx,
            CancellationToken::new(),
        );

        Fixture {
            feed,
            cache,
            loading,
            scope_tx,
            calls,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_scoped() {
        let f = fixture(None);
        sleep(ms(50)).await;
        assert_eq!(f.handle.state(), LifecycleState::Idle);
        assert_eq!(f.feed.live_count(), 0);
        assert!(f.loading.is_loading(ResourceCategory::Medicines));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscoped_settles_only_when_ready() {
        let ready = Arc::new(AtomicBool::new(false));
        let check = ready.clone();
        let f = build(None, Some(Arc::new(move || check.load(Ordering::SeqCst))), None);
        sleep(ms(10)).await;
        assert!(f.loading.is_loading(ResourceCategory::Medicines));

        // Signed in, nothing selected.
        ready.store(true, Ordering::SeqCst);
        f.scope_tx.send_replace(None);
        sleep(ms(10)).await;
        assert!(!f.loading.is_loading(ResourceCategory::Medicines));
        assert!(f.cache.get().is_none());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(50)).await;
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("c1"));

        f.scope_tx.send_replace(None);
        sleep(ms(10)).await;
        assert_eq!(f.handle.state(), LifecycleState::Idle);
        assert!(f.cache.get().is_none());
        assert!(!f.loading.is_loading(ResourceCategory::Medicines));

        // Signed out again.
        ready.store(false, Ordering::SeqCst);
        f.scope_tx.send_replace(None);
        sleep(ms(10)).await;
        assert!(f.loading.is_loading(ResourceCategory::Medicines));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_replaced_mid_subscribe_releases_handles() {
        let gate = Arc::new(Semaphore::new(0));
        let f = build(None, None, Some(gate.clone()));
        let mut states = f.handle.subscribe_state();

        f.scope_tx.send_replace(Some(owned("a")));
        states
            .wait_for(|s| *s == LifecycleState::Subscribing)
            .await
            .unwrap();

        f.scope_tx.send_replace(Some(owned("b")));
        gate.add_permits(2);
        sleep(ms(50)).await;

        assert_eq!(f.handle.state(), LifecycleState::Active);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("b"));
        assert_eq!(
            f.feed.live_specs(),
            vec![ChannelSpec::filtered("medicines", "calendar_id", "b")]
        );
        assert_eq!(f.feed.subscribe_count() - f.feed.unsubscribe_count(), 1);

        f.handle.shutdown().await;
        assert_eq!(f.feed.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_fetches_and_settles() {
        let f = fixture(None);
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(50)).await;

        assert_eq!(f.handle.state(), LifecycleState::Active);
        assert_eq!(f.feed.live_count(), 1);
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("c1"));
        assert!(!f.loading.is_loading(ResourceCategory::Medicines));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_live_handle() {
        let f = fixture(None);
        for key in ["c1", "c2", "c3", "c4", "c5"] {
            f.scope_tx.send_replace(Some(owned(key)));
            sleep(ms(5)).await;
            assert!(f.feed.live_count() <= 1);
        }
        sleep(ms(100)).await;

        assert_eq!(f.feed.live_count(), 1);
        assert_eq!(f.feed.unsubscribe_count(), f.feed.subscribe_count() - 1);
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("c5"));

        f.handle.shutdown().await;
        assert_eq!(f.feed.live_count(), 0);
        assert_eq!(f.feed.unsubscribe_count(), f.feed.subscribe_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_never_lands() {
        let f = fixture(None);
        f.scope_tx.send_replace(Some(owned("slow")));
        sleep(ms(50)).await;
        f.scope_tx.send_replace(Some(owned("fast")));

        sleep(ms(1000)).await;
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("fast"));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_events_refetch_after_window() {
        let f = fixture(None);
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(50)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        let event = ChangeEvent::new("medicines", ChangeOperation::Update)
            .with_filter(RowFilter::eq("calendar_id", "c1"));
        for _ in 0..5 {
            assert_eq!(f.feed.emit(event.clone()), 1);
            sleep(ms(20)).await;
        }
        sleep(ms(400)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);

        // Events for another calendar are not delivered.
        let other = ChangeEvent::new("medicines", ChangeOperation::Update)
            .with_filter(RowFilter::eq("calendar_id", "c2"));
        assert_eq!(f.feed.emit(other), 0);
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_scope_tears_down() {
        let f = fixture(None);
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(50)).await;

        f.scope_tx.send_replace(None);
        sleep(ms(10)).await;
        assert_eq!(f.handle.state(), LifecycleState::Idle);
        assert_eq!(f.feed.live_count(), 0);
        assert!(f.cache.get().is_none());
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_channel_still_fetches() {
        let f = fixture(None);
        f.feed.refuse_table("medicines");
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(50)).await;

        assert_eq!(f.handle.state(), LifecycleState::Active);
        assert_eq!(f.feed.live_count(), 0);
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("c1"));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_known_good() {
        let fail = Arc::new(AtomicUsize::new(0));
        let fail_after_first = fail.clone();
        let loader: Loader<String> = Arc::new(move |scope: Scope| {
            let n = fail_after_first.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(scope.key().to_string())
                } else {
                    Err(SyncError::NetworkFailure("connection reset".into()))
                }
            }
            .boxed()
        });
        let f = fixture(Some(loader));
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(10)).await;

        f.loading.begin(ResourceCategory::Medicines);
        f.handle.refresh();
        sleep(ms(10)).await;

        assert_eq!(fail.load(Ordering::SeqCst), 2);
        assert_eq!(f.cache.get().as_deref().map(String::as_str), Some("c1"));
        assert!(!f.loading.is_loading(ResourceCategory::Medicines));
        f.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_session_leaves_flag_raised() {
        let loader: Loader<String> =
            Arc::new(|_: Scope| async { Err::<String, _>(SyncError::AuthUnavailable) }.boxed());
        let f = fixture(Some(loader));
        f.scope_tx.send_replace(Some(owned("c1")));
        sleep(ms(10)).await;

        assert!(f.loading.is_loading(ResourceCategory::Medicines));
        assert!(f.cache.get().is_none());
        f.handle.shutdown().await;
    }
}
