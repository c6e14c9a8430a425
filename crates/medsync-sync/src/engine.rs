//! # Sync Engine
//!
//! Main orchestrator. Owns every Cache Entry and Loading Flag, runs one
//! lifecycle manager per resource category, and re-scopes them when the
//! identity or the selected calendar changes.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine Architecture                         │
//! │                                                                         │
//! │   SessionStore ──identity──► watcher ──► reset loading, clear caches   │
//! │                                  │                                      │
//! │              ┌───────────────────┴───────────────┐                      │
//! │              ▼                                   ▼                      │
//! │     identity scope (watch)             calendar scope (watch)           │
//! │     Scope::owned(user_id)              select_calendar / date           │
//! │              │                                   │                      │
//! │   ┌──────────┼──────────┬─────────┐    ┌─────────┼─────────┐            │
//! │   ▼          ▼          ▼         ▼    ▼         ▼         ▼            │
//! │ calendars  shared    tokens   notifs  medicines boxes   schedule        │
//! │   │          │          │         │    │         │         │            │
//! │   └──────────┴── LifecycleManager ┴────┴─────────┴─────────┘            │
//! │                     │            │                                      │
//! │                     ▼            ▼                                      │
//! │               ChangeFeed     RefetchCoordinator ──► SourceMap / Api     │
//! │                                                        │                │
//! │                                          CacheEntry ◄──┘ + LoadingState │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Medicines and boxes follow the calendar scope without its date, so paging
//! the schedule only refetches the schedule.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::future::join_all;
use futures_util::FutureExt;
use medsync_core::{
    Calendar, EventMask, Medicine, MedicineBox, Notification, ResourceCategory, Schedule, Scope,
    ShareToken, SharedCalendar, SourceKind,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::cache::CacheEntry;
use crate::change_feed::{ChangeFeed, ChannelSpec, RealtimeFeed};
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::lifecycle::{
    CategoryBinding, ChannelPlan, LifecycleManager, LifecycleState, Loader, ManagerHandle, ReadyCheck,
};
use crate::loading::{LoadingSnapshot, LoadingState};
use crate::session::{Session, SessionStore};
use crate::source_map::{AccountActions, ReloadFn, ScopedSource, SourceMap};

// =============================================================================
// Engine Status
// =============================================================================

/// Point-in-time view for diagnostics and the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub running: bool,
    pub user_id: Option<String>,
    pub calendar_scope: Option<Scope>,
    pub loading: LoadingSnapshot,
    pub managers: BTreeMap<ResourceCategory, LifecycleState>,
}

// =============================================================================
// Channel Plans
// =============================================================================

/// Channels `category` watches while bound to `scope`.
///
/// Identity categories are keyed by user id, calendar categories by
/// calendar id (or share token for link-shared scopes).
pub fn channel_plan(category: ResourceCategory, scope: &Scope) -> Vec<ChannelSpec> {
    let key = scope.key();
    let by_token = scope.source_kind() == SourceKind::SharedByToken;

    match category {
        ResourceCategory::Calendars => vec![ChannelSpec::filtered("calendars", "owner_id", key)],
        ResourceCategory::SharedCalendars => vec![
            ChannelSpec::filtered("calendar_shares", "shared_with", key),
            // Another account revoking the share deletes a row we don't own.
            ChannelSpec::table("calendar_shares").only(EventMask::Delete),
        ],
        ResourceCategory::Tokens => vec![
            ChannelSpec::filtered("share_tokens", "owner_id", key),
            ChannelSpec::table("share_tokens").only(EventMask::Delete),
        ],
        ResourceCategory::Notifications => {
            vec![ChannelSpec::filtered("notifications", "user_id", key)]
        }
        ResourceCategory::Medicines | ResourceCategory::Boxes if by_token => Vec::new(),
        ResourceCategory::Medicines => {
            vec![ChannelSpec::filtered("medicines", "calendar_id", key)]
        }
        ResourceCategory::Boxes => {
            vec![ChannelSpec::filtered("medicine_boxes", "calendar_id", key)]
        }
        ResourceCategory::Schedule if by_token => {
            vec![ChannelSpec::filtered("share_tokens", "token", key).only(EventMask::Delete)]
        }
        ResourceCategory::Schedule => vec![
            ChannelSpec::filtered("medicine_boxes", "calendar_id", key),
            ChannelSpec::filtered("medicines", "calendar_id", key),
        ],
    }
}

fn plan_for(category: ResourceCategory) -> ChannelPlan {
    Arc::new(move |scope: &Scope| channel_plan(category, scope))
}

// =============================================================================
// Caches
// =============================================================================

#[derive(Default)]
struct Caches {
    calendars: Arc<CacheEntry<Vec<Calendar>>>,
    shared_calendars: Arc<CacheEntry<Vec<SharedCalendar>>>,
    tokens: Arc<CacheEntry<Vec<ShareToken>>>,
    notifications: Arc<CacheEntry<Vec<Notification>>>,
    medicines: Arc<CacheEntry<Vec<Medicine>>>,
    boxes: Arc<CacheEntry<Vec<MedicineBox>>>,
    schedule: Arc<CacheEntry<Schedule>>,
}

impl Caches {
    fn clear_all(&self) {
        self.calendars.clear();
        self.shared_calendars.clear();
        self.tokens.clear();
        self.notifications.clear();
        self.medicines.clear();
        self.boxes.clear();
        self.schedule.clear();
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct SyncEngine {
    config: Arc<EngineConfig>,
    session: SessionStore,
    feed: Arc<dyn ChangeFeed>,
    api: ApiClient,
    sources: SourceMap,
    loading: LoadingState,
    caches: Arc<Caches>,

    identity_scope: Arc<watch::Sender<Option<Scope>>>,
    /// Calendar scope without `as_of_date` (medicines, boxes).
    calendar_scope: Arc<watch::Sender<Option<Scope>>>,
    /// Calendar scope as selected, including the date (schedule).
    schedule_scope: Arc<watch::Sender<Option<Scope>>>,

    managers: BTreeMap<ResourceCategory, ManagerHandle>,
    identity_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Creates an engine over an existing change feed. Nothing runs until
    /// [`SyncEngine::start`].
    pub fn new(
        config: EngineConfig,
        session: SessionStore,
        feed: Arc<dyn ChangeFeed>,
    ) -> SyncResult<Self> {
        Self::with_cancel(config, session, feed, CancellationToken::new())
    }

    fn with_cancel(
        config: EngineConfig,
        session: SessionStore,
        feed: Arc<dyn ChangeFeed>,
        cancel: CancellationToken,
    ) -> SyncResult<Self> {
        config.validate()?;
        let api = ApiClient::new(&config, session.clone())?;

        Ok(SyncEngine {
            config: Arc::new(config),
            sources: SourceMap::new(api.clone()),
            api,
            session,
            feed,
            loading: LoadingState::new(),
            caches: Arc::new(Caches::default()),
            identity_scope: Arc::new(watch::channel(None).0),
            calendar_scope: Arc::new(watch::channel(None).0),
            schedule_scope: Arc::new(watch::channel(None).0),
            managers: BTreeMap::new(),
            identity_task: None,
            cancel,
        })
    }

    pub fn is_running(&self) -> bool {
        self.identity_task.is_some()
    }

    /// Spawns the lifecycle managers and the identity watcher.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            warn!("Sync engine already started");
            return Ok(());
        }

        info!(
            api_url = %self.config.service.api_url,
            debounce_ms = self.config.sync.debounce_ms,
            policy = %self.config.sync.debounce_policy,
            "Starting sync engine"
        );

        let api = self.api.clone();
        self.spawn_manager(
            ResourceCategory::Calendars,
            self.caches.calendars.clone(),
            self.identity_scope.subscribe(),
            identity_loader(api.clone(), |api| async move { api.list_calendars().await }.boxed()),
            None,
        );
        self.spawn_manager(
            ResourceCategory::SharedCalendars,
            self.caches.shared_calendars.clone(),
            self.identity_scope.subscribe(),
            identity_loader(api.clone(), |api| {
                async move { api.list_shared_calendars().await }.boxed()
            }),
            None,
        );
        self.spawn_manager(
            ResourceCategory::Tokens,
            self.caches.tokens.clone(),
            self.identity_scope.subscribe(),
            identity_loader(api.clone(), |api| async move { api.list_tokens().await }.boxed()),
            None,
        );
        self.spawn_manager(
            ResourceCategory::Notifications,
            self.caches.notifications.clone(),
            self.identity_scope.subscribe(),
            identity_loader(api, |api| async move { api.list_notifications().await }.boxed()),
            None,
        );

        // Signed in with nothing selected is a final, empty answer.
        let signed_in: ReadyCheck = {
            let identity = self.identity_scope.clone();
            Arc::new(move || identity.borrow().is_some())
        };

        let sources = self.sources.clone();
        self.spawn_manager(
            ResourceCategory::Medicines,
            self.caches.medicines.clone(),
            self.calendar_scope.subscribe(),
            Arc::new(move |scope: Scope| {
                let source = sources.get(scope.source_kind());
                async move { source.fetch_medicines(&scope).await }.boxed()
            }),
            Some(signed_in.clone()),
        );
        let sources = self.sources.clone();
        self.spawn_manager(
            ResourceCategory::Boxes,
            self.caches.boxes.clone(),
            self.calendar_scope.subscribe(),
            Arc::new(move |scope: Scope| {
                let source = sources.get(scope.source_kind());
                async move { source.fetch_boxes(&scope).await }.boxed()
            }),
            Some(signed_in.clone()),
        );
        let sources = self.sources.clone();
        self.spawn_manager(
            ResourceCategory::Schedule,
            self.caches.schedule.clone(),
            self.schedule_scope.subscribe(),
            Arc::new(move |scope: Scope| {
                let source = sources.get(scope.source_kind());
                async move { source.fetch_schedule(&scope).await }.boxed()
            }),
            Some(signed_in),
        );

        let watcher = IdentityWatcher {
            session_rx: self.session.subscribe(),
            loading: self.loading.clone(),
            caches: self.caches.clone(),
            identity_scope: self.identity_scope.clone(),
            calendar_scope: self.calendar_scope.clone(),
            schedule_scope: self.schedule_scope.clone(),
            cancel: self.cancel.child_token(),
        };
        self.identity_task = Some(tokio::spawn(watcher.run()));

        info!(managers = self.managers.len(), "Sync engine started");
        Ok(())
    }

    fn spawn_manager<T: Send + Sync + 'static>(
        &mut self,
        category: ResourceCategory,
        cache: Arc<CacheEntry<T>>,
        scope_rx: watch::Receiver<Option<Scope>>,
        loader: Loader<T>,
        unscoped_ready: Option<ReadyCheck>,
    ) {
        let handle = LifecycleManager::spawn(
            CategoryBinding {
                category,
                loader,
                plan: plan_for(category),
                cache,
                unscoped_ready,
            },
            self.feed.clone(),
            self.loading.clone(),
            self.config.debounce(),
            scope_rx,
            self.cancel.child_token(),
        );
        self.managers.insert(category, handle);
    }

    /// Stops every manager (timers, in-flight fetches, subscriptions) and
    /// the change feed.
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync engine");

        if let Some(task) = self.identity_task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(?e, "Identity watcher ended abnormally");
                }
            }
        }

        join_all(self.managers.values().map(|m| m.shutdown())).await;
        self.managers.clear();
        self.cancel.cancel();

        info!("Sync engine stopped");
    }

    // =========================================================================
    // Scope Control
    // =========================================================================

    /// Re-scopes medicines, boxes and schedule. `None` unbinds them.
    pub fn select_calendar(&self, scope: Option<Scope>) {
        let without_date = scope.as_ref().map(|s| s.with_as_of_date(None));
        debug!(scope = ?scope, "Calendar selected");
        self.calendar_scope.send_if_modified(|current| replace_if_changed(current, without_date));
        self.schedule_scope.send_if_modified(|current| replace_if_changed(current, scope));
    }

    /// Moves the schedule to another start date. Ignored without a calendar.
    pub fn set_schedule_date(&self, date: Option<NaiveDate>) {
        self.schedule_scope.send_if_modified(|current| match current {
            Some(scope) if scope.as_of_date() != date => {
                *scope = scope.with_as_of_date(date);
                true
            }
            _ => false,
        });
    }

    pub fn calendar_scope(&self) -> Option<Scope> {
        self.schedule_scope.borrow().clone()
    }

    // =========================================================================
    // Read Access
    // =========================================================================

    pub fn calendars(&self) -> Option<Arc<Vec<Calendar>>> {
        self.caches.calendars.get()
    }

    pub fn shared_calendars(&self) -> Option<Arc<Vec<SharedCalendar>>> {
        self.caches.shared_calendars.get()
    }

    pub fn tokens(&self) -> Option<Arc<Vec<ShareToken>>> {
        self.caches.tokens.get()
    }

    pub fn notifications(&self) -> Option<Arc<Vec<Notification>>> {
        self.caches.notifications.get()
    }

    pub fn medicines(&self) -> Option<Arc<Vec<Medicine>>> {
        self.caches.medicines.get()
    }

    pub fn boxes(&self) -> Option<Arc<Vec<MedicineBox>>> {
        self.caches.boxes.get()
    }

    pub fn schedule(&self) -> Option<Arc<Schedule>> {
        self.caches.schedule.get()
    }

    pub fn subscribe_calendars(&self) -> watch::Receiver<Option<Arc<Vec<Calendar>>>> {
        self.caches.calendars.subscribe()
    }

    pub fn subscribe_shared_calendars(&self) -> watch::Receiver<Option<Arc<Vec<SharedCalendar>>>> {
        self.caches.shared_calendars.subscribe()
    }

    pub fn subscribe_tokens(&self) -> watch::Receiver<Option<Arc<Vec<ShareToken>>>> {
        self.caches.tokens.subscribe()
    }

    pub fn subscribe_notifications(&self) -> watch::Receiver<Option<Arc<Vec<Notification>>>> {
        self.caches.notifications.subscribe()
    }

    pub fn subscribe_medicines(&self) -> watch::Receiver<Option<Arc<Vec<Medicine>>>> {
        self.caches.medicines.subscribe()
    }

    pub fn subscribe_boxes(&self) -> watch::Receiver<Option<Arc<Vec<MedicineBox>>>> {
        self.caches.boxes.subscribe()
    }

    pub fn subscribe_schedule(&self) -> watch::Receiver<Option<Arc<Schedule>>> {
        self.caches.schedule.subscribe()
    }

    pub fn is_initial_loading(&self) -> bool {
        self.loading.is_initial_loading()
    }

    pub fn is_loading(&self, category: ResourceCategory) -> bool {
        self.loading.is_loading(category)
    }

    pub fn subscribe_initial_loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    pub fn loading_snapshot(&self) -> LoadingSnapshot {
        self.loading.snapshot()
    }

    pub fn manager_states(&self) -> BTreeMap<ResourceCategory, LifecycleState> {
        self.managers
            .iter()
            .map(|(category, handle)| (*category, handle.state()))
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            user_id: self.session.user_id(),
            calendar_scope: self.calendar_scope(),
            loading: self.loading_snapshot(),
            managers: self.manager_states(),
        }
    }

    // =========================================================================
    // Write Access
    // =========================================================================

    fn reload_for(&self, categories: &[ResourceCategory]) -> ReloadFn {
        let handles: Vec<ManagerHandle> = categories
            .iter()
            .filter_map(|category| self.managers.get(category).cloned())
            .collect();
        Arc::new(move || handles.iter().for_each(ManagerHandle::refresh))
    }

    /// Operations on the selected calendar. Successful writes refetch its
    /// medicines, boxes and schedule.
    pub fn source(&self) -> Option<ScopedSource> {
        let scope = self.calendar_scope()?;
        Some(
            self.sources
                .scoped(scope, self.reload_for(&ResourceCategory::CALENDAR)),
        )
    }

    /// Identity-level operations. Successful writes refetch the identity
    /// categories.
    pub fn account(&self) -> AccountActions {
        AccountActions::new(self.api.clone(), self.reload_for(&ResourceCategory::IDENTITY))
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }
}

fn replace_if_changed(current: &mut Option<Scope>, next: Option<Scope>) -> bool {
    if *current == next {
        return false;
    }
    *current = next;
    true
}

fn identity_loader<T, F>(api: ApiClient, list: F) -> Loader<T>
where
    T: Send + 'static,
    F: Fn(ApiClient) -> futures_util::future::BoxFuture<'static, SyncResult<T>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(move |_scope: Scope| list(api.clone()))
}

// =============================================================================
// Identity Watcher
// =============================================================================

struct IdentityWatcher {
    session_rx: watch::Receiver<Option<Session>>,
    loading: LoadingState,
    caches: Arc<Caches>,
    identity_scope: Arc<watch::Sender<Option<Scope>>>,
    calendar_scope: Arc<watch::Sender<Option<Scope>>>,
    schedule_scope: Arc<watch::Sender<Option<Scope>>>,
    cancel: CancellationToken,
}

impl IdentityWatcher {
    fn user_id(&mut self) -> Option<String> {
        self.session_rx
            .borrow_and_update()
            .as_ref()
            .filter(|s| !s.is_expired())
            .map(|s| s.user_id.clone())
    }

    async fn run(mut self) {
        let mut current = self.user_id();
        self.identity_scope.send_replace(self.scope_for(current.as_deref()));
        // Unscoped calendar managers re-check against the identity just set.
        self.calendar_scope.send_if_modified(|scope| scope.is_none());
        self.schedule_scope.send_if_modified(|scope| scope.is_none());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = self.session_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = self.user_id();
                    if next != current {
                        self.apply(next.as_deref());
                        current = next;
                    }
                }
            }
        }
        debug!("Identity watcher stopped");
    }

    fn scope_for(&self, user_id: Option<&str>) -> Option<Scope> {
        let user_id = user_id?;
        match Scope::owned(user_id) {
            Ok(scope) => Some(scope),
            Err(e) => {
                warn!(%user_id, error = %e, "User id cannot be used as a scope");
                None
            }
        }
    }

    /// Login, logout or user switch.
    fn apply(&self, user_id: Option<&str>) {
        info!(user_id = ?user_id, "Identity changed, resetting engine state");
        // Fetches settle under the cache lock, so once the caches are
        // cleared no late result can settle a reset flag.
        self.caches.clear_all();
        self.loading.reset();
        // Identity first: calendar managers read it when their scope empties.
        self.identity_scope.send_replace(self.scope_for(user_id));
        self.calendar_scope.send_replace(None);
        self.schedule_scope.send_replace(None);
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`SyncEngine`] with optional collaborators.
pub struct SyncEngineBuilder {
    config: EngineConfig,
    session: Option<SessionStore>,
    feed: Option<Arc<dyn ChangeFeed>>,
}

impl SyncEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        SyncEngineBuilder {
            config,
            session: None,
            feed: None,
        }
    }

    pub fn with_session(mut self, session: SessionStore) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Builds the engine. Without an explicit feed this connects a
    /// [`RealtimeFeed`], so it must run inside a tokio runtime.
    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        let session = self.session.unwrap_or_default();
        let cancel = CancellationToken::new();
        let feed = match self.feed {
            Some(feed) => feed,
            None => Arc::new(RealtimeFeed::connect(
                self.config.transport(),
                session.clone(),
                cancel.child_token(),
            )),
        };
        SyncEngine::with_cancel(self.config, session, feed, cancel)
    }
}
