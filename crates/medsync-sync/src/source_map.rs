//! # Source Map
//!
//! Capability table mapping each [`SourceKind`] to the Data Service calls it
//! supports.
//!
//! ## Capabilities
//! ```text
//! ┌────────────────────┬──────────────┬────────────────┬─────────────────┐
//! │ operation          │ Owned        │ SharedByUser   │ SharedByToken   │
//! ├────────────────────┼──────────────┼────────────────┼─────────────────┤
//! │ schedule / pdf     │ ✓            │ ✓              │ ✓ (anonymous)   │
//! │ boxes              │ ✓            │ ✓              │ ✗               │
//! │ medicines          │ ✓            │ ✓              │ ✗               │
//! │ shared users       │ ✓            │ ✗              │ ✗               │
//! └────────────────────┴──────────────┴────────────────┴─────────────────┘
//!
//!   ✗ → SyncError::Unsupported, no request sent
//! ```
//!
//! [`ScopedSource`] binds a source to one [`Scope`] and turns every outcome
//! into an [`ActionResult`]. Successful writes invoke the reload callback the
//! caller injected, so whoever owns the scope decides what gets refetched.

use std::sync::Arc;

use async_trait::async_trait;
use medsync_core::types::sort_by_name;
use medsync_core::validation::{
    validate_id, validate_name, validate_new_box, validate_new_medicine,
};
use medsync_core::{
    ActionResult, BoxUpdate, Calendar, Medicine, MedicineBox, MedicineUpdate, NewBox,
    NewCalendar, NewMedicine, Notification, Schedule, Scope, ShareInvite, ShareToken,
    SharedCalendar, SharedUser, SourceKind,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiRequest, Auth};
use crate::error::{SyncError, SyncResult};

/// Injected "refetch what this scope shows" callback.
pub type ReloadFn = Arc<dyn Fn() + Send + Sync>;

fn unsupported<T>(operation: &'static str, kind: SourceKind) -> SyncResult<T> {
    Err(SyncError::Unsupported { operation, kind })
}

// =============================================================================
// Data Source Trait
// =============================================================================

/// Uniform access contract over the three source kinds.
///
/// Every method defaults to `Unsupported`; implementations override only
/// what their kind offers.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_schedule(&self, _scope: &Scope) -> SyncResult<Schedule> {
        unsupported("fetch_schedule", self.kind())
    }

    async fn download_pdf(&self, _scope: &Scope) -> SyncResult<Vec<u8>> {
        unsupported("download_pdf", self.kind())
    }

    async fn fetch_boxes(&self, _scope: &Scope) -> SyncResult<Vec<MedicineBox>> {
        unsupported("fetch_boxes", self.kind())
    }

    async fn create_box(&self, _scope: &Scope, _payload: &NewBox) -> SyncResult<MedicineBox> {
        unsupported("create_box", self.kind())
    }

    async fn update_box(&self, _scope: &Scope, _payload: &BoxUpdate) -> SyncResult<MedicineBox> {
        unsupported("update_box", self.kind())
    }

    async fn delete_box(&self, _scope: &Scope, _box_id: &str) -> SyncResult<()> {
        unsupported("delete_box", self.kind())
    }

    async fn fetch_medicines(&self, _scope: &Scope) -> SyncResult<Vec<Medicine>> {
        unsupported("fetch_medicines", self.kind())
    }

    async fn add_medicine(&self, _scope: &Scope, _medicine: &NewMedicine) -> SyncResult<Medicine> {
        unsupported("add_medicine", self.kind())
    }

    async fn update_medicines(&self, _scope: &Scope, _updates: &[MedicineUpdate]) -> SyncResult<()> {
        unsupported("update_medicines", self.kind())
    }

    async fn delete_medicines(&self, _scope: &Scope, _ids: &[String]) -> SyncResult<()> {
        unsupported("delete_medicines", self.kind())
    }

    async fn fetch_shared_users(&self, _scope: &Scope) -> SyncResult<Vec<SharedUser>> {
        unsupported("fetch_shared_users", self.kind())
    }

    async fn invite_user(&self, _scope: &Scope, _invite: &ShareInvite) -> SyncResult<SharedUser> {
        unsupported("invite_user", self.kind())
    }

    async fn remove_shared_user(&self, _scope: &Scope, _user_id: &str) -> SyncResult<()> {
        unsupported("remove_shared_user", self.kind())
    }
}

// =============================================================================
// Calendar Resource Paths
// =============================================================================

/// Calendar-scoped calls shared by the owned and shared-with-me kinds; they
/// differ only in the path prefix.
#[derive(Clone)]
struct CalendarRoutes {
    api: ApiClient,
    prefix: &'static [&'static str],
}

impl CalendarRoutes {
    fn path(&self, scope: &Scope, rest: &[&str]) -> Vec<String> {
        self.prefix
            .iter()
            .copied()
            .chain(std::iter::once(scope.key()))
            .chain(rest.iter().copied())
            .map(str::to_string)
            .collect()
    }

    async fn schedule(&self, scope: &Scope) -> SyncResult<Schedule> {
        let request = ApiRequest::get(&self.path(scope, &["schedule"]))
            .query_opt("startTime", scope.as_of_date());
        self.api.json(request).await
    }

    async fn pdf(&self, scope: &Scope) -> SyncResult<Vec<u8>> {
        let request = ApiRequest::get(&self.path(scope, &["schedule", "pdf"]))
            .query_opt("startTime", scope.as_of_date());
        self.api.bytes(request).await
    }

    async fn boxes(&self, scope: &Scope) -> SyncResult<Vec<MedicineBox>> {
        self.api.json(ApiRequest::get(&self.path(scope, &["boxes"]))).await
    }

    async fn create_box(&self, scope: &Scope, payload: &NewBox) -> SyncResult<MedicineBox> {
        let request = ApiRequest::post(&self.path(scope, &["boxes"])).json(payload)?;
        self.api.json(request).await
    }

    async fn update_box(&self, scope: &Scope, payload: &BoxUpdate) -> SyncResult<MedicineBox> {
        let request = ApiRequest::put(&self.path(scope, &["boxes", &payload.id])).json(payload)?;
        self.api.json(request).await
    }

    async fn delete_box(&self, scope: &Scope, box_id: &str) -> SyncResult<()> {
        self.api
            .empty(ApiRequest::delete(&self.path(scope, &["boxes", box_id])))
            .await
    }

    async fn medicines(&self, scope: &Scope) -> SyncResult<Vec<Medicine>> {
        let mut medicines: Vec<Medicine> = self
            .api
            .json(ApiRequest::get(&self.path(scope, &["medicines"])))
            .await?;
        sort_by_name(&mut medicines);
        Ok(medicines)
    }

    async fn add_medicine(&self, scope: &Scope, medicine: &NewMedicine) -> SyncResult<Medicine> {
        let request = ApiRequest::post(&self.path(scope, &["medicines"])).json(medicine)?;
        self.api.json(request).await
    }

    async fn update_medicines(&self, scope: &Scope, updates: &[MedicineUpdate]) -> SyncResult<()> {
        let request = ApiRequest::put(&self.path(scope, &["medicines"]))
            .json(&json!({ "medicines": updates }))?;
        self.api.empty(request).await
    }

    async fn delete_medicines(&self, scope: &Scope, ids: &[String]) -> SyncResult<()> {
        let request = ApiRequest::delete(&self.path(scope, &["medicines"]))
            .json(&json!({ "ids": ids }))?;
        self.api.empty(request).await
    }
}

// =============================================================================
// Owned
// =============================================================================

/// Calendars the signed-in user owns. Full capability set.
pub struct OwnedSource {
    routes: CalendarRoutes,
}

impl OwnedSource {
    pub fn new(api: ApiClient) -> Self {
        Self {
            routes: CalendarRoutes {
                api,
                prefix: &["calendars"],
            },
        }
    }
}

#[async_trait]
impl DataSource for OwnedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Owned
    }

    async fn fetch_schedule(&self, scope: &Scope) -> SyncResult<Schedule> {
        self.routes.schedule(scope).await
    }

    async fn download_pdf(&self, scope: &Scope) -> SyncResult<Vec<u8>> {
        self.routes.pdf(scope).await
    }

    async fn fetch_boxes(&self, scope: &Scope) -> SyncResult<Vec<MedicineBox>> {
        self.routes.boxes(scope).await
    }

    async fn create_box(&self, scope: &Scope, payload: &NewBox) -> SyncResult<MedicineBox> {
        self.routes.create_box(scope, payload).await
    }

    async fn update_box(&self, scope: &Scope, payload: &BoxUpdate) -> SyncResult<MedicineBox> {
        self.routes.update_box(scope, payload).await
    }

    async fn delete_box(&self, scope: &Scope, box_id: &str) -> SyncResult<()> {
        self.routes.delete_box(scope, box_id).await
    }

    async fn fetch_medicines(&self, scope: &Scope) -> SyncResult<Vec<Medicine>> {
        self.routes.medicines(scope).await
    }

    async fn add_medicine(&self, scope: &Scope, medicine: &NewMedicine) -> SyncResult<Medicine> {
        self.routes.add_medicine(scope, medicine).await
    }

    async fn update_medicines(&self, scope: &Scope, updates: &[MedicineUpdate]) -> SyncResult<()> {
        self.routes.update_medicines(scope, updates).await
    }

    async fn delete_medicines(&self, scope: &Scope, ids: &[String]) -> SyncResult<()> {
        self.routes.delete_medicines(scope, ids).await
    }

    async fn fetch_shared_users(&self, scope: &Scope) -> SyncResult<Vec<SharedUser>> {
        let path = self.routes.path(scope, &["shared-users"]);
        self.routes.api.json(ApiRequest::get(&path)).await
    }

    async fn invite_user(&self, scope: &Scope, invite: &ShareInvite) -> SyncResult<SharedUser> {
        let path = self.routes.path(scope, &["shared-users"]);
        self.routes.api.json(ApiRequest::post(&path).json(invite)?).await
    }

    async fn remove_shared_user(&self, scope: &Scope, user_id: &str) -> SyncResult<()> {
        let path = self.routes.path(scope, &["shared-users", user_id]);
        self.routes.api.empty(ApiRequest::delete(&path)).await
    }
}

// =============================================================================
// Shared With Me
// =============================================================================

/// Calendars another account shared with the signed-in user.
pub struct SharedUserSource {
    routes: CalendarRoutes,
}

impl SharedUserSource {
    pub fn new(api: ApiClient) -> Self {
        Self {
            routes: CalendarRoutes {
                api,
                prefix: &["shared", "users", "calendars"],
            },
        }
    }
}

#[async_trait]
impl DataSource for SharedUserSource {
    fn kind(&self) -> SourceKind {
        SourceKind::SharedByUser
    }

    async fn fetch_schedule(&self, scope: &Scope) -> SyncResult<Schedule> {
        self.routes.schedule(scope).await
    }

    async fn download_pdf(&self, scope: &Scope) -> SyncResult<Vec<u8>> {
        self.routes.pdf(scope).await
    }

    async fn fetch_boxes(&self, scope: &Scope) -> SyncResult<Vec<MedicineBox>> {
        self.routes.boxes(scope).await
    }

    async fn create_box(&self, scope: &Scope, payload: &NewBox) -> SyncResult<MedicineBox> {
        self.routes.create_box(scope, payload).await
    }

    async fn update_box(&self, scope: &Scope, payload: &BoxUpdate) -> SyncResult<MedicineBox> {
        self.routes.update_box(scope, payload).await
    }

    async fn delete_box(&self, scope: &Scope, box_id: &str) -> SyncResult<()> {
        self.routes.delete_box(scope, box_id).await
    }

    async fn fetch_medicines(&self, scope: &Scope) -> SyncResult<Vec<Medicine>> {
        self.routes.medicines(scope).await
    }

    async fn add_medicine(&self, scope: &Scope, medicine: &NewMedicine) -> SyncResult<Medicine> {
        self.routes.add_medicine(scope, medicine).await
    }

    async fn update_medicines(&self, scope: &Scope, updates: &[MedicineUpdate]) -> SyncResult<()> {
        self.routes.update_medicines(scope, updates).await
    }

    async fn delete_medicines(&self, scope: &Scope, ids: &[String]) -> SyncResult<()> {
        self.routes.delete_medicines(scope, ids).await
    }
}

// =============================================================================
// Link Shared
// =============================================================================

/// Read-only schedule access through a share token. No session needed.
pub struct TokenSource {
    api: ApiClient,
}

impl TokenSource {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    fn request(scope: &Scope, rest: &[&str]) -> ApiRequest {
        let path: Vec<&str> = ["tokens", scope.key()]
            .into_iter()
            .chain(rest.iter().copied())
            .collect();
        ApiRequest::get(&path)
            .query_opt("startTime", scope.as_of_date())
            .auth(Auth::Anonymous)
    }
}

#[async_trait]
impl DataSource for TokenSource {
    fn kind(&self) -> SourceKind {
        SourceKind::SharedByToken
    }

    async fn fetch_schedule(&self, scope: &Scope) -> SyncResult<Schedule> {
        self.api.json(Self::request(scope, &["schedule"])).await
    }

    async fn download_pdf(&self, scope: &Scope) -> SyncResult<Vec<u8>> {
        self.api.bytes(Self::request(scope, &["schedule", "pdf"])).await
    }
}

// =============================================================================
// Source Map
// =============================================================================

/// Capability table keyed by [`SourceKind`].
#[derive(Clone)]
pub struct SourceMap {
    owned: Arc<dyn DataSource>,
    shared_by_user: Arc<dyn DataSource>,
    shared_by_token: Arc<dyn DataSource>,
}

impl SourceMap {
    pub fn new(api: ApiClient) -> Self {
        Self::from_sources(
            Arc::new(OwnedSource::new(api.clone())),
            Arc::new(SharedUserSource::new(api.clone())),
            Arc::new(TokenSource::new(api)),
        )
    }

    pub fn from_sources(
        owned: Arc<dyn DataSource>,
        shared_by_user: Arc<dyn DataSource>,
        shared_by_token: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            owned,
            shared_by_user,
            shared_by_token,
        }
    }

    pub fn get(&self, kind: SourceKind) -> Arc<dyn DataSource> {
        match kind {
            SourceKind::Owned => self.owned.clone(),
            SourceKind::SharedByUser => self.shared_by_user.clone(),
            SourceKind::SharedByToken => self.shared_by_token.clone(),
        }
    }

    /// Binds the source for `scope`'s kind to that scope.
    pub fn scoped(&self, scope: Scope, reload: ReloadFn) -> ScopedSource {
        ScopedSource {
            source: self.get(scope.source_kind()),
            scope,
            reload,
        }
    }
}

// =============================================================================
// Scoped Source
// =============================================================================

/// Converts a call outcome into an `ActionResult`, logging failures.
fn settle<T>(operation: &str, result: SyncResult<T>) -> ActionResult<T> {
    match result {
        Ok(data) => ActionResult::Ok(data),
        Err(err) => {
            match &err {
                SyncError::AuthUnavailable | SyncError::Unsupported { .. } => {
                    debug!(operation, error = %err, "Operation skipped")
                }
                _ => warn!(operation, error = %err, "Operation failed"),
            }
            failure(err)
        }
    }
}

fn failure<T>(err: SyncError) -> ActionResult<T> {
    let code = err.code();
    match err {
        SyncError::ServerError { message, .. } => ActionResult::failed(message, code),
        other => ActionResult::failed(other.to_string(), code),
    }
}

/// One source bound to one scope. Methods never return `Err`.
#[derive(Clone)]
pub struct ScopedSource {
    scope: Scope,
    source: Arc<dyn DataSource>,
    reload: ReloadFn,
}

impl ScopedSource {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    fn write<T>(&self, operation: &str, result: SyncResult<T>) -> ActionResult<T> {
        let result = settle(operation, result);
        if result.is_success() {
            (self.reload)();
        }
        result
    }

    pub async fn fetch_schedule(&self) -> ActionResult<Schedule> {
        settle("fetch_schedule", self.source.fetch_schedule(&self.scope).await)
    }

    pub async fn download_pdf(&self) -> ActionResult<Vec<u8>> {
        settle("download_pdf", self.source.download_pdf(&self.scope).await)
    }

    pub async fn fetch_boxes(&self) -> ActionResult<Vec<MedicineBox>> {
        settle("fetch_boxes", self.source.fetch_boxes(&self.scope).await)
    }

    pub async fn create_box(&self, payload: NewBox) -> ActionResult<MedicineBox> {
        let result = match validate_new_box(&payload) {
            Ok(()) => self.source.create_box(&self.scope, &payload).await,
            Err(e) => Err(e.into()),
        };
        self.write("create_box", result)
    }

    pub async fn update_box(&self, payload: BoxUpdate) -> ActionResult<MedicineBox> {
        let checked = validate_id("id", &payload.id).and_then(|_| validate_new_box(&payload.fields));
        let result = match checked {
            Ok(()) => self.source.update_box(&self.scope, &payload).await,
            Err(e) => Err(e.into()),
        };
        self.write("update_box", result)
    }

    pub async fn delete_box(&self, box_id: &str) -> ActionResult<()> {
        let result = match validate_id("boxId", box_id) {
            Ok(()) => self.source.delete_box(&self.scope, box_id).await,
            Err(e) => Err(e.into()),
        };
        self.write("delete_box", result)
    }

    pub async fn fetch_medicines(&self) -> ActionResult<Vec<Medicine>> {
        settle("fetch_medicines", self.source.fetch_medicines(&self.scope).await)
    }

    pub async fn add_medicine(&self, medicine: NewMedicine) -> ActionResult<Medicine> {
        let result = match validate_new_medicine(&medicine) {
            Ok(()) => self.source.add_medicine(&self.scope, &medicine).await,
            Err(e) => Err(e.into()),
        };
        self.write("add_medicine", result)
    }

    pub async fn update_medicines(&self, updates: Vec<MedicineUpdate>) -> ActionResult<()> {
        let checked = updates.iter().try_for_each(|update| {
            validate_id("id", &update.id)?;
            match &update.name {
                Some(name) => validate_name("name", name),
                None => Ok(()),
            }
        });
        let result = match checked {
            Ok(()) => self.source.update_medicines(&self.scope, &updates).await,
            Err(e) => Err(e.into()),
        };
        self.write("update_medicines", result)
    }

    pub async fn delete_medicines(&self, ids: Vec<String>) -> ActionResult<()> {
        let result = match ids.iter().try_for_each(|id| validate_id("id", id)) {
            Ok(()) => self.source.delete_medicines(&self.scope, &ids).await,
            Err(e) => Err(e.into()),
        };
        self.write("delete_medicines", result)
    }

    pub async fn fetch_shared_users(&self) -> ActionResult<Vec<SharedUser>> {
        settle("fetch_shared_users", self.source.fetch_shared_users(&self.scope).await)
    }

    pub async fn invite_user(&self, invite: ShareInvite) -> ActionResult<SharedUser> {
        let result = match validate_id("email", invite.email.trim()) {
            Ok(()) => self.source.invite_user(&self.scope, &invite).await,
            Err(e) => Err(e.into()),
        };
        self.write("invite_user", result)
    }

    pub async fn remove_shared_user(&self, user_id: &str) -> ActionResult<()> {
        let result = match validate_id("userId", user_id) {
            Ok(()) => self.source.remove_shared_user(&self.scope, user_id).await,
            Err(e) => Err(e.into()),
        };
        self.write("remove_shared_user", result)
    }
}

// =============================================================================
// Account Actions
// =============================================================================

/// Identity-level operations (calendars, tokens, notifications) with the
/// same result and reload contract as [`ScopedSource`].
#[derive(Clone)]
pub struct AccountActions {
    api: ApiClient,
    reload: ReloadFn,
}

impl AccountActions {
    pub fn new(api: ApiClient, reload: ReloadFn) -> Self {
        Self { api, reload }
    }

    fn write<T>(&self, operation: &str, result: SyncResult<T>) -> ActionResult<T> {
        let result = settle(operation, result);
        if result.is_success() {
            (self.reload)();
        }
        result
    }

    pub async fn list_calendars(&self) -> ActionResult<Vec<Calendar>> {
        settle("list_calendars", self.api.list_calendars().await)
    }

    pub async fn list_shared_calendars(&self) -> ActionResult<Vec<SharedCalendar>> {
        settle("list_shared_calendars", self.api.list_shared_calendars().await)
    }

    pub async fn create_calendar(&self, name: &str) -> ActionResult<Calendar> {
        let calendar = NewCalendar {
            name: name.trim().to_string(),
        };
        let result = match validate_name("name", &calendar.name) {
            Ok(()) => self.api.create_calendar(&calendar).await,
            Err(e) => Err(e.into()),
        };
        self.write("create_calendar", result)
    }

    pub async fn rename_calendar(&self, calendar_id: &str, name: &str) -> ActionResult<Calendar> {
        let calendar = NewCalendar {
            name: name.trim().to_string(),
        };
        let checked = validate_id("calendarId", calendar_id)
            .and_then(|_| validate_name("name", &calendar.name));
        let result = match checked {
            Ok(()) => self.api.rename_calendar(calendar_id, &calendar).await,
            Err(e) => Err(e.into()),
        };
        self.write("rename_calendar", result)
    }

    pub async fn delete_calendar(&self, calendar_id: &str) -> ActionResult<()> {
        let result = match validate_id("calendarId", calendar_id) {
            Ok(()) => self.api.delete_calendar(calendar_id).await,
            Err(e) => Err(e.into()),
        };
        self.write("delete_calendar", result)
    }

    pub async fn list_tokens(&self) -> ActionResult<Vec<ShareToken>> {
        settle("list_tokens", self.api.list_tokens().await)
    }

    pub async fn create_token(&self, calendar_id: &str) -> ActionResult<ShareToken> {
        let result = match validate_id("calendarId", calendar_id) {
            Ok(()) => self.api.create_token(calendar_id).await,
            Err(e) => Err(e.into()),
        };
        self.write("create_token", result)
    }

    pub async fn delete_token(&self, token: &str) -> ActionResult<()> {
        let result = match validate_id("token", token) {
            Ok(()) => self.api.delete_token(token).await,
            Err(e) => Err(e.into()),
        };
        self.write("delete_token", result)
    }

    pub async fn list_notifications(&self) -> ActionResult<Vec<Notification>> {
        settle("list_notifications", self.api.list_notifications().await)
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> ActionResult<()> {
        let result = match validate_id("notificationId", notification_id) {
            Ok(()) => self.api.mark_notification_read(notification_id).await,
            Err(e) => Err(e.into()),
        };
        self.write("mark_notification_read", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::session::SessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn api() -> ApiClient {
        let mut config = EngineConfig::default();
        // Nothing listens here; tests below never reach the network.
        config.service.api_url = "http://127.0.0.1:9/api".to_string();
        ApiClient::new(&config, SessionStore::new()).unwrap()
    }

    fn counting_reload() -> (ReloadFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        (
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_map_resolves_kind() {
        let map = SourceMap::new(api());
        for kind in SourceKind::ALL {
            assert_eq!(map.get(kind).kind(), kind);
        }
    }

    #[test]
    fn test_calendar_route_prefixes() {
        let scope = Scope::shared_by_user("c1").unwrap();
        let shared = SharedUserSource::new(api());
        assert_eq!(
            shared.routes.path(&scope, &["boxes", "b1"]),
            vec!["shared", "users", "calendars", "c1", "boxes", "b1"]
        );

        let owned = OwnedSource::new(api());
        assert_eq!(
            owned.routes.path(&scope, &["schedule", "pdf"]),
            vec!["calendars", "c1", "schedule", "pdf"]
        );
    }

    #[tokio::test]
    async fn test_token_scope_rejects_boxes_with_405() {
        let (reload, count) = counting_reload();
        let scoped = SourceMap::new(api()).scoped(Scope::shared_by_token("tok").unwrap(), reload);

        let result = scoped.fetch_boxes().await;
        assert!(!result.is_success());
        assert_eq!(result.code(), Some(405));

        let result = scoped.delete_medicines(vec!["m1".into()]).await;
        assert_eq!(result.code(), Some(405));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shared_users_unsupported_for_shared_kind() {
        let (reload, _) = counting_reload();
        let scoped = SourceMap::new(api()).scoped(Scope::shared_by_user("c1").unwrap(), reload);
        let result = scoped.fetch_shared_users().await;
        assert_eq!(result.code(), Some(405));
        assert!(result.error().unwrap().contains("fetch_shared_users"));
    }

    #[tokio::test]
    async fn test_validation_fails_before_request() {
        let (reload, count) = counting_reload();
        let scoped = SourceMap::new(api()).scoped(Scope::owned("c1").unwrap(), reload);

        let result = scoped
            .add_medicine(NewMedicine {
                name: "   ".into(),
                description: None,
            })
            .await;
        assert_eq!(result.code(), Some(400));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_session_reports_401() {
        let (reload, count) = counting_reload();
        let scoped = SourceMap::new(api()).scoped(Scope::owned("c1").unwrap(), reload);
        let result = scoped.fetch_medicines().await;
        assert_eq!(result.code(), Some(401));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_server_failure_keeps_message() {
        let result: ActionResult<()> = failure(SyncError::ServerError {
            status: 403,
            code: 403,
            message: "Token revoked".into(),
        });
        assert_eq!(result.error(), Some("Token revoked"));
        assert_eq!(result.code(), Some(403));
    }
}
