//! End-to-end engine behavior against an in-process fake Data Service.
//!
//! The fake serves the REST surface on an ephemeral port and records every
//! request it sees; changes are injected through `LocalFeed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use medsync_core::{
    ChangeEvent, ChangeOperation, NewMedicine, ResourceCategory, RowFilter, Scope,
};
use medsync_sync::{
    ApiClient, EngineConfig, LocalFeed, Session, SessionStore, SyncEngine, SyncError,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

// =============================================================================
// Fake Data Service
// =============================================================================

#[derive(Default)]
struct Fake {
    requests: Mutex<Vec<String>>,
    calendars: Mutex<Vec<Value>>,
    medicines: Mutex<Vec<Value>>,
}

impl Fake {
    fn record(&self, line: String) {
        self.requests.lock().unwrap().push(line);
    }

    fn count(&self, line: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| *r == line).count()
    }

    fn total(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

type Shared = State<Arc<Fake>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer "))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Missing bearer token", "code": 401 })),
    )
        .into_response()
}

async fn calendars(State(fake): Shared, headers: HeaderMap) -> Response {
    fake.record("GET /calendars".into());
    if !authorized(&headers) {
        return unauthorized();
    }
    let list = fake.calendars.lock().unwrap().clone();
    Json(Value::Array(list)).into_response()
}

async fn empty_list(State(fake): Shared, headers: HeaderMap) -> Response {
    fake.record("GET identity-list".into());
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!([])).into_response()
}

async fn medicines(State(fake): Shared, Path(id): Path<String>) -> Response {
    fake.record(format!("GET /calendars/{}/medicines", id));
    let list = fake.medicines.lock().unwrap().clone();
    Json(Value::Array(list)).into_response()
}

async fn add_medicine(
    State(fake): Shared,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    fake.record(format!("POST /calendars/{}/medicines", id));
    let created = json!({
        "id": format!("m{}", fake.medicines.lock().unwrap().len() + 1),
        "calendarId": id,
        "name": body["name"],
    });
    fake.medicines.lock().unwrap().push(created.clone());
    Json(created).into_response()
}

async fn boxes(State(fake): Shared, Path(id): Path<String>) -> Response {
    fake.record(format!("GET /calendars/{}/boxes", id));
    Json(json!([])).into_response()
}

async fn schedule(
    State(fake): Shared,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    fake.record(format!("GET /calendars/{}/schedule", id));
    let start = query
        .get("startTime")
        .cloned()
        .unwrap_or_else(|| "2024-01-01".to_string());
    Json(json!({ "calendarName": "Alpha", "startTime": start, "days": [] })).into_response()
}

async fn token_schedule(State(fake): Shared, Path(token): Path<String>) -> Response {
    fake.record(format!("GET /tokens/{}/schedule", token));
    if token == "revoked" {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Token revoked", "code": 403 })),
        )
            .into_response();
    }
    Json(json!({ "startTime": "2024-01-01", "days": [] })).into_response()
}

async fn spawn_fake() -> (String, Arc<Fake>) {
    let fake = Arc::new(Fake::default());
    fake.calendars.lock().unwrap().extend([
        json!({ "id": "c2", "name": "zeta" }),
        json!({ "id": "c1", "name": "Alpha" }),
        json!({ "id": "c3", "name": "beta" }),
    ]);
    fake.medicines.lock().unwrap().extend([
        json!({ "id": "m2", "calendarId": "c1", "name": "Vitamin D" }),
        json!({ "id": "m1", "calendarId": "c1", "name": "aspirin" }),
    ]);

    let app = Router::new()
        .route("/api/calendars", get(calendars))
        .route("/api/shared/users/calendars", get(empty_list))
        .route("/api/tokens", get(empty_list))
        .route("/api/notifications", get(empty_list))
        .route("/api/calendars/{id}/medicines", get(medicines).post(add_medicine))
        .route("/api/calendars/{id}/boxes", get(boxes))
        .route("/api/calendars/{id}/schedule", get(schedule))
        .route("/api/tokens/{token}/schedule", get(token_schedule))
        .with_state(fake.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{}/api", addr), fake)
}

// =============================================================================
// Helpers
// =============================================================================

fn config(api_url: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.service.api_url = api_url.to_string();
    config
}

fn signed_in() -> SessionStore {
    SessionStore::with_session(Session::new("u1", "tok-u1", None))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for the first value published on a cache receiver.
async fn first_value<T>(rx: &mut watch::Receiver<Option<Arc<T>>>) -> Arc<T> {
    let value = timeout(Duration::from_secs(5), rx.wait_for(Option::is_some))
        .await
        .expect("timed out waiting for a value")
        .unwrap();
    value.clone().unwrap()
}

async fn started(api_url: &str, session: SessionStore, feed: &LocalFeed) -> SyncEngine {
    let mut engine = SyncEngine::new(config(api_url), session, Arc::new(feed.clone())).unwrap();
    engine.start().unwrap();
    engine
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_identity_data_loads_sorted() {
    let (url, _fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, signed_in(), &feed).await;

    wait_until("calendars", || engine.calendars().is_some()).await;
    let names: Vec<String> = engine
        .calendars()
        .unwrap()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    assert_eq!(names, vec!["Alpha", "beta", "zeta"]);

    // Signed in with nothing selected: every initial category settles.
    wait_until("initial loading done", || !engine.is_initial_loading()).await;
    assert!(engine.medicines().is_none());

    let mut medicines_rx = engine.subscribe_medicines();
    let mut boxes_rx = engine.subscribe_boxes();
    engine.select_calendar(Some(Scope::owned("c1").unwrap()));

    let medicines: Vec<String> = first_value(&mut medicines_rx)
        .await
        .iter()
        .map(|m| m.name.clone())
        .collect();
    assert_eq!(medicines, vec!["aspirin", "Vitamin D"]);
    assert!(first_value(&mut boxes_rx).await.is_empty());
    wait_until("calendar categories settled", || !engine.is_initial_loading()).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_login_without_calendars_finishes_loading() {
    let (url, fake) = spawn_fake().await;
    fake.calendars.lock().unwrap().clear();
    let feed = LocalFeed::new();
    let session = SessionStore::new();
    let mut engine = started(&url, session.clone(), &feed).await;
    let mut tokens_rx = engine.subscribe_tokens();
    let mut shared_rx = engine.subscribe_shared_calendars();

    sleep(Duration::from_millis(50)).await;
    assert!(engine.is_initial_loading());

    session.set(Some(Session::new("u1", "tok-u1", None)));
    wait_until("initial loading done", || !engine.is_initial_loading()).await;

    assert_eq!(engine.calendars().map(|c| c.len()), Some(0));
    assert!(first_value(&mut tokens_rx).await.is_empty());
    assert!(first_value(&mut shared_rx).await.is_empty());
    assert!(engine.calendar_scope().is_none());
    assert!(engine.medicines().is_none());
    assert_eq!(fake.count("GET /calendars"), 1);
    // Nothing calendar-scoped was requested.
    assert_eq!(fake.total(), 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_revoked_token_settles_empty() {
    let (url, fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, SessionStore::new(), &feed).await;

    engine.select_calendar(Some(Scope::shared_by_token("revoked").unwrap()));
    wait_until("schedule settled", || {
        !engine.is_loading(ResourceCategory::Schedule)
    })
    .await;

    assert!(engine.schedule().is_none());
    assert_eq!(fake.count("GET /tokens/revoked/schedule"), 1);

    // The same failure surfaced through the scoped source.
    let result = engine.source().unwrap().fetch_schedule().await;
    assert!(!result.is_success());
    assert_eq!(result.code(), Some(403));
    assert_eq!(result.error(), Some("Token revoked"));

    // Link-shared scopes have no medicines or boxes; they settle without a request.
    wait_until("calendar categories settled", || {
        !engine.is_loading(ResourceCategory::Medicines) && !engine.is_loading(ResourceCategory::Boxes)
    })
    .await;
    assert!(engine.medicines().is_none());
    assert_eq!(fake.total(), 2);

    // The revocation channel is the only one watched.
    let specs = feed.live_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].table, "share_tokens");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_capability_sends_nothing() {
    let (url, fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, SessionStore::new(), &feed).await;

    engine.select_calendar(Some(Scope::shared_by_token("tok-ok").unwrap()));
    wait_until("schedule", || engine.schedule().is_some()).await;
    let source = engine.source().unwrap();
    let before = fake.total();

    let result = source.fetch_boxes().await;
    assert_eq!(result.code(), Some(405));
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["code"], 405);

    let result = source
        .add_medicine(NewMedicine {
            name: "Ibuprofen".into(),
            description: None,
        })
        .await;
    assert_eq!(result.code(), Some(405));
    assert_eq!(fake.total(), before);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_missing_session_aborts_before_request() {
    let (url, fake) = spawn_fake().await;
    let api = ApiClient::new(&config(&url), SessionStore::new()).unwrap();

    let result = api.list_calendars().await;
    assert!(matches!(result, Err(SyncError::AuthUnavailable)));
    assert_eq!(fake.total(), 0);
}

#[tokio::test]
async fn test_change_burst_refetches_once() {
    let (url, fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, signed_in(), &feed).await;

    engine.select_calendar(Some(Scope::owned("c1").unwrap()));
    wait_until("medicines", || engine.medicines().is_some()).await;
    wait_until("schedule", || engine.schedule().is_some()).await;
    assert_eq!(fake.count("GET /calendars/c1/medicines"), 1);

    let event = ChangeEvent::new("medicines", ChangeOperation::Insert)
        .with_filter(RowFilter::eq("calendar_id", "c1"));
    for _ in 0..5 {
        // Medicines and schedule both watch this table.
        assert_eq!(feed.emit(event.clone()), 2);
        sleep(Duration::from_millis(20)).await;
    }

    sleep(Duration::from_millis(600)).await;
    assert_eq!(fake.count("GET /calendars/c1/medicines"), 2);
    assert_eq!(fake.count("GET /calendars/c1/schedule"), 2);
    // Boxes do not watch the medicines table.
    assert_eq!(fake.count("GET /calendars/c1/boxes"), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_successful_write_reloads_scope() {
    let (url, fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, signed_in(), &feed).await;

    engine.select_calendar(Some(Scope::owned("c1").unwrap()));
    wait_until("medicines", || engine.medicines().is_some()).await;

    let result = engine
        .source()
        .unwrap()
        .add_medicine(NewMedicine {
            name: "Ibuprofen".into(),
            description: None,
        })
        .await;
    assert!(result.is_success());
    assert_eq!(result.data().unwrap().id, "m3");

    wait_until("reloaded medicines", || {
        engine.medicines().map(|m| m.len()) == Some(3)
    })
    .await;
    assert_eq!(fake.count("POST /calendars/c1/medicines"), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_schedule_date_is_sent() {
    let (url, _fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let mut engine = started(&url, signed_in(), &feed).await;

    engine.select_calendar(Some(Scope::owned("c1").unwrap()));
    wait_until("schedule", || engine.schedule().is_some()).await;
    assert_eq!(engine.schedule().unwrap().start_time.to_string(), "2024-01-01");

    let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 4);
    engine.set_schedule_date(date);
    wait_until("moved schedule", || {
        engine.schedule().map(|s| s.start_time) == date
    })
    .await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_logout_resets_everything() {
    let (url, _fake) = spawn_fake().await;
    let feed = LocalFeed::new();
    let session = signed_in();
    let mut engine = started(&url, session.clone(), &feed).await;

    engine.select_calendar(Some(Scope::owned("c1").unwrap()));
    wait_until("loaded", || !engine.is_initial_loading()).await;
    assert!(feed.live_count() > 0);

    session.sign_out();
    wait_until("unsubscribed", || feed.live_count() == 0).await;

    assert!(engine.calendars().is_none());
    assert!(engine.medicines().is_none());
    assert!(engine.calendar_scope().is_none());
    assert!(ResourceCategory::INITIAL.iter().all(|c| engine.is_loading(*c)));
    assert!(engine.is_initial_loading());

    engine.shutdown().await;
    assert_eq!(feed.unsubscribe_count(), feed.subscribe_count());
}
