//! # Data Service Client
//!
//! Thin reqwest wrapper for the REST Data Service.
//!
//! ## Request Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ApiRequest::get(["calendars", id, "boxes"])                           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  url: <api_url>/calendars/<id>/boxes   (segments percent-encoded)      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  Auth::Session? ── no session ──► Err(AuthUnavailable)  (nothing sent) │
//! │        │ yes                                                            │
//! │        ▼                                                                │
//! │  Authorization: Bearer <token>, apikey: <key>                          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  2xx ──► body      non-2xx ──► {error, code} ──► ServerError           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use medsync_core::types::sort_by_name;
use medsync_core::{Calendar, NewCalendar, Notification, SharedCalendar, ShareToken};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::SessionStore;

// =============================================================================
// Request Description
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Bearer token from the current session; required.
    Session,
    /// Anonymous (link-shared access).
    Anonymous,
}

/// One Data Service call, built before the session is consulted.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    auth: Auth,
}

impl ApiRequest {
    pub fn new<S: AsRef<str>>(method: Method, segments: &[S]) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.as_ref().to_string()).collect(),
            query: Vec::new(),
            body: None,
            auth: Auth::Session,
        }
    }

    pub fn get<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::new(Method::GET, segments)
    }

    pub fn post<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::new(Method::POST, segments)
    }

    pub fn put<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::new(Method::PUT, segments)
    }

    pub fn delete<S: AsRef<str>>(segments: &[S]) -> Self {
        Self::new(Method::DELETE, segments)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> SyncResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: url::Url,
    api_key: Option<String>,
    session: SessionStore,
}

impl ApiClient {
    pub fn new(config: &EngineConfig, session: SessionStore) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base = url::Url::parse(&config.service.api_url)?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(config.service.api_url.clone()));
        }

        Ok(Self {
            http,
            base,
            api_key: config.service.api_key.clone(),
            session,
        })
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    fn url(&self, request: &ApiRequest) -> SyncResult<url::Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(&request.segments);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    fn build(&self, request: ApiRequest) -> SyncResult<reqwest::RequestBuilder> {
        let token = match request.auth {
            Auth::Session => Some(self.session.access_token().ok_or(SyncError::AuthUnavailable)?),
            Auth::Anonymous => None,
        };

        let url = self.url(&request)?;
        debug!(method = %request.method, %url, "Data Service request");

        let mut builder = self.http.request(request.method, url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }
        Ok(builder)
    }

    async fn send(&self, request: ApiRequest) -> SyncResult<reqwest::Response> {
        let path = request.path();
        let response = self.build(request)?.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let err = server_error(status, response.text().await.unwrap_or_default());
        warn!(%path, status = status.as_u16(), error = %err, "Data Service rejected request");
        Err(err)
    }

    /// Sends and decodes a JSON body.
    pub async fn json<T: DeserializeOwned>(&self, request: ApiRequest) -> SyncResult<T> {
        Ok(self.send(request).await?.json::<T>().await?)
    }

    /// Sends and ignores the body.
    pub async fn empty(&self, request: ApiRequest) -> SyncResult<()> {
        self.send(request).await.map(|_| ())
    }

    /// Sends and returns the raw body.
    pub async fn bytes(&self, request: ApiRequest) -> SyncResult<Vec<u8>> {
        Ok(self.send(request).await?.bytes().await?.to_vec())
    }

    // =========================================================================
    // Identity-level Operations
    // =========================================================================

    /// Owned calendars, sorted by name.
    pub async fn list_calendars(&self) -> SyncResult<Vec<Calendar>> {
        let mut calendars: Vec<Calendar> = self.json(ApiRequest::get(&["calendars"])).await?;
        sort_by_name(&mut calendars);
        Ok(calendars)
    }

    /// Calendars shared with the signed-in user, sorted by name.
    pub async fn list_shared_calendars(&self) -> SyncResult<Vec<SharedCalendar>> {
        let mut calendars: Vec<SharedCalendar> = self
            .json(ApiRequest::get(&["shared", "users", "calendars"]))
            .await?;
        sort_by_name(&mut calendars);
        Ok(calendars)
    }

    pub async fn create_calendar(&self, calendar: &NewCalendar) -> SyncResult<Calendar> {
        self.json(ApiRequest::post(&["calendars"]).json(calendar)?)
            .await
    }

    pub async fn rename_calendar(&self, calendar_id: &str, calendar: &NewCalendar) -> SyncResult<Calendar> {
        self.json(ApiRequest::put(&["calendars", calendar_id]).json(calendar)?)
            .await
    }

    pub async fn delete_calendar(&self, calendar_id: &str) -> SyncResult<()> {
        self.empty(ApiRequest::delete(&["calendars", calendar_id]))
            .await
    }

    pub async fn list_tokens(&self) -> SyncResult<Vec<ShareToken>> {
        self.json(ApiRequest::get(&["tokens"])).await
    }

    pub async fn create_token(&self, calendar_id: &str) -> SyncResult<ShareToken> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct NewToken<'a> {
            calendar_id: &'a str,
        }
        self.json(ApiRequest::post(&["tokens"]).json(&NewToken { calendar_id })?)
            .await
    }

    pub async fn delete_token(&self, token: &str) -> SyncResult<()> {
        self.empty(ApiRequest::delete(&["tokens", token])).await
    }

    pub async fn list_notifications(&self) -> SyncResult<Vec<Notification>> {
        self.json(ApiRequest::get(&["notifications"])).await
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> SyncResult<()> {
        self.empty(ApiRequest::post(&["notifications", notification_id]))
            .await
    }
}

/// Maps a non-success response to `ServerError`, preferring the body's
/// `{error, code}` over the bare status.
fn server_error(status: StatusCode, body: String) -> SyncError {
    let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.code)
        .unwrap_or(status.as_u16());
    let message = parsed
        .and_then(|b| b.error.or(b.message))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });

    SyncError::ServerError {
        status: status.as_u16(),
        code,
        message,
    }
}
