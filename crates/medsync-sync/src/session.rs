//! # Session Store
//!
//! Holds the signed-in identity and hands out access tokens. Sessions are
//! issued elsewhere; this module only decodes the JWT claims it needs
//! (subject and expiry) and publishes identity changes.
//!
//! ## Session Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Session Flow                                   │
//! │                                                                         │
//! │  auth provider ──sign_in(jwt)──► SessionStore ──watch──► SyncEngine    │
//! │                                       │                   (re-scope)   │
//! │                                       │                                 │
//! │                                       ├──access_token()──► ApiClient   │
//! │                                       └──access_token()──► RealtimeFeed│
//! │                                                                         │
//! │  An expired session reads as "no session": requests that need one      │
//! │  fail with AuthUnavailable before anything is sent.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
}

/// The signed-in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// Builds a session from a JWT access token.
    ///
    /// The signature is not checked: the Data Service verifies every
    /// request, the engine only needs to know who is signed in and until when.
    pub fn from_access_token(token: &str) -> SyncResult<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)?;

        if data.claims.sub.trim().is_empty() {
            return Err(SyncError::InvalidSession("token has no subject".into()));
        }

        let expires_at = match data.claims.exp {
            Some(exp) => Some(
                Utc.timestamp_opt(exp, 0)
                    .single()
                    .ok_or_else(|| SyncError::InvalidSession(format!("bad exp {}", exp)))?,
            ),
            None => None,
        };

        Ok(Self::new(data.claims.sub, token, expires_at))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }

    pub fn remaining_secs(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_seconds().max(0))
    }
}

// =============================================================================
// Session Store
// =============================================================================

/// Shared, cloneable holder of the current session.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Option<Session>>>,
    token_tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Starts signed out.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        let (token_tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            token_tx: Arc::new(token_tx),
        }
    }

    pub fn with_session(session: Session) -> Self {
        let store = Self::new();
        store.set(Some(session));
        store
    }

    /// Replaces the session. Identity subscribers are only woken when the
    /// user changes; token subscribers on every new access token.
    pub fn set(&self, session: Option<Session>) {
        let token = session.as_ref().map(|s| s.access_token.clone());
        self.token_tx.send_if_modified(|current| {
            let changed = *current != token;
            *current = token;
            changed
        });
        self.tx.send_if_modified(|current| {
            let identity_changed = current.as_ref().map(|s| &s.user_id)
                != session.as_ref().map(|s| &s.user_id);
            *current = session;
            identity_changed
        });
    }

    pub fn sign_in(&self, access_token: &str) -> SyncResult<()> {
        let session = Session::from_access_token(access_token)?;
        info!(user_id = %session.user_id, "Session signed in");
        self.set(Some(session));
        Ok(())
    }

    pub fn sign_out(&self) {
        info!("Session signed out");
        self.set(None);
    }

    /// The current session, unless it has expired.
    pub fn current(&self) -> Option<Session> {
        let session = self.tx.borrow().clone()?;
        if session.is_expired() {
            debug!(user_id = %session.user_id, "Session expired");
            return None;
        }
        Some(session)
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|s| s.access_token)
    }

    pub fn user_id(&self) -> Option<String> {
        self.current().map(|s| s.user_id)
    }

    /// Watch the session; fires on sign-in, sign-out and user switch.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    /// Watch the access token; also fires on a same-user token refresh.
    pub fn subscribe_token(&self) -> watch::Receiver<Option<String>> {
        self.token_tx.subscribe()
    }
}
