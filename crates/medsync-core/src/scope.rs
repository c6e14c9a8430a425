//! # Scopes
//!
//! A [`Scope`] says which slice of remote data a subscription watches and
//! which access path the requests take.
//!
//! ```text
//!   Scope { source_kind, key, as_of_date? }
//!
//!   owned           key = calendar id (or identity id for account lists)
//!   shared_by_user  key = calendar id shared with the signed-in account
//!   shared_by_token key = anonymous share token
//! ```
//!
//! Scopes are immutable values. Changing any field means building a new
//! scope, which the engine treats as a full re-subscription.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::validation::validate_scope_key;

// =============================================================================
// Source Kind
// =============================================================================

/// The three ways a calendar can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Owned,
    SharedByUser,
    SharedByToken,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Owned,
        SourceKind::SharedByUser,
        SourceKind::SharedByToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Owned => "owned",
            SourceKind::SharedByUser => "shared_by_user",
            SourceKind::SharedByToken => "shared_by_token",
        }
    }

    /// Link-shared access is anonymous; the other kinds need a session.
    pub fn requires_session(&self) -> bool {
        !matches!(self, SourceKind::SharedByToken)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owned" => Ok(SourceKind::Owned),
            "shared_by_user" | "shared-by-user" => Ok(SourceKind::SharedByUser),
            "shared_by_token" | "shared-by-token" => Ok(SourceKind::SharedByToken),
            other => Err(CoreError::UnknownSourceKind(other.to_string())),
        }
    }
}

// =============================================================================
// Scope
// =============================================================================

/// Identifies the data a subscription is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    source_kind: SourceKind,
    key: String,
    #[ts(as = "Option<String>")]
    as_of_date: Option<NaiveDate>,
}

impl Scope {
    /// Builds a scope, rejecting keys that cannot be placed in a URL path
    /// or a feed filter.
    pub fn new(source_kind: SourceKind, key: impl Into<String>) -> CoreResult<Self> {
        let key = key.into();
        validate_scope_key(&key)?;
        Ok(Self {
            source_kind,
            key,
            as_of_date: None,
        })
    }

    pub fn owned(key: impl Into<String>) -> CoreResult<Self> {
        Self::new(SourceKind::Owned, key)
    }

    pub fn shared_by_user(key: impl Into<String>) -> CoreResult<Self> {
        Self::new(SourceKind::SharedByUser, key)
    }

    pub fn shared_by_token(key: impl Into<String>) -> CoreResult<Self> {
        Self::new(SourceKind::SharedByToken, key)
    }

    /// Returns a copy of this scope anchored at `date`.
    pub fn with_as_of_date(&self, date: Option<NaiveDate>) -> Self {
        Self {
            as_of_date: date,
            ..self.clone()
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn as_of_date(&self) -> Option<NaiveDate> {
        self.as_of_date
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_kind, self.key)?;
        if let Some(date) = self.as_of_date {
            write!(f, "@{}", date)?;
        }
        Ok(())
    }
}

// =============================================================================
// Resource Category
// =============================================================================

/// One kind of remote collection the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Calendars,
    SharedCalendars,
    Tokens,
    Notifications,
    Medicines,
    Boxes,
    Schedule,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 7] = [
        ResourceCategory::Calendars,
        ResourceCategory::SharedCalendars,
        ResourceCategory::Tokens,
        ResourceCategory::Notifications,
        ResourceCategory::Medicines,
        ResourceCategory::Boxes,
        ResourceCategory::Schedule,
    ];

    /// Categories whose first load gates the aggregate loading state.
    pub const INITIAL: [ResourceCategory; 6] = [
        ResourceCategory::Calendars,
        ResourceCategory::SharedCalendars,
        ResourceCategory::Tokens,
        ResourceCategory::Notifications,
        ResourceCategory::Medicines,
        ResourceCategory::Boxes,
    ];

    /// Categories scoped to the signed-in identity rather than a calendar.
    pub const IDENTITY: [ResourceCategory; 4] = [
        ResourceCategory::Calendars,
        ResourceCategory::SharedCalendars,
        ResourceCategory::Tokens,
        ResourceCategory::Notifications,
    ];

    /// Categories scoped to the selected calendar.
    pub const CALENDAR: [ResourceCategory; 3] = [
        ResourceCategory::Medicines,
        ResourceCategory::Boxes,
        ResourceCategory::Schedule,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Calendars => "calendars",
            ResourceCategory::SharedCalendars => "shared_calendars",
            ResourceCategory::Tokens => "tokens",
            ResourceCategory::Notifications => "notifications",
            ResourceCategory::Medicines => "medicines",
            ResourceCategory::Boxes => "boxes",
            ResourceCategory::Schedule => "schedule",
        }
    }

    pub fn is_initial(&self) -> bool {
        Self::INITIAL.contains(self)
    }

    pub fn is_identity_level(&self) -> bool {
        Self::IDENTITY.contains(self)
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
