//! # Change Events
//!
//! Notifications emitted by the remote store when a row changes. They carry
//! no row payload: a change only means "something in this table moved", and
//! the engine answers it with a refetch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Operation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(ChangeOperation::Insert),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Event Mask
// =============================================================================

/// Which operations a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventMask {
    #[default]
    #[serde(rename = "*")]
    All,
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

impl EventMask {
    pub fn matches(&self, operation: ChangeOperation) -> bool {
        match self {
            EventMask::All => true,
            EventMask::Insert => operation == ChangeOperation::Insert,
            EventMask::Update => operation == ChangeOperation::Update,
            EventMask::Delete => operation == ChangeOperation::Delete,
        }
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventMask::All => "*",
            EventMask::Insert => "insert",
            EventMask::Update => "update",
            EventMask::Delete => "delete",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Row Filter
// =============================================================================

/// Equality filter on one column, written `<column>=eq.<value>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

impl FromStr for RowFilter {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = |reason: &str| CoreError::InvalidFilter {
            filter: s.to_string(),
            reason: reason.to_string(),
        };

        let (column, value) = s.split_once("=eq.").ok_or_else(|| invalid("missing '=eq.'"))?;
        if column.is_empty() {
            return Err(invalid("empty column"));
        }
        if value.is_empty() {
            return Err(invalid("empty value"));
        }
        Ok(Self::eq(column, value))
    }
}

impl Serialize for RowFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RowFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Change Event
// =============================================================================

/// A change notification as delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
    pub operation: ChangeOperation,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, operation: ChangeOperation) -> Self {
        Self {
            table: table.into(),
            filter: None,
            operation,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
