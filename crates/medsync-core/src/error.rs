//! # Error Types
//!
//! Domain-specific error types for medsync-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  medsync-core errors (this file)                                       │
//! │  ├── CoreError        - Malformed scopes, filters, source kinds        │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  medsync-sync errors (separate crate)                                  │
//! │  └── SyncError        - Network, session, feed and config failures     │
//! │                                                                         │
//! │  Presentation layer                                                    │
//! │  └── ActionResult     - What the UI sees ({success, error, code})      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → ActionResult          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building domain values.
///
/// Every variant here is a programmer error: the caller handed the core a
/// value it cannot represent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Source kind string did not name one of the three kinds.
    #[error("Unknown source kind: {0}")]
    UnknownSourceKind(String),

    /// Row filter string is not of the form `<column>=eq.<value>`.
    #[error("Invalid row filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Change operation string was not insert, update or delete.
    #[error("Unknown change operation: {0}")]
    UnknownOperation(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any request leaves the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g. a scope key carrying a path separator).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// End date precedes start date.
    #[error("{field} must not be before {other}")]
    DateOrder { field: String, other: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidFilter {
            filter: "calendar_id".to_string(),
            reason: "missing '=eq.'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid row filter 'calendar_id': missing '=eq.'"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "name".to_string(),
        };
        assert_eq!(err.to_string(), "name is required");

        let err = ValidationError::DateOrder {
            field: "endDate".to_string(),
            other: "startDate".to_string(),
        };
        assert_eq!(err.to_string(), "endDate must not be before startDate");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "key".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
