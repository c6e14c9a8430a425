//! # Validation Module
//!
//! Input validation for scope keys and write payloads.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Presentation (forms)                                         │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Engine (Rust)                                                │
//! │  ├── Scope keys (interpolated into REST paths and feed filters)        │
//! │  └── THIS MODULE: payload checks before a request is sent              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Data Service                                                 │
//! │  └── Permission checks, schedule rules                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use medsync_core::validation::{validate_name, validate_quantity};
//!
//! validate_name("name", "Morning pills").unwrap();
//! assert!(validate_quantity(0).is_err());
//! ```

use chrono::NaiveDate;

use crate::error::ValidationError;
use crate::types::{BoxMedicine, NewBox, NewMedicine};
use crate::{MAX_INTAKE_QUANTITY, MAX_NAME_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a display name (calendar, medicine, box).
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most 100 characters
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates an entity id.
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a scope key (calendar id, share token or identity).
///
/// Keys end up in URL paths and feed filters, so path and query
/// delimiters are rejected along with whitespace.
///
/// ## Example
/// ```rust
/// use medsync_core::validation::validate_scope_key;
///
/// assert!(validate_scope_key("cal-42").is_ok());
/// assert!(validate_scope_key("").is_err());
/// assert!(validate_scope_key("a/b").is_err());
/// ```
pub fn validate_scope_key(key: &str) -> ValidationResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "key".to_string(),
        });
    }

    if let Some(bad) = key
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#'))
    {
        return Err(ValidationError::InvalidFormat {
            field: "key".to_string(),
            reason: format!("must not contain {:?}", bad),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a per-intake quantity.
///
/// ## Rules
/// - Between 1 and MAX_INTAKE_QUANTITY (99)
pub fn validate_quantity(qty: u32) -> ValidationResult<()> {
    if qty == 0 || qty > MAX_INTAKE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_INTAKE_QUANTITY as i64,
        });
    }
    Ok(())
}

/// Validates a box's date range. Open-ended boxes are always valid.
pub fn validate_box_dates(start: NaiveDate, end: Option<NaiveDate>) -> ValidationResult<()> {
    match end {
        Some(end) if end < start => Err(ValidationError::DateOrder {
            field: "endDate".to_string(),
            other: "startDate".to_string(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// Payload Validators
// =============================================================================

pub fn validate_new_medicine(medicine: &NewMedicine) -> ValidationResult<()> {
    validate_name("name", &medicine.name)
}

/// Validates a box create/update payload.
///
/// ## Rules
/// - Optional name obeys [`validate_name`]
/// - End date not before start date
/// - Recurrence interval at least one day
/// - Every medicine reference has an id and a valid quantity
pub fn validate_new_box(payload: &NewBox) -> ValidationResult<()> {
    if let Some(name) = &payload.name {
        validate_name("name", name)?;
    }

    validate_box_dates(payload.start_date, payload.end_date)?;

    if payload.every_n_days == 0 {
        return Err(ValidationError::OutOfRange {
            field: "everyNDays".to_string(),
            min: 1,
            max: i64::from(u32::MAX),
        });
    }

    payload.medicines.iter().try_for_each(validate_box_medicine)
}

fn validate_box_medicine(entry: &BoxMedicine) -> ValidationResult<()> {
    validate_id("medicineId", &entry.medicine_id)?;
    validate_quantity(entry.quantity)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntakeSlot;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "Morning pills").is_ok());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", "   ").is_err());
        assert!(validate_name("name", &"A".repeat(100)).is_ok());
        assert!(validate_name("name", &"A".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_scope_key() {
        assert!(validate_scope_key("c1").is_ok());
        assert!(validate_scope_key("3f1c9e1a-tok").is_ok());

        assert!(validate_scope_key("").is_err());
        assert!(validate_scope_key("  ").is_err());
        assert!(validate_scope_key("a b").is_err());
        assert!(validate_scope_key("a/b").is_err());
        assert!(validate_scope_key("a?b").is_err());
        assert!(validate_scope_key("a#b").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(99).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(100).is_err());
    }

    #[test]
    fn test_validate_box_dates() {
        assert!(validate_box_dates(date(2024, 3, 1), None).is_ok());
        assert!(validate_box_dates(date(2024, 3, 1), Some(date(2024, 3, 1))).is_ok());
        assert!(validate_box_dates(date(2024, 3, 2), Some(date(2024, 3, 1))).is_err());
    }

    #[test]
    fn test_validate_new_box() {
        let mut payload = NewBox {
            name: Some("Evening".to_string()),
            start_date: date(2024, 3, 1),
            end_date: Some(date(2024, 3, 31)),
            every_n_days: 1,
            slots: vec![IntakeSlot::Evening],
            medicines: vec![BoxMedicine {
                medicine_id: "m1".to_string(),
                quantity: 2,
            }],
        };
        assert!(validate_new_box(&payload).is_ok());

        payload.medicines[0].quantity = 0;
        assert!(validate_new_box(&payload).is_err());

        payload.medicines[0].quantity = 1;
        payload.every_n_days = 0;
        assert!(validate_new_box(&payload).is_err());
    }
}
