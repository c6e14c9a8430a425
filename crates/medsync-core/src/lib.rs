//! # medsync-core: Pure Domain Model for MedSync
//!
//! Types shared by every MedSync component, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MedSync Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Presentation (views, forms)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ snapshots / ActionResult               │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    medsync-sync (engine)                        │   │
//! │  │    change feed, debounce, lifecycle, source map, loading       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ medsync-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   scope   │  │  change   │  │ validation│  │   │
//! │  │   │ Calendar  │  │   Scope   │  │ RowFilter │  │   rules   │  │   │
//! │  │   │ Schedule  │  │ Category  │  │ EventMask │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities (Calendar, MedicineBox, Schedule, ...)
//! - [`scope`] - Scope, SourceKind, ResourceCategory
//! - [`change`] - Change events and row filters
//! - [`result`] - ActionResult, the uniform operation outcome
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use medsync_core::{RowFilter, Scope};
//!
//! let scope = Scope::owned("cal-1").unwrap();
//! let filter = RowFilter::eq("calendar_id", scope.key());
//! assert_eq!(filter.to_string(), "calendar_id=eq.cal-1");
//!
//! assert!(Scope::owned("bad/key").is_err());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod change;
pub mod error;
pub mod result;
pub mod scope;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use change::{ChangeEvent, ChangeOperation, EventMask, RowFilter};
pub use error::{CoreError, CoreResult, ValidationError};
pub use result::ActionResult;
pub use scope::{ResourceCategory, Scope, SourceKind};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum length of calendar, medicine and box names.
pub const MAX_NAME_LEN: usize = 100;

/// Maximum units of one medicine per intake.
pub const MAX_INTAKE_QUANTITY: u32 = 99;
