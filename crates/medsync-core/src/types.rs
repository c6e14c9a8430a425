//! # Domain Types
//!
//! Entities exchanged with the Data Service and held in the engine's cache.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Calendar     │   │  MedicineBox    │   │    Schedule     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │◄──│  calendar_id    │   │  start_time     │       │
//! │  │  name           │   │  start/end date │   │  days[]         │       │
//! │  └─────────────────┘   │  slots[]        │   │   └ intakes[]   │       │
//! │          ▲             │  medicines[] ───┼─┐ └─────────────────┘       │
//! │          │             └─────────────────┘ │                            │
//! │  ┌───────┴─────────┐   ┌─────────────────┐ │ ┌─────────────────┐       │
//! │  │   ShareToken    │   │    Medicine     │◄┘ │  Notification   │       │
//! │  │  token (link)   │   │  calendar_id    │   │  read flag      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The schedule is computed by the Data Service; the engine only caches it.
//! All wire payloads are camelCase JSON.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Calendars
// =============================================================================

/// A calendar owned by the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A calendar another account shared with the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SharedCalendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
}

/// Payload for creating or renaming a calendar.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct NewCalendar {
    pub name: String,
}

// =============================================================================
// Medicines
// =============================================================================

/// A medicine known to one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Medicine {
    pub id: String,
    pub calendar_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Payload for adding a medicine to a calendar.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct NewMedicine {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of a bulk medicine update. `None` fields are left unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct MedicineUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Medicine Boxes
// =============================================================================

/// Time of day an intake is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum IntakeSlot {
    Morning,
    Noon,
    Evening,
    Night,
}

/// Quantity of one medicine taken at each slot of a box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct BoxMedicine {
    pub medicine_id: String,
    pub quantity: u32,
}

/// A medicine box: a set of medicines taken on a recurring pattern
/// between two dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct MedicineBox {
    pub id: String,
    pub calendar_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[ts(as = "String")]
    pub start_date: NaiveDate,
    /// Open-ended when absent.
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub end_date: Option<NaiveDate>,
    /// Recurrence interval in days (1 = every day).
    #[serde(default = "default_every_n_days")]
    pub every_n_days: u32,
    #[serde(default)]
    pub slots: Vec<IntakeSlot>,
    #[serde(default)]
    pub medicines: Vec<BoxMedicine>,
}

fn default_every_n_days() -> u32 {
    1
}

/// Payload for creating a box. Also the body of a full box update.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct NewBox {
    #[serde(default)]
    pub name: Option<String>,
    #[ts(as = "String")]
    pub start_date: NaiveDate,
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_every_n_days")]
    pub every_n_days: u32,
    pub slots: Vec<IntakeSlot>,
    pub medicines: Vec<BoxMedicine>,
}

/// Full replacement of an existing box.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct BoxUpdate {
    pub id: String,
    #[serde(flatten)]
    pub fields: NewBox,
}

// =============================================================================
// Schedule
// =============================================================================

/// One scheduled intake on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledIntake {
    pub slot: IntakeSlot,
    pub medicine_id: String,
    pub medicine_name: String,
    pub quantity: u32,
}

/// All intakes of one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDay {
    #[ts(as = "String")]
    pub date: NaiveDate,
    #[serde(default)]
    pub intakes: Vec<ScheduledIntake>,
}

/// Schedule table as computed by the Data Service, starting at `start_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub calendar_name: Option<String>,
    #[ts(as = "String")]
    pub start_time: NaiveDate,
    #[serde(default)]
    pub days: Vec<ScheduleDay>,
}

impl Schedule {
    /// True when no day carries an intake.
    pub fn is_empty(&self) -> bool {
        self.days.iter().all(|d| d.intakes.is_empty())
    }

    /// Intakes due on `date`, if the day is part of the table.
    pub fn day(&self, date: NaiveDate) -> Option<&ScheduleDay> {
        self.days.iter().find(|d| d.date == date)
    }
}

// =============================================================================
// Sharing
// =============================================================================

/// Anonymous read link for one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ShareToken {
    pub token: String,
    pub calendar_id: String,
    #[serde(default)]
    pub calendar_name: Option<String>,
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ShareToken {
    /// Tokens without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Access level granted to a shared user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SharePermission {
    #[default]
    Read,
    Write,
}

/// An account a calendar is shared with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SharedUser {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub permission: SharePermission,
}

/// Invitation payload for sharing a calendar with another account.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ShareInvite {
    pub email: String,
    #[serde(default)]
    pub permission: SharePermission,
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Ordering
// =============================================================================

/// Entities that are displayed in name order.
pub trait Named {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

impl Named for Calendar {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for SharedCalendar {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for Medicine {
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

/// Sorts name-ascending, case-insensitive, ties broken by id so the order
/// is stable across refetches.
pub fn sort_by_name<T: Named>(items: &mut [T]) {
    items.sort_by(|a, b| {
        a.name()
            .to_lowercase()
            .cmp(&b.name().to_lowercase())
            .then_with(|| a.id().cmp(b.id()))
    });
}

// =============================================================================
// Unit Tests
// =============================================================================
