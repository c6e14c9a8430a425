//! # Action Results
//!
//! The uniform shape every data-source operation reports to the presentation
//! layer. Failures are values, not errors, so a UI binding can render them
//! without unwinding.
//!
//! ```text
//!   Ok(data)                 → {"success": true,  "data": ...}
//!   Failed { error, code }   → {"success": false, "error": "...", "code": 403}
//! ```

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult<T> {
    Ok(T),
    Failed { error: String, code: Option<u16> },
}

impl<T> ActionResult<T> {
    pub fn failed(error: impl Into<String>, code: Option<u16>) -> Self {
        ActionResult::Failed {
            error: error.into(),
            code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Ok(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            ActionResult::Ok(data) => Some(data),
            ActionResult::Failed { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ActionResult::Ok(data) => Some(data),
            ActionResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ActionResult::Ok(_) => None,
            ActionResult::Failed { error, .. } => Some(error),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            ActionResult::Ok(_) => None,
            ActionResult::Failed { code, .. } => *code,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ActionResult<U> {
        match self {
            ActionResult::Ok(data) => ActionResult::Ok(f(data)),
            ActionResult::Failed { error, code } => ActionResult::Failed { error, code },
        }
    }
}

impl<T: Serialize> Serialize for ActionResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ActionResult::Ok(data) => {
                let mut state = serializer.serialize_struct("ActionResult", 2)?;
                state.serialize_field("success", &true)?;
                state.serialize_field("data", data)?;
                state.end()
            }
            ActionResult::Failed { error, code } => {
                let mut state = serializer.serialize_struct("ActionResult", 3)?;
                state.serialize_field("success", &false)?;
                state.serialize_field("error", error)?;
                state.serialize_field("code", code)?;
                state.end()
            }
        }
    }
}
