//! History cursor parsing and reconciliation state
//!
//! Gmail marks mailbox state with a monotonically increasing `historyId`.
//! REST responses carry it as a decimal string while Pub/Sub push payloads
//! carry it as a JSON number, so the cursor accepts both on the wire.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{AppError, AppResult};

/// Opaque, monotonically increasing mailbox history marker
///
/// Everything up to and including a cursor has been reconciled once the
/// cursor is stored as [`CursorState::Tracking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryCursor(u64);

impl HistoryCursor {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Parse a cursor from its decimal form
    ///
    /// Surrounding whitespace is ignored. Returns error if the value is empty
    /// or not an unsigned integer.
    ///
    /// # Example
    ///
    /// ```text
    /// let cursor = HistoryCursor::parse("12345")?;
    /// assert_eq!(cursor.value(), 12345);
    /// ```
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::invalid("history cursor cannot be empty"));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| AppError::invalid(format!("invalid history cursor '{trimmed}'")))
    }
}

impl fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HistoryCursor {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for HistoryCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for HistoryCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CursorVisitor;

        impl Visitor<'_> for CursorVisitor {
            type Value = HistoryCursor;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a history id as an unsigned integer or decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(HistoryCursor(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(HistoryCursor)
                    .map_err(|_| E::custom(format!("negative history id {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                HistoryCursor::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(CursorVisitor)
    }
}

/// Reconciliation position owned by the history sync
///
/// `Unarmed` and `Seeded` both mean the next notification is a baseline: its
/// cursor is adopted without computing a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    /// No watch has been armed yet
    #[default]
    Unarmed,
    /// Watch armed; holds the provider's starting cursor
    Seeded(HistoryCursor),
    /// Baseline adopted; holds the last fully reconciled cursor
    Tracking(HistoryCursor),
}

impl CursorState {
    /// Cursor to diff from, if a baseline has been adopted
    pub fn tracked(self) -> Option<HistoryCursor> {
        match self {
            Self::Tracking(cursor) => Some(cursor),
            Self::Unarmed | Self::Seeded(_) => None,
        }
    }
}
