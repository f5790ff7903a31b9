//! Persisted session state
//!
//! The whole session lives in a single JSON object on disk. Every component
//! writes partial updates into it through [`StateStore`], which merges them
//! with whatever is already persisted.

mod store;

pub use store::{StateStore, StoreError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Persisted field names
pub mod keys {
    pub const USER_ID: &str = "userId";
    pub const LAST_UPDATED: &str = "lastUpdated";
    pub const LAST_PING_DATE: &str = "lastPingDate";
    pub const POINTS_TOTAL: &str = "pointsTotal";
    pub const POINTS_TODAY: &str = "pointsToday";
    pub const POTENTIAL_POINTS: &str = "potentialPoints";
    pub const COUNTDOWN: &str = "countdown";
}

/// Typed view over the persisted mapping.
///
/// Fields that are missing or carry an unexpected JSON type read as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub user_id: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_ping_date: Option<DateTime<Utc>>,
    pub points_total: Option<f64>,
    pub points_today: Option<f64>,
    pub potential_points: Option<f64>,
    pub countdown: Option<String>,
}

impl SessionState {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| map.get(key).and_then(Value::as_f64);
        let timestamp = |key: &str| map.get(key).and_then(Value::as_str).and_then(parse_timestamp);

        Self {
            user_id: text(keys::USER_ID).filter(|id| !id.is_empty()),
            last_updated: timestamp(keys::LAST_UPDATED),
            last_ping_date: timestamp(keys::LAST_PING_DATE),
            points_total: number(keys::POINTS_TOTAL),
            points_today: number(keys::POINTS_TODAY),
            potential_points: number(keys::POTENTIAL_POINTS),
            countdown: text(keys::COUNTDOWN),
        }
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// New anchor for the accrual window: `now`, unless the persisted anchor is
/// already later. `lastUpdated` never moves backward.
pub fn advance_window(current: &Map<String, Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    current
        .get(keys::LAST_UPDATED)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .map_or(now, |persisted| persisted.max(now))
}
