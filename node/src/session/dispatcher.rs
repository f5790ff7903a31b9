use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use super::messages::{parse_inbound, Inbound};
use crate::state::{advance_window, format_timestamp, keys, StateStore};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointsCounters {
    pub total: f64,
    pub today: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Authoritative totals applied; `anchored_at` is the new window start
    Totals {
        counters: PointsCounters,
        anchored_at: DateTime<Utc>,
    },
    Ignored,
    Malformed,
}

/// Reconciles inbound frames with the persisted counters.
pub struct MessageDispatcher {
    store: StateStore,
    counters: PointsCounters,
}

impl MessageDispatcher {
    pub fn new(store: StateStore) -> Self {
        let state = store.snapshot();
        Self {
            store,
            counters: PointsCounters {
                total: state.points_total.unwrap_or_default(),
                today: state.points_today.unwrap_or_default(),
            },
        }
    }

    pub fn counters(&self) -> PointsCounters {
        self.counters
    }

    pub fn handle_frame(&mut self, text: &str, now: DateTime<Utc>) -> Dispatch {
        let update = match parse_inbound(text) {
            Ok(Inbound::Totals(update)) => update,
            Ok(Inbound::Other(value)) => {
                debug!("← ignoring frame: {}", value);
                return Dispatch::Ignored;
            }
            Err(e) => {
                warn!("Discarding malformed frame ({}): {}", e, truncate(text));
                return Dispatch::Malformed;
            }
        };

        self.counters = PointsCounters {
            total: update.total(),
            today: update.today(),
        };

        // window anchor and counters land in one merge
        let mut anchored_at = now;
        let persisted = self.store.update(|current| {
            anchored_at = advance_window(current, now);
            json!({
                keys::LAST_UPDATED: format_timestamp(anchored_at),
                keys::POINTS_TOTAL: Value::Number(update.points_total.clone()),
                keys::POINTS_TODAY: Value::Number(update.points_today.clone()),
            })
        });
        if let Err(e) = persisted {
            warn!("Failed to persist points update: {}", e);
        }

        info!(
            "📊 Points total {} | today {}",
            update.points_total, update.points_today
        );

        Dispatch::Totals {
            counters: self.counters,
            anchored_at,
        }
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
