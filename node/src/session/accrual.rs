//! Accrual clock
//!
//! Recomputes the heartbeat countdown and the locally-estimated reward from
//! the persisted window anchor (`lastUpdated`) once per period.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::state::{keys, SessionState, StateStore};

pub const MAX_POINTS: f64 = 25.0;
pub const WINDOW_MS: i64 = 15 * 60 * 1000;
pub const CALCULATING: &str = "Calculating...";
pub const DEFAULT_BONUS_PROBABILITY: f64 = 0.1;

const MAX_BONUS: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Accrual {
    pub countdown: String,
    pub potential_points: f64,
}

impl Accrual {
    fn undetermined(potential_points: f64) -> Self {
        Self {
            countdown: CALCULATING.to_string(),
            potential_points,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Countdown and potential points for `now`, given the window anchor.
///
/// With probability `bonus_probability` a uniform bonus in `[0, 2)` is added
/// on top of the linear accrual. A lapsed window reports `MAX_POINTS`.
pub fn compute<R: Rng + ?Sized>(
    last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    bonus_probability: f64,
    rng: &mut R,
) -> Accrual {
    let Some(anchor) = last_updated else {
        return Accrual::undetermined(0.0);
    };

    let elapsed_ms = (now - anchor).num_milliseconds();
    let remaining_ms = WINDOW_MS - elapsed_ms;
    if remaining_ms <= 0 {
        return Accrual::undetermined(MAX_POINTS);
    }

    let minutes = remaining_ms / 60_000;
    let seconds = (remaining_ms % 60_000) / 1_000;

    let progress = elapsed_ms.max(0) as f64 / WINDOW_MS as f64;
    let mut points = round2((progress * MAX_POINTS).min(MAX_POINTS));

    if bonus_probability > 0.0 && rng.gen::<f64>() < bonus_probability {
        let bonus = rng.gen_range(0.0..MAX_BONUS);
        points = round2((points + bonus).min(MAX_POINTS));
    }

    Accrual {
        countdown: format!("{}m {}s", minutes, seconds),
        potential_points: points,
    }
}

/// Periodic recomputation task
pub struct AccrualClock {
    period: Duration,
    store: StateStore,
    bonus_probability: f64,
}

impl AccrualClock {
    pub fn new(period: Duration, store: StateStore, bonus_probability: f64) -> Self {
        Self {
            period,
            store,
            bonus_probability,
        }
    }

    /// Ticks immediately, then once per period until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.tick(Utc::now(), &mut rng);
            }
            debug!("Accrual clock stopped");
        })
    }

    /// Anchor read and result write happen under one store lock, so the
    /// persisted countdown always matches the persisted `lastUpdated`.
    pub fn tick<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> Accrual {
        let mut accrual = Accrual::undetermined(0.0);
        let persisted = self.store.update(|current| {
            let anchor = SessionState::from_map(current).last_updated;
            accrual = compute(anchor, now, self.bonus_probability, rng);
            if anchor.is_some() && accrual.countdown == CALCULATING {
                debug!("Accrual window lapsed without a fresh heartbeat");
            }
            json!({
                keys::POTENTIAL_POINTS: accrual.potential_points,
                keys::COUNTDOWN: accrual.countdown.clone(),
            })
        });
        if let Err(e) = persisted {
            warn!("Failed to persist accrual: {}", e);
        }
        accrual
    }
}
