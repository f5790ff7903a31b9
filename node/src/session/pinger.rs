use chrono::Utc;
use futures::SinkExt;
use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::lifecycle::LinkEvent;
use super::messages::Heartbeat;
use super::transport::FrameSink;
use crate::state::{format_timestamp, keys, StateStore};

/// Write half of the active connection; `None` once the link is torn down.
pub type SharedSink = Arc<Mutex<Option<FrameSink>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Sent,
    NotConnected,
    Failed,
}

/// Periodic heartbeat emitter
pub struct Pinger {
    period: Duration,
    store: StateStore,
    writer: SharedSink,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Pinger {
    pub fn new(
        period: Duration,
        store: StateStore,
        writer: SharedSink,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            period,
            store,
            writer,
            events,
        }
    }

    /// First ping goes out one period after start. Cancellation is observed
    /// between ticks only.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.tick().await;
            }
            debug!("Pinger stopped");
        })
    }

    pub async fn tick(&self) -> PingOutcome {
        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => Some(sink.send(Heartbeat::ping().to_text()).await),
                None => None,
            }
        };

        match sent {
            None => {
                debug!("Skipping ping: no open connection");
                PingOutcome::NotConnected
            }
            Some(Ok(())) => {
                let now = format_timestamp(Utc::now());
                debug!("→ PING at {}", now);
                if let Err(e) = self.store.merge(json!({ keys::LAST_PING_DATE: now })) {
                    warn!("Failed to record ping time: {}", e);
                }
                PingOutcome::Sent
            }
            Some(Err(e)) => {
                warn!("Ping failed: {}", e);
                let _ = self.events.send(LinkEvent::Error(e.to_string()));
                PingOutcome::Failed
            }
        }
    }
}
