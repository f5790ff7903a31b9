use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::accrual::{AccrualClock, DEFAULT_BONUS_PROBABILITY};
use super::backoff::Backoff;
use super::dispatcher::MessageDispatcher;
use super::lifecycle::{Action, ConnectionState, Lifecycle, LinkEvent};
use super::pinger::{Pinger, SharedSink};
use super::transport::{endpoint_url, Connector, Link};
use super::SessionError;
use crate::state::{advance_window, format_timestamp, keys, StateStore};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base URL; `/websocket?userId=..&version=..` is appended
    pub endpoint: String,
    pub version: String,
    pub ping_interval: Duration,
    pub accrual_interval: Duration,
    pub bonus_probability: f64,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub max_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: "wss://secure.ws.teneo.pro".to_string(),
            version: "v0.2".to_string(),
            ping_interval: Duration::from_secs(10),
            accrual_interval: Duration::from_secs(1),
            bonus_probability: DEFAULT_BONUS_PROBABILITY,
            connect_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
            max_attempts: 5,
        }
    }
}

struct Supervisor {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), SessionError>>,
}

struct Inner {
    settings: SessionSettings,
    store: StateStore,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    supervisor: AsyncMutex<Option<Supervisor>>,
}

impl Inner {
    /// Feed an event to the state machine and publish the resulting state.
    fn apply(&self, event: &LinkEvent) -> Action {
        let mut lifecycle = self.lifecycle.lock();
        let action = lifecycle.on_event(event);
        self.publish(lifecycle.state());
        action
    }

    fn retry(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.retry();
        self.publish(lifecycle.state());
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Session state: {} → {}", current, state);
            *current = state;
            true
        });
    }
}

/// Owns the single logical session: connect, keep alive, reconnect.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(settings: SessionSettings, store: StateStore, connector: Arc<dyn Connector>) -> Self {
        let lifecycle = Lifecycle::new(settings.backoff, settings.max_attempts);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                connector,
                lifecycle: Mutex::new(lifecycle),
                state_tx,
                supervisor: AsyncMutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive connection losses since the last successful open
    pub fn attempts(&self) -> u32 {
        self.inner.lifecycle.lock().attempts()
    }

    /// Start the session for `user_id`. A no-op while a session is already
    /// connected, connecting or waiting to reconnect. After `Failed` this
    /// starts over with a fresh attempt counter.
    ///
    /// Fails with [`SessionError::UserMismatch`] when the store already
    /// belongs to a different user.
    pub async fn connect(&self, user_id: &str) -> Result<(), SessionError> {
        let url = endpoint_url(&self.inner.settings.endpoint, user_id, &self.inner.settings.version)?;
        self.claim_user(user_id)?;

        let mut slot = self.inner.supervisor.lock().await;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.begin_connect() {
                debug!("connect ignored: session is {}", lifecycle.state());
                return Ok(());
            }
            self.inner.publish(lifecycle.state());
        }

        if let Some(previous) = slot.take() {
            previous.shutdown.cancel();
            let _ = previous.handle.await;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), url, shutdown.clone()));
        *slot = Some(Supervisor { shutdown, handle });
        Ok(())
    }

    /// Stop the session. Periodic tasks are stopped, the socket is closed and
    /// no reconnect is scheduled.
    pub async fn disconnect(&self) {
        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(Supervisor { shutdown, handle }) = supervisor {
            shutdown.cancel();
            if let Err(e) = handle.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.shutdown();
        // always notify, even when the state is unchanged, so waiters re-check
        self.inner.state_tx.send_replace(lifecycle.state());
        info!("Session stopped ({})", lifecycle.state());
    }

    /// Resolves once the session is stopped by [`disconnect`](Self::disconnect)
    /// or has exhausted its reconnect attempts.
    pub async fn wait(&self) -> Result<(), SessionError> {
        let mut states = self.subscribe_state();
        loop {
            let current = *states.borrow_and_update();
            if current == ConnectionState::Failed {
                return Err(SessionError::ReconnectExhausted {
                    attempts: self.attempts(),
                });
            }
            if current == ConnectionState::Disconnected && self.inner.supervisor.lock().await.is_none() {
                return Ok(());
            }
            if states.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Persist `user_id` unless one is already stored; a different stored id
    /// is an error and leaves the store untouched.
    fn claim_user(&self, user_id: &str) -> Result<(), SessionError> {
        let mut persisted = None;
        let result = self.inner.store.update(|current| {
            match current.get(keys::USER_ID).and_then(Value::as_str) {
                Some(existing) if !existing.is_empty() => {
                    persisted = Some(existing.to_string());
                    json!({})
                }
                _ => json!({ keys::USER_ID: user_id }),
            }
        });
        if let Err(e) = result {
            warn!("Failed to persist userId: {}", e);
        }

        match persisted {
            Some(existing) if existing != user_id => Err(SessionError::UserMismatch {
                persisted: existing,
                requested: user_id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

async fn supervise(inner: Arc<Inner>, url: String, shutdown: CancellationToken) -> Result<(), SessionError> {
    let settings = &inner.settings;

    loop {
        debug!("Connecting to {}", url);
        let opened = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            opened = timeout(settings.connect_timeout, inner.connector.open(&url)) => opened,
        };

        let loss = match opened {
            Ok(Ok(link)) => {
                if inner.apply(&LinkEvent::Opened) != Action::StartTasks {
                    return Ok(());
                }
                match run_link(&inner, link, &shutdown).await {
                    Some(loss) => loss,
                    None => return Ok(()),
                }
            }
            Ok(Err(e)) => LinkEvent::Error(e.to_string()),
            Err(_) => LinkEvent::Error(SessionError::ConnectTimeout(settings.connect_timeout).to_string()),
        };

        match &loss {
            LinkEvent::Error(reason) => warn!("🔌 Connection lost: {}", reason),
            _ => warn!("🔌 Connection closed by remote"),
        }

        match inner.apply(&loss) {
            Action::Reconnect { attempt, delay } => {
                warn!(
                    "🔄 Reconnecting in {}s (attempt {}/{})",
                    delay.as_secs(),
                    attempt,
                    settings.max_attempts
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                inner.retry();
            }
            Action::GiveUp { attempts } => {
                error!("❌ Giving up: connection lost {} times in a row", attempts);
                return Err(SessionError::ReconnectExhausted { attempts });
            }
            other => {
                debug!("No reconnect after loss ({:?})", other);
                return Ok(());
            }
        }
    }
}

/// Drive one open link until it is lost (`Some`) or shut down (`None`).
/// The periodic tasks are stopped and joined before this returns.
async fn run_link(inner: &Inner, link: Link, shutdown: &CancellationToken) -> Option<LinkEvent> {
    let settings = &inner.settings;
    let Link { sink, mut stream } = link;

    let connected_at = Utc::now();
    let anchored = inner.store.update(|current| {
        json!({ keys::LAST_UPDATED: format_timestamp(advance_window(current, connected_at)) })
    });
    if let Err(e) = anchored {
        warn!("Failed to persist connection time: {}", e);
    }
    info!("✅ WebSocket connected at {}", format_timestamp(connected_at));

    let writer: SharedSink = Arc::new(AsyncMutex::new(Some(sink)));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let tasks = shutdown.child_token();

    let pinger = Pinger::new(settings.ping_interval, inner.store.clone(), Arc::clone(&writer), events_tx)
        .spawn(tasks.clone());
    let accrual = AccrualClock::new(settings.accrual_interval, inner.store.clone(), settings.bonus_probability)
        .spawn(tasks.clone());
    let mut dispatcher = MessageDispatcher::new(inner.store.clone());

    let loss = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            Some(event) = events_rx.recv() => break Some(event),
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    debug!("← {}", text);
                    if inner.apply(&LinkEvent::FrameReceived) == Action::Dispatch {
                        dispatcher.handle_frame(&text, Utc::now());
                    }
                }
                Some(Err(e)) => break Some(LinkEvent::Error(e.to_string())),
                None => break Some(LinkEvent::Closed),
            },
        }
    };

    tasks.cancel();
    for (name, handle) in [("pinger", pinger), ("accrual clock", accrual)] {
        if let Err(e) = handle.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }

    let sink = writer.lock().await.take();
    if let (None, Some(mut sink)) = (&loss, sink) {
        match sink.close().await {
            Ok(()) => info!("WebSocket closed"),
            Err(e) => debug!("Close handshake failed: {}", e),
        }
    }

    if loss.is_some() {
        inner.publish(ConnectionState::Disconnected);
    }
    loss
}
