//! Session keepalive and accrual engine
//!
//! [`ConnectionManager`] owns the connection lifecycle. While a link is up it
//! runs a [`Pinger`], an [`AccrualClock`] and feeds inbound frames to a
//! [`MessageDispatcher`]; all of them share one [`StateStore`](crate::state::StateStore).

pub mod accrual;
pub mod backoff;
pub mod dispatcher;
pub mod lifecycle;
pub mod manager;
pub mod messages;
pub mod pinger;
pub mod transport;

pub use accrual::{Accrual, AccrualClock, CALCULATING, MAX_POINTS};
pub use backoff::Backoff;
pub use dispatcher::{Dispatch, MessageDispatcher, PointsCounters};
pub use lifecycle::{Action, ConnectionState, Lifecycle, LinkEvent};
pub use manager::{ConnectionManager, SessionSettings};
pub use pinger::{PingOutcome, Pinger};
pub use transport::{endpoint_url, Connector, FrameSink, FrameStream, Link, WsConnector};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed by remote: {0}")]
    Closed(String),

    #[error("state belongs to user {persisted}, refusing to run as {requested}")]
    UserMismatch { persisted: String, requested: String },

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("session task aborted: {0}")]
    Task(String),
}
