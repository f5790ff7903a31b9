//! Flynn node: keeps a WebSocket session alive, tracks the reward window and
//! persists server-reported point totals.

pub mod auth;
pub mod config;
pub mod session;
pub mod state;
pub mod status;

pub use config::Config;
pub use session::{ConnectionManager, ConnectionState, SessionError, SessionSettings};
pub use state::{SessionState, StateStore};
