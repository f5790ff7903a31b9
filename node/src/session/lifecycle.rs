//! Connection state machine
//!
//! Pure bookkeeping: no I/O, no timers. The supervisor feeds it link events
//! and performs whatever [`Action`] comes back.

use std::fmt;
use std::time::Duration;

use super::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    FrameReceived,
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Event does not apply in the current state
    Ignore,
    /// Link is up: anchor the window and start the periodic tasks
    StartTasks,
    /// Hand the frame to the dispatcher
    Dispatch,
    Reconnect { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    backoff: Backoff,
}

impl Lifecycle {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Caller-initiated connect. Returns `false` while a session is already
    /// connected or on its way there; otherwise starts with a fresh counter.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => false,
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.attempts = 0;
                self.state = ConnectionState::Connecting;
                true
            }
        }
    }

    /// Backoff elapsed; the counter is kept.
    pub fn retry(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Caller-initiated disconnect. Never schedules a reconnect.
    pub fn shutdown(&mut self) {
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }

    pub fn on_event(&mut self, event: &LinkEvent) -> Action {
        use ConnectionState::*;

        match (self.state, event) {
            (Connecting, LinkEvent::Opened) => {
                self.attempts = 0;
                self.state = Connected;
                Action::StartTasks
            }
            (Connected, LinkEvent::FrameReceived) => Action::Dispatch,
            (Connecting | Connected, LinkEvent::Closed | LinkEvent::Error(_)) => self.lose(),
            _ => Action::Ignore,
        }
    }

    fn lose(&mut self) -> Action {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            self.state = ConnectionState::Failed;
            return Action::GiveUp {
                attempts: self.attempts,
            };
        }
        self.state = ConnectionState::Reconnecting;
        Action::Reconnect {
            attempt: self.attempts,
            delay: self.backoff.delay(self.attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(Backoff::default(), 5)
    }

    fn lose_once(lc: &mut Lifecycle) -> Action {
        let action = lc.on_event(&LinkEvent::Closed);
        if lc.state() == ConnectionState::Reconnecting {
            assert!(lc.retry());
        }
        action
    }

    #[test]
    fn test_connect_then_open() {
        let mut lc = lifecycle();
        assert!(lc.begin_connect());
        assert_eq!(lc.state(), ConnectionState::Connecting);
        assert!(!lc.begin_connect());
        assert_eq!(lc.on_event(&LinkEvent::Opened), Action::StartTasks);
        assert_eq!(lc.state(), ConnectionState::Connected);
        assert!(!lc.begin_connect());
        assert_eq!(lc.on_event(&LinkEvent::FrameReceived), Action::Dispatch);
    }

    #[test]
    fn test_loss_schedules_backoff() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lc.on_event(&LinkEvent::Opened);

        let action = lc.on_event(&LinkEvent::Error("reset".into()));
        assert_eq!(
            action,
            Action::Reconnect {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(lc.state(), ConnectionState::Reconnecting);
        assert!(!lc.begin_connect());
        assert_eq!(lc.on_event(&LinkEvent::FrameReceived), Action::Ignore);
    }

    #[test]
    fn test_successful_open_resets_counter() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lose_once(&mut lc);
        lose_once(&mut lc);
        assert_eq!(lc.attempts(), 2);

        lc.on_event(&LinkEvent::Opened);
        assert_eq!(lc.attempts(), 0);
        assert_eq!(
            lc.on_event(&LinkEvent::Closed),
            Action::Reconnect {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn test_fails_after_max_attempts() {
        let mut lc = lifecycle();
        lc.begin_connect();
        for attempt in 1..=5 {
            assert!(matches!(lose_once(&mut lc), Action::Reconnect { attempt: a, .. } if a == attempt));
        }
        assert_eq!(lose_once(&mut lc), Action::GiveUp { attempts: 6 });
        assert_eq!(lc.state(), ConnectionState::Failed);
        assert!(!lc.retry());
        assert_eq!(lc.on_event(&LinkEvent::Opened), Action::Ignore);

        lc.shutdown();
        assert_eq!(lc.state(), ConnectionState::Failed);

        assert!(lc.begin_connect());
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn test_shutdown_does_not_reconnect() {
        let mut lc = lifecycle();
        lc.begin_connect();
        lc.on_event(&LinkEvent::Opened);
        lc.shutdown();
        assert_eq!(lc.state(), ConnectionState::Disconnected);
        assert_eq!(lc.on_event(&LinkEvent::Closed), Action::Ignore);
        assert_eq!(lc.attempts(), 0);
    }
}
