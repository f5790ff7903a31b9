use chrono::{DateTime, Utc};
use colored::*;
use serde_json::json;

use crate::session::{ConnectionState, CALCULATING};
use crate::state::{format_timestamp, SessionState};

/// Console view of the persisted session
pub struct StatusPanel<'a> {
    state: &'a SessionState,
    connection: Option<ConnectionState>,
    attempts: u32,
}

impl<'a> StatusPanel<'a> {
    pub fn new(state: &'a SessionState) -> Self {
        Self {
            state,
            connection: None,
            attempts: 0,
        }
    }

    /// Include the live connection state (only known while `run` is active)
    pub fn with_connection(mut self, connection: ConnectionState, attempts: u32) -> Self {
        self.connection = Some(connection);
        self.attempts = attempts;
        self
    }

    fn fmt_points(points: Option<f64>) -> String {
        match points {
            Some(p) if p.fract() == 0.0 => format!("{:.0}", p),
            Some(p) => format!("{:.2}", p),
            None => "—".to_string(),
        }
    }

    fn fmt_age(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
        let Some(at) = at else {
            return "never".to_string();
        };
        let secs = (now - at).num_seconds().max(0);
        if secs < 60 { format!("{}s ago", secs) }
        else if secs < 3600 { format!("{}m {}s ago", secs / 60, secs % 60) }
        else { format!("{}h {}m ago", secs / 3600, (secs % 3600) / 60) }
    }

    fn fmt_connection(&self) -> ColoredString {
        match self.connection {
            None => "not running".bright_black(),
            Some(ConnectionState::Connected) => "connected".bright_green().bold(),
            Some(ConnectionState::Connecting) => "connecting".bright_yellow(),
            Some(ConnectionState::Reconnecting) => {
                format!("reconnecting (attempt {})", self.attempts).bright_yellow()
            }
            Some(ConnectionState::Failed) => "failed".bright_red().bold(),
            Some(ConnectionState::Disconnected) => "disconnected".bright_red(),
        }
    }

    pub fn render(&self, now: DateTime<Utc>) -> Vec<String> {
        let bar = "─".repeat(56);
        let state = self.state;
        let countdown = state.countdown.as_deref().unwrap_or(CALCULATING);

        vec![
            format!("┌{}┐", bar).bright_black().to_string(),
            format!(
                "{}  {}    {}  user: {}",
                "│".bright_black(),
                "LINK".bright_white().bold(),
                self.fmt_connection(),
                state.user_id.as_deref().unwrap_or("—").bright_white(),
            ),
            format!(
                "{}  {}  total: {}  today: {}",
                "│".bright_black(),
                "POINTS".bright_white().bold(),
                Self::fmt_points(state.points_total).bright_green().bold(),
                Self::fmt_points(state.points_today).bright_green(),
            ),
            format!(
                "{}  {}  potential: {}  next: {}",
                "│".bright_black(),
                "WINDOW".bright_white().bold(),
                Self::fmt_points(state.potential_points).bright_cyan(),
                countdown.bright_cyan(),
            ),
            format!(
                "{}  {}    last ping: {}  window start: {}",
                "│".bright_black(),
                "SEEN".bright_white().bold(),
                Self::fmt_age(state.last_ping_date, now).white(),
                Self::fmt_age(state.last_updated, now).white(),
            ),
            format!("└{}┘", bar).bright_black().to_string(),
        ]
    }

    pub fn print(&self) {
        for line in self.render(Utc::now()) {
            println!("{}", line);
        }
    }

    /// Machine-readable variant for `status --json`
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.state;
        json!({
            "connection": self.connection.map(|c| c.to_string()),
            "userId": state.user_id,
            "pointsTotal": state.points_total,
            "pointsToday": state.points_today,
            "potentialPoints": state.potential_points,
            "countdown": state.countdown,
            "lastUpdated": state.last_updated.map(format_timestamp),
            "lastPingDate": state.last_ping_date.map(format_timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample(now: DateTime<Utc>) -> SessionState {
        SessionState {
            user_id: Some("u-1".to_string()),
            last_updated: Some(now - Duration::minutes(5)),
            last_ping_date: Some(now - Duration::seconds(4)),
            points_total: Some(1200.0),
            points_today: Some(42.5),
            potential_points: Some(8.33),
            countdown: Some("10m 0s".to_string()),
        }
    }

    #[test]
    fn test_render_shows_counters_and_ages() {
        colored::control::set_override(false);
        let now = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let state = sample(now);
        let lines = StatusPanel::new(&state)
            .with_connection(ConnectionState::Connected, 0)
            .render(now);

        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("connected"));
        assert!(lines[1].contains("u-1"));
        assert!(lines[2].contains("total: 1200"));
        assert!(lines[2].contains("today: 42.50"));
        assert!(lines[3].contains("potential: 8.33"));
        assert!(lines[3].contains("next: 10m 0s"));
        assert!(lines[4].contains("last ping: 4s ago"));
        assert!(lines[4].contains("window start: 5m 0s ago"));
    }

    #[test]
    fn test_render_empty_state() {
        colored::control::set_override(false);
        let state = SessionState::default();
        let lines = StatusPanel::new(&state).render(Utc::now());

        assert!(lines[1].contains("not running"));
        assert!(lines[2].contains("total: —"));
        assert!(lines[3].contains(CALCULATING));
        assert!(lines[4].contains("last ping: never"));
    }

    #[test]
    fn test_reconnecting_shows_attempt() {
        colored::control::set_override(false);
        let state = SessionState::default();
        let lines = StatusPanel::new(&state)
            .with_connection(ConnectionState::Reconnecting, 3)
            .render(Utc::now());
        assert!(lines[1].contains("reconnecting (attempt 3)"));
    }

    #[test]
    fn test_json_view() {
        let now = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let state = sample(now);
        let value = StatusPanel::new(&state).to_json();
        assert_eq!(value["connection"], serde_json::Value::Null);
        assert_eq!(value["pointsTotal"], json!(1200.0));
        assert_eq!(value["lastUpdated"], json!("2024-09-01T11:55:00.000Z"));
    }
}
