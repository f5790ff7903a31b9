use serde_json::{Number, Value};

/// Outbound heartbeat frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub kind: String,
}

impl Heartbeat {
    /// Create ping frame
    pub fn ping() -> Self {
        Self {
            kind: "PING".to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::json!({ "type": self.kind }).to_string()
    }
}

/// Authoritative counters pushed by the remote side.
///
/// Numbers are kept exactly as received so they persist unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TotalsUpdate {
    pub points_total: Number,
    pub points_today: Number,
}

impl TotalsUpdate {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match (obj.get("pointsTotal"), obj.get("pointsToday")) {
            (Some(Value::Number(total)), Some(Value::Number(today))) => Some(Self {
                points_total: total.clone(),
                points_today: today.clone(),
            }),
            _ => None,
        }
    }

    pub fn total(&self) -> f64 {
        self.points_total.as_f64().unwrap_or_default()
    }

    pub fn today(&self) -> f64 {
        self.points_today.as_f64().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Totals(TotalsUpdate),
    Other(Value),
}

pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(match TotalsUpdate::from_value(&value) {
        Some(update) => Inbound::Totals(update),
        None => Inbound::Other(value),
    })
}
