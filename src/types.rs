use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const READING_DECIMALS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub id: Uuid,
    pub value: f64,
    pub generated_at: DateTime<Utc>,
}

impl MeterReading {
    pub fn new(value: f64) -> Result<Self, EngineError> {
        if !value.is_finite() || value < 0.0 {
            return Err(EngineError::MalformedData(
                "meter reading must be finite and non-negative".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            value,
            generated_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionWire {
    pub id: String,
    pub user_identifier: String,
    pub meter_reading: f64,
    pub timestamp: String,
}

impl SubmissionWire {
    pub fn from_reading(reading: &MeterReading, user_identifier: &str) -> Self {
        Self {
            id: reading.id.to_string(),
            user_identifier: user_identifier.to_string(),
            meter_reading: reading.value,
            timestamp: reading.generated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillQueryWire {
    pub kind: String,
    pub user_identifier: String,
}

impl BillQueryWire {
    pub const KIND: &'static str = "bill_query";

    pub fn new(user_identifier: &str) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            user_identifier: user_identifier.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillReplyWire {
    pub price: f64,
    pub total_usage: f64,
}

pub fn scale_value(value: f64, factor: u64) -> u64 {
    (value * factor as f64).round().max(0.0) as u64
}

pub fn unscale_value(scaled: u64, factor: u64) -> f64 {
    scaled as f64 / factor as f64
}

pub fn format_price(price: Option<f64>, confirmed: bool) -> String {
    match price {
        Some(value) if confirmed => format!("\u{a3}{value:.2}"),
        Some(value) => format!("\u{a3}{value:.2} (unconfirmed)"),
        None => "\u{a3}x.xx".to_string(),
    }
}

pub fn format_usage(usage: f64) -> String {
    format!("{usage:.2} kWh")
}
