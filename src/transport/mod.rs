pub mod ledger;
pub mod mock;
pub mod queue;

use crate::config::{BackendKind, EngineConfig};
use crate::error::EngineError;
use crate::sink::GridAlert;
use crate::types::MeterReading;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use ledger::LedgerTransport;
pub use mock::MockTransport;
pub use queue::QueueTransport;

/// Result of one submission attempt. Exactly one outcome is produced per
/// request; retry policy lives with the caller, never in the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Priced { price: f64 },
    TimedOut,
    TransportError { cause: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillSnapshot {
    pub price: f64,
    pub authoritative_usage: f64,
    pub as_of: DateTime<Utc>,
}

/// Page of out-of-band grid alerts. `cursor` is opaque to the engine and
/// echoed back on the next poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertPage {
    pub alerts: Vec<GridAlert>,
    pub cursor: u64,
}

pub enum MeterTransport {
    Queue(QueueTransport),
    Ledger(LedgerTransport),
    Mock(MockTransport),
}

impl MeterTransport {
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        match config.backend {
            BackendKind::Queue => Ok(Self::Queue(QueueTransport::connect(config).await?)),
            BackendKind::Ledger => Ok(Self::Ledger(LedgerTransport::new(config)?)),
            BackendKind::Mock => Ok(Self::Mock(MockTransport::new())),
        }
    }

    pub async fn submit(&self, reading: &MeterReading) -> SubmissionOutcome {
        match self {
            Self::Queue(transport) => transport.submit(reading).await,
            Self::Ledger(transport) => transport.submit(reading).await,
            Self::Mock(transport) => transport.submit(reading),
        }
    }

    pub async fn probe(&self) -> bool {
        match self {
            Self::Queue(transport) => transport.probe(),
            Self::Ledger(transport) => transport.probe().await,
            Self::Mock(transport) => transport.probe(),
        }
    }

    pub async fn fetch_authoritative(&self) -> Result<BillSnapshot, EngineError> {
        match self {
            Self::Queue(transport) => transport.fetch_authoritative().await,
            Self::Ledger(transport) => transport.fetch_authoritative().await,
            Self::Mock(transport) => transport.fetch_authoritative(),
        }
    }

    pub async fn poll_alerts(&self, cursor: u64) -> Result<AlertPage, EngineError> {
        match self {
            Self::Queue(transport) => Ok(transport.drain_alerts()),
            Self::Ledger(transport) => transport.poll_alerts(cursor).await,
            Self::Mock(transport) => Ok(transport.drain_alerts()),
        }
    }

    /// Re-establishes the underlying connection after a failed probe.
    pub async fn reconnect(&self) -> Result<(), EngineError> {
        match self {
            Self::Queue(transport) => transport.reconnect().await,
            Self::Ledger(_) | Self::Mock(_) => Ok(()),
        }
    }
}

pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = now_unix_ms().unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

fn now_unix_ms() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let first = reconnect_delay(1);
        let capped = reconnect_delay(20);

        assert!(first >= Duration::from_millis(400));
        assert!(first < Duration::from_millis(700));
        assert!(capped <= Duration::from_millis(5_000));
    }
}
