use crate::sink::GridAlert;
use crate::transport::{AlertPage, BillSnapshot, SubmissionOutcome};
use crate::types::MeterReading;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use uuid::Uuid;

const MOCK_PRICE_PER_KWH: f64 = 0.22;

/// In-process stand-in for a real backend. With nothing scripted it prices
/// every accepted reading at a flat tariff; tests queue up outcomes, probe
/// results and alerts to drive specific paths.
#[derive(Default)]
pub struct MockTransport {
    scripted_outcomes: Mutex<VecDeque<SubmissionOutcome>>,
    scripted_probes: Mutex<VecDeque<bool>>,
    scripted_snapshots: Mutex<VecDeque<Result<BillSnapshot, String>>>,
    pending_alerts: Mutex<VecDeque<GridAlert>>,
    accepted_usage: Mutex<f64>,
    submitted_ids: Mutex<Vec<Uuid>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, reading: &MeterReading) -> SubmissionOutcome {
        self.submitted_ids.lock().push(reading.id);

        if let Some(outcome) = self.scripted_outcomes.lock().pop_front() {
            if matches!(outcome, SubmissionOutcome::Priced { .. }) {
                *self.accepted_usage.lock() += reading.value;
            }
            return outcome;
        }

        let total = {
            let mut accepted = self.accepted_usage.lock();
            *accepted += reading.value;
            *accepted
        };
        SubmissionOutcome::Priced {
            price: total * MOCK_PRICE_PER_KWH,
        }
    }

    pub fn probe(&self) -> bool {
        self.scripted_probes.lock().pop_front().unwrap_or(true)
    }

    pub fn fetch_authoritative(&self) -> Result<BillSnapshot, crate::error::EngineError> {
        if let Some(scripted) = self.scripted_snapshots.lock().pop_front() {
            return scripted.map_err(crate::error::EngineError::Connectivity);
        }
        let usage = *self.accepted_usage.lock();
        Ok(BillSnapshot {
            price: usage * MOCK_PRICE_PER_KWH,
            authoritative_usage: usage,
            as_of: Utc::now(),
        })
    }

    pub fn drain_alerts(&self) -> AlertPage {
        AlertPage {
            alerts: self.pending_alerts.lock().drain(..).collect(),
            cursor: 0,
        }
    }

    pub fn script_outcome(&self, outcome: SubmissionOutcome) {
        self.scripted_outcomes.lock().push_back(outcome);
    }

    pub fn script_probe(&self, reachable: bool) {
        self.scripted_probes.lock().push_back(reachable);
    }

    pub fn script_snapshot(&self, snapshot: BillSnapshot) {
        self.scripted_snapshots.lock().push_back(Ok(snapshot));
    }

    pub fn script_snapshot_failure(&self, cause: &str) {
        self.scripted_snapshots
            .lock()
            .push_back(Err(cause.to_string()));
    }

    pub fn push_alert(&self, alert: GridAlert) {
        self.pending_alerts.lock().push_back(alert);
    }

    pub fn accepted_usage(&self) -> f64 {
        *self.accepted_usage.lock()
    }

    pub fn submitted_ids(&self) -> Vec<Uuid> {
        self.submitted_ids.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::AlertSeverity;

    fn reading(value: f64) -> MeterReading {
        MeterReading::new(value).expect("test reading should be valid")
    }

    #[test]
    fn prices_at_flat_tariff_by_default() {
        let transport = MockTransport::new();

        let outcome = transport.submit(&reading(2.0));
        assert_eq!(outcome, SubmissionOutcome::Priced { price: 0.44 });

        let outcome = transport.submit(&reading(3.0));
        assert_eq!(outcome, SubmissionOutcome::Priced { price: 1.1 });
        assert_eq!(transport.accepted_usage(), 5.0);
    }

    #[test]
    fn scripted_outcomes_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.script_outcome(SubmissionOutcome::TimedOut);
        transport.script_outcome(SubmissionOutcome::Priced { price: 11.2 });

        assert_eq!(transport.submit(&reading(1.0)), SubmissionOutcome::TimedOut);
        assert_eq!(transport.accepted_usage(), 0.0);

        assert_eq!(
            transport.submit(&reading(1.0)),
            SubmissionOutcome::Priced { price: 11.2 }
        );
        assert_eq!(transport.accepted_usage(), 1.0);
        assert_eq!(transport.submitted_ids().len(), 2);
    }

    #[test]
    fn probe_defaults_to_reachable() {
        let transport = MockTransport::new();
        transport.script_probe(false);

        assert!(!transport.probe());
        assert!(transport.probe());
    }

    #[test]
    fn authoritative_snapshot_reflects_accepted_usage() {
        let transport = MockTransport::new();
        transport.submit(&reading(2.73));

        let snapshot = transport
            .fetch_authoritative()
            .expect("mock snapshot should succeed");
        assert_eq!(snapshot.authoritative_usage, 2.73);
    }

    #[test]
    fn scripted_snapshot_failure_surfaces_as_error() {
        let transport = MockTransport::new();
        transport.script_snapshot_failure("backend unreachable");

        assert!(transport.fetch_authoritative().is_err());
        assert!(transport.fetch_authoritative().is_ok());
    }

    #[test]
    fn alerts_drain_once() {
        let transport = MockTransport::new();
        transport.push_alert(GridAlert {
            message: "Planned outage at 18:00".to_string(),
            severity: AlertSeverity::Warning,
        });

        assert_eq!(transport.drain_alerts().alerts.len(), 1);
        assert!(transport.drain_alerts().alerts.is_empty());
    }
}
