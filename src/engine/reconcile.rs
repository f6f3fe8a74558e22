use crate::engine::monitor::publish_connection;
use crate::engine::state::{apply_authoritative, render_display, MeterState, ReconcileOutcome};
use crate::sink::UiSink;
use crate::transport::MeterTransport;
use crate::types::ConnectionState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically fetches the backend's authoritative bill and usage and
/// squares the optimistic local state with it.
pub async fn run_reconciler(
    state: Arc<Mutex<MeterState>>,
    transport: Arc<MeterTransport>,
    sink: Arc<dyn UiSink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                reconcile_cycle(&state, &transport, sink.as_ref()).await;
            }
        }
    }
    log::debug!("reconciler stopped");
}

pub(crate) async fn reconcile_cycle(
    state: &Mutex<MeterState>,
    transport: &MeterTransport,
    sink: &dyn UiSink,
) {
    let snapshot = match transport.fetch_authoritative().await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            log::warn!("authoritative fetch failed: {error}");
            let (price, usage) = {
                let mut state = state.lock();
                state.price_confirmed = false;
                render_display(&state)
            };
            sink.update_display(&price, &usage);
            publish_connection(state, ConnectionState::Degraded, sink);
            return;
        }
    };

    let (outcome, price, usage) = {
        let mut state = state.lock();
        let outcome = apply_authoritative(&mut state, &snapshot);
        let (price, usage) = render_display(&state);
        (outcome, price, usage)
    };

    match outcome {
        ReconcileOutcome::Corrected {
            local,
            authoritative,
        } => {
            log::warn!(
                "local usage {local:.3} kWh drifted from authoritative {authoritative:.3} kWh, \
                 adopting authority"
            );
        }
        ReconcileOutcome::AuthoritativeBehind {
            local,
            authoritative,
        } => {
            log::debug!(
                "backend total {authoritative:.3} kWh trails local {local:.3} kWh, \
                 awaiting catch-up"
            );
        }
        ReconcileOutcome::Consistent => {}
    }
    sink.update_display(&price, &usage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{apply_priced, record_generated};
    use crate::sink::testing::RecordingSink;
    use crate::sink::SinkStatus;
    use crate::transport::{BillSnapshot, MockTransport};
    use crate::types::MeterReading;
    use chrono::Utc;

    fn reading(value: f64) -> MeterReading {
        MeterReading::new(value).expect("test reading should be valid")
    }

    #[tokio::test]
    async fn adopts_authoritative_usage_and_updates_display() {
        let state = Mutex::new(MeterState::new(1_000));
        record_generated(&mut state.lock(), &reading(2.0));

        let mock = MockTransport::new();
        mock.script_snapshot(BillSnapshot {
            price: 8.5,
            authoritative_usage: 2.73,
            as_of: Utc::now(),
        });
        let transport = MeterTransport::Mock(mock);
        let sink = RecordingSink::default();

        reconcile_cycle(&state, &transport, &sink).await;

        assert_eq!(state.lock().cumulative_usage, 2.73);
        assert_eq!(
            sink.displays.lock().last(),
            Some(&("\u{a3}8.50".to_string(), "2.73 kWh".to_string()))
        );
    }

    #[tokio::test]
    async fn lagging_backend_keeps_the_local_display() {
        let state = Mutex::new(MeterState::new(1_000));
        {
            let mut state = state.lock();
            record_generated(&mut state, &reading(2.73));
            apply_priced(&mut state, 8.5);
        }

        let mock = MockTransport::new();
        mock.script_snapshot(BillSnapshot {
            price: 0.0,
            authoritative_usage: 0.0,
            as_of: Utc::now(),
        });
        let transport = MeterTransport::Mock(mock);
        let sink = RecordingSink::default();

        reconcile_cycle(&state, &transport, &sink).await;

        assert_eq!(state.lock().cumulative_usage, 2.73);
        assert_eq!(
            sink.displays.lock().last(),
            Some(&(
                "\u{a3}8.50 (unconfirmed)".to_string(),
                "2.73 kWh".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn unreachable_backend_unconfirms_price_and_degrades_status() {
        let state = Mutex::new(MeterState::new(1_000));
        {
            let mut state = state.lock();
            record_generated(&mut state, &reading(2.73));
            apply_priced(&mut state, 8.5);
        }

        let mock = MockTransport::new();
        mock.script_snapshot_failure("backend unreachable");
        let transport = MeterTransport::Mock(mock);
        let sink = RecordingSink::default();

        reconcile_cycle(&state, &transport, &sink).await;

        assert!(!state.lock().price_confirmed);
        assert_eq!(
            sink.displays.lock().last(),
            Some(&(
                "\u{a3}8.50 (unconfirmed)".to_string(),
                "2.73 kWh".to_string()
            ))
        );
        assert_eq!(sink.statuses.lock().as_slice(), &[SinkStatus::Degraded]);
    }

    #[tokio::test]
    async fn consistent_state_still_refreshes_the_price() {
        let state = Mutex::new(MeterState::new(1_000));
        record_generated(&mut state.lock(), &reading(2.73));

        let mock = MockTransport::new();
        mock.script_snapshot(BillSnapshot {
            price: 8.5,
            authoritative_usage: 2.73,
            as_of: Utc::now(),
        });
        let transport = MeterTransport::Mock(mock);
        let sink = RecordingSink::default();

        reconcile_cycle(&state, &transport, &sink).await;

        let state = state.lock();
        assert_eq!(state.displayed_price, Some(8.5));
        assert!(state.price_confirmed);
    }
}
