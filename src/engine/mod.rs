pub mod alerts;
pub mod monitor;
pub mod reconcile;
pub mod state;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::sink::{SinkStatus, UiSink};
use crate::transport::{MeterTransport, SubmissionOutcome};
use crate::types::{ConnectionState, MeterReading, READING_DECIMALS};
use parking_lot::Mutex;
use rand::Rng;
use state::{
    apply_priced, front_backlog, push_backlog, record_generated, render_display, retire_backlog,
    set_connection, ConnectionChange, MeterState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// At most one submission may be in flight at a time; the generator and the
/// backlog scanner both pass through this gate.
type SubmitGate = tokio::sync::Mutex<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOrigin {
    Fresh,
    Backlog,
}

/// Connects the configured backend and drives the full pipeline until the
/// token is cancelled: reading generation and submission, backlog retry,
/// connection monitoring, reconciliation and alert polling.
pub async fn run_engine(
    config: EngineConfig,
    sink: Arc<dyn UiSink>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let transport = Arc::new(MeterTransport::connect(&config).await?);
    let state = Arc::new(Mutex::new(MeterState::new(config.reading_scale)));
    let gate = Arc::new(SubmitGate::new(()));

    if let ConnectionChange::Changed { .. } =
        set_connection(&mut state.lock(), ConnectionState::Connected)
    {
        sink.update_connection_status(SinkStatus::Connected);
    }

    for _ in 0..config.prime_readings {
        let reading = MeterReading::new(sample_reading_value())?;
        publish_generated(&state, sink.as_ref(), &reading);
        submit_cycle(
            &state,
            &transport,
            sink.as_ref(),
            &gate,
            reading,
            SubmitOrigin::Fresh,
        )
        .await;
    }

    let mut tasks = Vec::new();

    let generator_state = Arc::clone(&state);
    let generator_transport = Arc::clone(&transport);
    let generator_sink = Arc::clone(&sink);
    let generator_gate = Arc::clone(&gate);
    let generator_cancel = cancel.clone();
    let generator_min = config.min_wait;
    let generator_max = config.max_wait;
    tasks.push(tokio::spawn(async move {
        run_generator(
            generator_state,
            generator_transport,
            generator_sink,
            generator_gate,
            generator_min,
            generator_max,
            generator_cancel,
        )
        .await;
    }));

    let scanner_state = Arc::clone(&state);
    let scanner_transport = Arc::clone(&transport);
    let scanner_sink = Arc::clone(&sink);
    let scanner_gate = Arc::clone(&gate);
    let scanner_cancel = cancel.clone();
    let scanner_interval = config.backlog_scan_interval;
    tasks.push(tokio::spawn(async move {
        run_backlog_scanner(
            scanner_state,
            scanner_transport,
            scanner_sink,
            scanner_gate,
            scanner_interval,
            scanner_cancel,
        )
        .await;
    }));

    let monitor_state = Arc::clone(&state);
    let monitor_transport = Arc::clone(&transport);
    let monitor_sink = Arc::clone(&sink);
    let monitor_cancel = cancel.clone();
    let monitor_interval = config.monitor_interval;
    tasks.push(tokio::spawn(async move {
        monitor::run_monitor(
            monitor_state,
            monitor_transport,
            monitor_sink,
            monitor_interval,
            monitor_cancel,
        )
        .await;
    }));

    let reconcile_state = Arc::clone(&state);
    let reconcile_transport = Arc::clone(&transport);
    let reconcile_sink = Arc::clone(&sink);
    let reconcile_cancel = cancel.clone();
    let reconcile_interval = config.reconcile_interval;
    tasks.push(tokio::spawn(async move {
        reconcile::run_reconciler(
            reconcile_state,
            reconcile_transport,
            reconcile_sink,
            reconcile_interval,
            reconcile_cancel,
        )
        .await;
    }));

    let alert_transport = Arc::clone(&transport);
    let alert_sink = Arc::clone(&sink);
    let alert_cancel = cancel.clone();
    let alert_interval = config.alert_poll_interval;
    tasks.push(tokio::spawn(async move {
        alerts::run_alert_listener(alert_transport, alert_sink, alert_interval, alert_cancel)
            .await;
    }));

    for task in tasks {
        if let Err(error) = task.await {
            log::error!("engine task ended abnormally: {error}");
        }
    }
    log::info!("engine stopped");
    Ok(())
}

async fn run_generator(
    state: Arc<Mutex<MeterState>>,
    transport: Arc<MeterTransport>,
    sink: Arc<dyn UiSink>,
    gate: Arc<SubmitGate>,
    min_wait: Duration,
    max_wait: Duration,
    cancel: CancellationToken,
) {
    loop {
        let wait = jittered_wait(min_wait, max_wait);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                let reading = match MeterReading::new(sample_reading_value()) {
                    Ok(reading) => reading,
                    Err(error) => {
                        log::error!("discarding invalid generated reading: {error}");
                        continue;
                    }
                };
                log::debug!("generated reading {} of {:.3} kWh", reading.id, reading.value);
                publish_generated(&state, sink.as_ref(), &reading);
                submit_cycle(
                    &state,
                    &transport,
                    sink.as_ref(),
                    &gate,
                    reading,
                    SubmitOrigin::Fresh,
                )
                .await;
            }
        }
    }
    log::debug!("reading generator stopped");
}

async fn run_backlog_scanner(
    state: Arc<Mutex<MeterState>>,
    transport: Arc<MeterTransport>,
    sink: Arc<dyn UiSink>,
    gate: Arc<SubmitGate>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                backlog_cycle(&state, &transport, sink.as_ref(), &gate).await;
            }
        }
    }
    log::debug!("backlog scanner stopped");
}

pub(crate) async fn backlog_cycle(
    state: &Mutex<MeterState>,
    transport: &MeterTransport,
    sink: &dyn UiSink,
    gate: &SubmitGate,
) {
    let Some(reading) = front_backlog(&state.lock()) else {
        return;
    };
    log::info!("retrying backlogged reading {}", reading.id);
    submit_cycle(state, transport, sink, gate, reading, SubmitOrigin::Backlog).await;
}

pub(crate) async fn submit_cycle(
    state: &Mutex<MeterState>,
    transport: &MeterTransport,
    sink: &dyn UiSink,
    gate: &SubmitGate,
    reading: MeterReading,
    origin: SubmitOrigin,
) {
    let outcome = {
        let _in_flight = gate.lock().await;
        transport.submit(&reading).await
    };

    match outcome {
        SubmissionOutcome::Priced { price } => {
            let (price_text, usage_text) = {
                let mut state = state.lock();
                if origin == SubmitOrigin::Backlog {
                    retire_backlog(&mut state, reading.id);
                }
                apply_priced(&mut state, price);
                render_display(&state)
            };
            sink.update_display(&price_text, &usage_text);
        }
        SubmissionOutcome::TimedOut => {
            log::warn!("submission of reading {} timed out", reading.id);
            queue_for_retry(state, sink, reading, origin);
        }
        SubmissionOutcome::TransportError { cause } => {
            log::error!("submission of reading {} failed: {cause}", reading.id);
            queue_for_retry(state, sink, reading, origin);
        }
    }
}

/// A failed fresh submission joins the backlog; a failed retry is already
/// there and simply stays queued.
fn queue_for_retry(
    state: &Mutex<MeterState>,
    sink: &dyn UiSink,
    reading: MeterReading,
    origin: SubmitOrigin,
) {
    let (price_text, usage_text) = {
        let mut state = state.lock();
        if origin == SubmitOrigin::Fresh {
            push_backlog(&mut state, reading);
        }
        render_display(&state)
    };
    sink.update_display(&price_text, &usage_text);
}

fn publish_generated(state: &Mutex<MeterState>, sink: &dyn UiSink, reading: &MeterReading) {
    let (price_text, usage_text) = {
        let mut state = state.lock();
        record_generated(&mut state, reading);
        render_display(&state)
    };
    sink.update_display(&price_text, &usage_text);
}

fn jittered_wait(min_wait: Duration, max_wait: Duration) -> Duration {
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(min_wait.as_secs_f64()..=max_wait.as_secs_f64()))
}

fn sample_reading_value() -> f64 {
    let precision = 10_f64.powi(READING_DECIMALS as i32);
    let raw: f64 = rand::rng().random_range(0.05..=1.5);
    (raw * precision).round() / precision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use crate::transport::MockTransport;

    fn reading(value: f64) -> MeterReading {
        MeterReading::new(value).expect("test reading should be valid")
    }

    fn harness() -> (Mutex<MeterState>, RecordingSink, SubmitGate) {
        (
            Mutex::new(MeterState::new(1_000)),
            RecordingSink::default(),
            SubmitGate::new(()),
        )
    }

    #[tokio::test]
    async fn priced_submission_updates_the_display() {
        let (state, sink, gate) = harness();
        let mock = MockTransport::new();
        mock.script_outcome(SubmissionOutcome::Priced { price: 8.5 });
        let transport = MeterTransport::Mock(mock);

        let generated = reading(2.73);
        publish_generated(&state, &sink, &generated);
        submit_cycle(&state, &transport, &sink, &gate, generated, SubmitOrigin::Fresh).await;

        let displays = sink.displays.lock();
        assert_eq!(
            displays.first(),
            Some(&(
                "\u{a3}x.xx".to_string(),
                "2.73 kWh".to_string()
            ))
        );
        assert_eq!(
            displays.last(),
            Some(&("\u{a3}8.50".to_string(), "2.73 kWh".to_string()))
        );
        assert!(state.lock().backlog.is_empty());
    }

    #[tokio::test]
    async fn timed_out_submission_lands_in_the_backlog() {
        let (state, sink, gate) = harness();
        let mock = MockTransport::new();
        mock.script_outcome(SubmissionOutcome::TimedOut);
        let transport = MeterTransport::Mock(mock);

        let generated = reading(1.0);
        publish_generated(&state, &sink, &generated);
        submit_cycle(&state, &transport, &sink, &gate, generated, SubmitOrigin::Fresh).await;

        let state_guard = state.lock();
        assert_eq!(state_guard.backlog.len(), 1);
        assert_eq!(state_guard.cumulative_usage, 1.0);
        assert!(!state_guard.price_confirmed);
    }

    #[tokio::test]
    async fn backlog_retry_retires_the_reading_on_success() {
        let (state, sink, gate) = harness();
        let mock = MockTransport::new();
        mock.script_outcome(SubmissionOutcome::TimedOut);
        mock.script_outcome(SubmissionOutcome::Priced { price: 11.2 });
        let transport = MeterTransport::Mock(mock);

        let generated = reading(2.73);
        publish_generated(&state, &sink, &generated);
        submit_cycle(&state, &transport, &sink, &gate, generated, SubmitOrigin::Fresh).await;
        assert_eq!(state.lock().backlog.len(), 1);

        backlog_cycle(&state, &transport, &sink, &gate).await;

        let state_guard = state.lock();
        assert!(state_guard.backlog.is_empty());
        assert_eq!(state_guard.displayed_price, Some(11.2));
        assert!(state_guard.price_confirmed);
        assert_eq!(
            sink.displays.lock().last(),
            Some(&("\u{a3}11.20".to_string(), "2.73 kWh".to_string()))
        );
    }

    #[tokio::test]
    async fn failed_retry_keeps_the_reading_queued() {
        let (state, sink, gate) = harness();
        let mock = MockTransport::new();
        mock.script_outcome(SubmissionOutcome::TransportError {
            cause: "broker unavailable".to_string(),
        });
        mock.script_outcome(SubmissionOutcome::TimedOut);
        let transport = MeterTransport::Mock(mock);

        let stuck = reading(1.0);
        push_backlog(&mut state.lock(), stuck.clone());

        backlog_cycle(&state, &transport, &sink, &gate).await;
        backlog_cycle(&state, &transport, &sink, &gate).await;

        let state_guard = state.lock();
        assert_eq!(state_guard.backlog.len(), 1);
        assert_eq!(front_backlog(&state_guard).map(|queued| queued.id), Some(stuck.id));
    }

    #[tokio::test]
    async fn empty_backlog_cycle_submits_nothing() {
        let (state, sink, gate) = harness();
        let transport = MeterTransport::Mock(MockTransport::new());

        backlog_cycle(&state, &transport, &sink, &gate).await;

        let MeterTransport::Mock(mock) = &transport else {
            unreachable!()
        };
        assert!(mock.submitted_ids().is_empty());
        assert!(sink.displays.lock().is_empty());
    }

    #[test]
    fn sampled_readings_stay_within_bounds() {
        for _ in 0..100 {
            let value = sample_reading_value();
            assert!((0.05..=1.5).contains(&value));
            let scaled = value * 1_000.0;
            assert!((scaled - scaled.round()).abs() < 1e-9);
        }
    }

    #[test]
    fn jittered_wait_respects_bounds() {
        let min_wait = Duration::from_secs(15);
        let max_wait = Duration::from_secs(60);
        for _ in 0..50 {
            let wait = jittered_wait(min_wait, max_wait);
            assert!(wait >= min_wait);
            assert!(wait <= max_wait);
        }
    }
}
