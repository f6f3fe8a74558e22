use crate::engine::state::{set_connection, ConnectionChange, MeterState};
use crate::sink::{SinkStatus, UiSink};
use crate::transport::{reconnect_delay, MeterTransport};
use crate::types::ConnectionState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically probes the backend and drives the connection state machine.
/// Status is pushed to the sink only when the state actually changes.
pub async fn run_monitor(
    state: Arc<Mutex<MeterState>>,
    transport: Arc<MeterTransport>,
    sink: Arc<dyn UiSink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                monitor_cycle(&state, &transport, sink.as_ref(), &mut attempt, &cancel).await;
            }
        }
    }
    log::debug!("connection monitor stopped");
}

pub(crate) async fn monitor_cycle(
    state: &Mutex<MeterState>,
    transport: &MeterTransport,
    sink: &dyn UiSink,
    attempt: &mut u32,
    cancel: &CancellationToken,
) {
    if transport.probe().await {
        *attempt = 0;
        publish_connection(state, ConnectionState::Connected, sink);
        return;
    }

    if publish_connection(state, ConnectionState::Disconnected, sink) {
        log::warn!("backend probe failed, connection lost");
    }

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(reconnect_delay(*attempt)) => {}
    }
    *attempt = attempt.saturating_add(1);

    match transport.reconnect().await {
        Ok(()) => {
            if transport.probe().await {
                *attempt = 0;
                publish_connection(state, ConnectionState::Connected, sink);
                log::info!("backend connection restored");
            }
        }
        Err(error) => {
            log::warn!("reconnect attempt {attempt} failed: {error}");
        }
    }
}

pub(crate) fn publish_connection(
    state: &Mutex<MeterState>,
    next: ConnectionState,
    sink: &dyn UiSink,
) -> bool {
    let change = set_connection(&mut state.lock(), next);
    match change {
        ConnectionChange::Changed { .. } => {
            sink.update_connection_status(status_for(next));
            true
        }
        ConnectionChange::Unchanged => false,
    }
}

fn status_for(connection: ConnectionState) -> SinkStatus {
    match connection {
        ConnectionState::Connected => SinkStatus::Connected,
        ConnectionState::Degraded | ConnectionState::Connecting => SinkStatus::Degraded,
        ConnectionState::Disconnected => SinkStatus::Error,
    }
}
