use crate::transport::BillSnapshot;
use crate::types::{format_price, format_usage, ConnectionState, MeterReading};
use std::collections::VecDeque;
use uuid::Uuid;

/// Locally tracked meter state. `cumulative_usage` is optimistic: it counts
/// every generated reading immediately, including readings still waiting in
/// the backlog. The reconciliation pass squares it with the backend.
#[derive(Debug, Clone)]
pub struct MeterState {
    pub cumulative_usage: f64,
    pub displayed_price: Option<f64>,
    pub price_confirmed: bool,
    pub backlog: VecDeque<MeterReading>,
    pub connection: ConnectionState,
    epsilon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogPush {
    Queued,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Consistent,
    Corrected { local: f64, authoritative: f64 },
    AuthoritativeBehind { local: f64, authoritative: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    Changed { previous: ConnectionState },
    Unchanged,
}

impl MeterState {
    pub fn new(reading_scale: u64) -> Self {
        Self {
            cumulative_usage: 0.0,
            displayed_price: None,
            price_confirmed: false,
            backlog: VecDeque::new(),
            connection: ConnectionState::Disconnected,
            epsilon: 1.0 / reading_scale as f64,
        }
    }

    fn backlog_usage(&self) -> f64 {
        self.backlog.iter().map(|reading| reading.value).sum()
    }
}

/// Counts a freshly generated reading before its submission settles. The
/// displayed price stops being authoritative until the next pricing.
pub fn record_generated(state: &mut MeterState, reading: &MeterReading) {
    state.cumulative_usage += reading.value;
    state.price_confirmed = false;
}

/// Adopts the price returned by a successful submission. The price only
/// counts as confirmed once nothing is left waiting in the backlog.
pub fn apply_priced(state: &mut MeterState, price: f64) {
    state.displayed_price = Some(price);
    state.price_confirmed = state.backlog.is_empty();
}

pub fn push_backlog(state: &mut MeterState, reading: MeterReading) -> BacklogPush {
    if state.backlog.iter().any(|queued| queued.id == reading.id) {
        return BacklogPush::Duplicate;
    }
    state.backlog.push_back(reading);
    state.price_confirmed = false;
    BacklogPush::Queued
}

pub fn front_backlog(state: &MeterState) -> Option<MeterReading> {
    state.backlog.front().cloned()
}

pub fn retire_backlog(state: &mut MeterState, id: Uuid) -> bool {
    let before = state.backlog.len();
    state.backlog.retain(|queued| queued.id != id);
    state.backlog.len() != before
}

/// Squares local optimistic state with an authoritative snapshot. Backlogged
/// readings have not reached the backend yet, so they are excluded from the
/// comparison and re-added on top of any correction. A snapshot trailing the
/// settled local total means the backend has not indexed everything already
/// shown; the local total and last price are kept until it catches up.
pub fn apply_authoritative(state: &mut MeterState, snapshot: &BillSnapshot) -> ReconcileOutcome {
    let settled_local = state.cumulative_usage - state.backlog_usage();
    let drift = snapshot.authoritative_usage - settled_local;

    if drift.abs() <= state.epsilon {
        state.displayed_price = Some(snapshot.price);
        state.price_confirmed = state.backlog.is_empty();
        return ReconcileOutcome::Consistent;
    }

    if drift < 0.0 {
        state.price_confirmed = false;
        return ReconcileOutcome::AuthoritativeBehind {
            local: settled_local,
            authoritative: snapshot.authoritative_usage,
        };
    }

    state.displayed_price = Some(snapshot.price);
    state.price_confirmed = state.backlog.is_empty();
    state.cumulative_usage = snapshot.authoritative_usage + state.backlog_usage();
    ReconcileOutcome::Corrected {
        local: settled_local,
        authoritative: snapshot.authoritative_usage,
    }
}

pub fn set_connection(state: &mut MeterState, next: ConnectionState) -> ConnectionChange {
    if state.connection == next {
        return ConnectionChange::Unchanged;
    }
    let previous = state.connection;
    state.connection = next;
    ConnectionChange::Changed { previous }
}

pub fn render_display(state: &MeterState) -> (String, String) {
    (
        format_price(state.displayed_price, state.price_confirmed),
        format_usage(state.cumulative_usage),
    )
}
