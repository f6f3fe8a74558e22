use crate::sink::UiSink;
use crate::transport::{reconnect_delay, MeterTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polls the backend for out-of-band grid alerts and forwards them to the
/// sink. An empty poll after a shown notice clears it.
pub async fn run_alert_listener(
    transport: Arc<MeterTransport>,
    sink: Arc<dyn UiSink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut cursor: u64 = 0;
    let mut notice_shown = false;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                match alert_cycle(&transport, sink.as_ref(), &mut cursor, &mut notice_shown).await {
                    Ok(()) => failures = 0,
                    Err(error) => {
                        failures = failures.saturating_add(1);
                        log::warn!("alert poll failed ({failures} in a row): {error}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay(failures)) => {}
                        }
                    }
                }
            }
        }
    }
    log::debug!("alert listener stopped");
}

pub(crate) async fn alert_cycle(
    transport: &MeterTransport,
    sink: &dyn UiSink,
    cursor: &mut u64,
    notice_shown: &mut bool,
) -> Result<(), crate::error::EngineError> {
    let page = transport.poll_alerts(*cursor).await?;
    *cursor = page.cursor;

    if page.alerts.is_empty() {
        if *notice_shown {
            sink.update_notice("", crate::sink::AlertSeverity::Info);
            *notice_shown = false;
        }
        return Ok(());
    }

    for alert in &page.alerts {
        log::info!("grid alert ({:?}): {}", alert.severity, alert.message);
        sink.update_notice(&alert.message, alert.severity);
    }
    *notice_shown = true;
    Ok(())
}
