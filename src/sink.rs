use serde::{Deserialize, Serialize};

/// Display surface consumed by the engine. Implementations render however
/// they like; the engine only pushes state changes through these three
/// operations.
pub trait UiSink: Send + Sync {
    fn update_connection_status(&self, status: SinkStatus);
    fn update_display(&self, price: &str, usage: &str);
    fn update_notice(&self, message: &str, severity: AlertSeverity);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkStatus {
    Connected,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAlert {
    pub message: String,
    pub severity: AlertSeverity,
}

pub struct LogSink;

impl UiSink for LogSink {
    fn update_connection_status(&self, status: SinkStatus) {
        match status {
            SinkStatus::Connected => log::info!("connection status: connected"),
            SinkStatus::Degraded => log::warn!("connection status: degraded"),
            SinkStatus::Error => log::error!("connection status: error"),
        }
    }

    fn update_display(&self, price: &str, usage: &str) {
        log::info!("display: {price} @ {usage}");
    }

    fn update_notice(&self, message: &str, severity: AlertSeverity) {
        if message.is_empty() {
            log::info!("notice cleared");
            return;
        }
        match severity {
            AlertSeverity::Info => log::info!("notice: {message}"),
            AlertSeverity::Warning => log::warn!("notice: {message}"),
            AlertSeverity::Error => log::error!("notice: {message}"),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub statuses: Mutex<Vec<SinkStatus>>,
        pub displays: Mutex<Vec<(String, String)>>,
        pub notices: Mutex<Vec<(String, AlertSeverity)>>,
    }

    impl UiSink for RecordingSink {
        fn update_connection_status(&self, status: SinkStatus) {
            self.statuses.lock().push(status);
        }

        fn update_display(&self, price: &str, usage: &str) {
            self.displays
                .lock()
                .push((price.to_string(), usage.to_string()));
        }

        fn update_notice(&self, message: &str, severity: AlertSeverity) {
            self.notices.lock().push((message.to_string(), severity));
        }
    }
}
