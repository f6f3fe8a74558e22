use crate::error::EngineError;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_AMQP_URL: &str = "amqp://127.0.0.1:5672/%2f";
pub const DEFAULT_REQUEST_QUEUE: &str = "meter_reading_queue";
pub const DEFAULT_LEDGER_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MIN_WAIT_SECS: u64 = 15;
pub const DEFAULT_MAX_WAIT_SECS: u64 = 60;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BACKLOG_SCAN_SECS: u64 = 20;
pub const DEFAULT_ALERT_POLL_SECS: u64 = 2;
pub const DEFAULT_READING_SCALE: u64 = 1_000;
pub const DEFAULT_BILL_SCALE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Queue,
    Ledger,
    Mock,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self, EngineError> {
        match value.to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "ledger" => Ok(Self::Ledger),
            "mock" => Ok(Self::Mock),
            other => Err(EngineError::Configuration(format!(
                "unknown backend '{other}', expected queue, ledger or mock"
            ))),
        }
    }
}

/// Raw settings as read from the environment. Everything is optional here;
/// `normalize` applies defaults and rejects inconsistent combinations.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub backend: Option<String>,
    pub amqp_url: Option<String>,
    pub request_queue: Option<String>,
    pub ledger_url: Option<String>,
    pub account_key: Option<String>,
    pub user_identifier: Option<String>,
    pub submit_timeout_secs: Option<u64>,
    pub min_wait_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub reconcile_interval_secs: Option<u64>,
    pub backlog_scan_secs: Option<u64>,
    pub alert_poll_secs: Option<u64>,
    pub reading_scale: Option<u64>,
    pub bill_scale: Option<u64>,
    pub prime_readings: Option<u16>,
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, EngineError> {
    match env_value(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            EngineError::Configuration(format!("{key} has an unparseable value '{raw}'"))
        }),
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Self {
            backend: env_value("METER_BACKEND"),
            amqp_url: env_value("METER_AMQP_URL"),
            request_queue: env_value("METER_REQUEST_QUEUE"),
            ledger_url: env_value("METER_LEDGER_URL"),
            account_key: env_value("METER_ACCOUNT_KEY"),
            user_identifier: env_value("METER_USER_ID"),
            submit_timeout_secs: env_parsed("METER_SUBMIT_TIMEOUT_SECS")?,
            min_wait_secs: env_parsed("METER_MIN_WAIT_SECS")?,
            max_wait_secs: env_parsed("METER_MAX_WAIT_SECS")?,
            monitor_interval_secs: env_parsed("METER_MONITOR_INTERVAL_SECS")?,
            reconcile_interval_secs: env_parsed("METER_RECONCILE_INTERVAL_SECS")?,
            backlog_scan_secs: env_parsed("METER_BACKLOG_SCAN_SECS")?,
            alert_poll_secs: env_parsed("METER_ALERT_POLL_SECS")?,
            reading_scale: env_parsed("METER_READING_SCALE")?,
            bill_scale: env_parsed("METER_BILL_SCALE")?,
            prime_readings: env_parsed("METER_PRIME_READINGS")?,
        })
    }

    pub fn normalize(self) -> Result<EngineConfig, EngineError> {
        let backend = match self.backend {
            Some(raw) => BackendKind::parse(&raw)?,
            None => BackendKind::Queue,
        };

        let amqp_url = self.amqp_url.unwrap_or_else(|| DEFAULT_AMQP_URL.to_string());
        let request_queue = self
            .request_queue
            .unwrap_or_else(|| DEFAULT_REQUEST_QUEUE.to_string());
        let ledger_url = self
            .ledger_url
            .unwrap_or_else(|| DEFAULT_LEDGER_URL.to_string());

        if backend == BackendKind::Queue && amqp_url.is_empty() {
            return Err(EngineError::Configuration(
                "queue backend requires METER_AMQP_URL".to_string(),
            ));
        }
        if backend == BackendKind::Ledger {
            if ledger_url.is_empty() {
                return Err(EngineError::Configuration(
                    "ledger backend requires METER_LEDGER_URL".to_string(),
                ));
            }
            if self.account_key.is_none() {
                return Err(EngineError::Configuration(
                    "ledger backend requires METER_ACCOUNT_KEY".to_string(),
                ));
            }
        }

        let submit_timeout_secs = self
            .submit_timeout_secs
            .unwrap_or(DEFAULT_SUBMIT_TIMEOUT_SECS);
        let min_wait_secs = self.min_wait_secs.unwrap_or(DEFAULT_MIN_WAIT_SECS);
        let max_wait_secs = self.max_wait_secs.unwrap_or(DEFAULT_MAX_WAIT_SECS);

        if submit_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "submit timeout must be at least one second".to_string(),
            ));
        }
        // The generation interval bounding the submit timeout is what keeps
        // at most one request in flight.
        if min_wait_secs <= submit_timeout_secs {
            return Err(EngineError::Configuration(format!(
                "min wait ({min_wait_secs}s) must exceed the submit timeout ({submit_timeout_secs}s)"
            )));
        }
        if min_wait_secs > max_wait_secs {
            return Err(EngineError::Configuration(format!(
                "min wait ({min_wait_secs}s) must not exceed max wait ({max_wait_secs}s)"
            )));
        }

        let monitor_interval_secs = self
            .monitor_interval_secs
            .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS);
        let reconcile_interval_secs = self
            .reconcile_interval_secs
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS);
        let backlog_scan_secs = self.backlog_scan_secs.unwrap_or(DEFAULT_BACKLOG_SCAN_SECS);
        let alert_poll_secs = self.alert_poll_secs.unwrap_or(DEFAULT_ALERT_POLL_SECS);
        if monitor_interval_secs == 0
            || reconcile_interval_secs == 0
            || backlog_scan_secs == 0
            || alert_poll_secs == 0
        {
            return Err(EngineError::Configuration(
                "polling intervals must be at least one second".to_string(),
            ));
        }

        let reading_scale = self.reading_scale.unwrap_or(DEFAULT_READING_SCALE);
        let bill_scale = self.bill_scale.unwrap_or(DEFAULT_BILL_SCALE);
        if reading_scale == 0 || bill_scale == 0 {
            return Err(EngineError::Configuration(
                "scaling factors must be positive".to_string(),
            ));
        }

        Ok(EngineConfig {
            backend,
            amqp_url,
            request_queue,
            ledger_url,
            account_key: self.account_key,
            user_identifier: self
                .user_identifier
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            submit_timeout: Duration::from_secs(submit_timeout_secs),
            min_wait: Duration::from_secs(min_wait_secs),
            max_wait: Duration::from_secs(max_wait_secs),
            monitor_interval: Duration::from_secs(monitor_interval_secs),
            reconcile_interval: Duration::from_secs(reconcile_interval_secs),
            backlog_scan_interval: Duration::from_secs(backlog_scan_secs),
            alert_poll_interval: Duration::from_secs(alert_poll_secs),
            reading_scale,
            bill_scale,
            prime_readings: self.prime_readings.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub amqp_url: String,
    pub request_queue: String,
    pub ledger_url: String,
    /// Opaque credential reference; parsed by the ledger transport, never
    /// interpreted by the engine.
    pub account_key: Option<String>,
    pub user_identifier: String,
    pub submit_timeout: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub monitor_interval: Duration,
    pub reconcile_interval: Duration,
    pub backlog_scan_interval: Duration,
    pub alert_poll_interval: Duration,
    pub reading_scale: u64,
    pub bill_scale: u64,
    pub prime_readings: u16,
}
