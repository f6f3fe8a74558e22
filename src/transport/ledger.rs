use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::sink::GridAlert;
use crate::transport::{AlertPage, BillSnapshot, SubmissionOutcome};
use crate::types::{scale_value, unscale_value, MeterReading};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const METHOD_STORE_READING: &str = "meter_storeReading";
const METHOD_GET_BILL: &str = "meter_getBill";
const METHOD_GET_READINGS: &str = "meter_getReadings";
const METHOD_PENDING_ALERTS: &str = "meter_pendingAlerts";
const METHOD_PING: &str = "meter_ping";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ledger-backed transport: state-changing calls are signed with a fixed
/// account key; bill and usage reads are plain read-only calls. Readings
/// cross the wire as fixed-point scaled integers.
pub struct LedgerTransport {
    endpoint: String,
    http: reqwest::Client,
    signing_key: SigningKey,
    account: String,
    reading_scale: u64,
    bill_scale: u64,
    rpc_id: AtomicU64,
}

impl LedgerTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let key_hex = config.account_key.as_deref().ok_or_else(|| {
            EngineError::Configuration("ledger backend requires an account key".to_string())
        })?;
        let signing_key = parse_signing_key(key_hex)?;
        let account = hex::encode(signing_key.verifying_key().to_bytes());

        let http = reqwest::Client::builder()
            .timeout(config.submit_timeout)
            .build()?;

        Ok(Self {
            endpoint: config.ledger_url.clone(),
            http,
            signing_key,
            account,
            reading_scale: config.reading_scale,
            bill_scale: config.bill_scale,
            rpc_id: AtomicU64::new(1),
        })
    }

    pub async fn submit(&self, reading: &MeterReading) -> SubmissionOutcome {
        let scaled = scale_value(reading.value, self.reading_scale);
        let id = reading.id.to_string();
        let signature = self.sign_reading(&id, scaled);

        match self
            .call(
                METHOD_STORE_READING,
                json!([id, scaled, self.account, signature]),
            )
            .await
        {
            Ok(tx) => log::debug!("stored reading {id} in tx {tx}"),
            Err(error) => return outcome_from_error(error),
        }

        match self.fetch_bill().await {
            Ok(price) => SubmissionOutcome::Priced { price },
            Err(error) => outcome_from_error(error),
        }
    }

    pub async fn probe(&self) -> bool {
        let id = self.rpc_id.fetch_add(1, Ordering::Relaxed);
        let body = build_rpc_body(METHOD_PING, json!([]), id);

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(PROBE_TIMEOUT)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<RpcEnvelope>().await {
                Ok(envelope) => envelope
                    .result
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    pub async fn fetch_authoritative(&self) -> Result<BillSnapshot, EngineError> {
        let price = self.fetch_bill().await?;
        let readings = self
            .call(METHOD_GET_READINGS, json!([self.account]))
            .await?;
        let total_scaled = sum_scaled_readings(&readings)?;

        Ok(BillSnapshot {
            price,
            authoritative_usage: unscale_value(total_scaled, self.reading_scale),
            as_of: Utc::now(),
        })
    }

    pub async fn poll_alerts(&self, cursor: u64) -> Result<AlertPage, EngineError> {
        let result = self
            .call(METHOD_PENDING_ALERTS, json!([self.account, cursor]))
            .await?;
        let page: AlertPageWire = serde_json::from_value(result)?;
        Ok(AlertPage {
            alerts: page.alerts,
            cursor: page.cursor,
        })
    }

    async fn fetch_bill(&self) -> Result<f64, EngineError> {
        let result = self.call(METHOD_GET_BILL, json!([self.account])).await?;
        let scaled = result.as_u64().ok_or_else(|| {
            EngineError::MalformedData(format!("bill must be a scaled integer, got {result}"))
        })?;
        Ok(unscale_value(scaled, self.bill_scale))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let id = self.rpc_id.fetch_add(1, Ordering::Relaxed);
        let body = build_rpc_body(method, params, id);

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let envelope: RpcEnvelope = response.json().await?;

        if let Some(error) = envelope.error {
            return Err(EngineError::Connectivity(format!(
                "rpc {method} failed: {} (code {})",
                error.message, error.code
            )));
        }
        envelope.result.ok_or_else(|| {
            EngineError::MalformedData(format!("rpc {method} reply carried no result"))
        })
    }

    fn sign_reading(&self, id: &str, scaled: u64) -> String {
        let payload = canonical_payload(id, scaled);
        let signature = self.signing_key.sign(payload.as_bytes());
        hex::encode(signature.to_bytes())
    }
}

fn parse_signing_key(key_hex: &str) -> Result<SigningKey, EngineError> {
    let bytes = hex::decode(key_hex.trim())
        .map_err(|_| EngineError::Configuration("account key is not valid hex".to_string()))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        EngineError::Configuration("account key must be exactly 32 bytes".to_string())
    })?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn canonical_payload(id: &str, scaled: u64) -> String {
    format!("{id}:{scaled}")
}

fn build_rpc_body(method: &str, params: Value, id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn sum_scaled_readings(readings: &Value) -> Result<u64, EngineError> {
    let entries = readings.as_array().ok_or_else(|| {
        EngineError::MalformedData("readings reply must be an array".to_string())
    })?;

    let mut total: u64 = 0;
    for entry in entries {
        let scaled = entry
            .as_array()
            .and_then(|pair| pair.get(1))
            .and_then(|value| value.as_u64())
            .ok_or_else(|| {
                EngineError::MalformedData(format!(
                    "reading entry must be an [id, scaled] pair, got {entry}"
                ))
            })?;
        total = total.saturating_add(scaled);
    }
    Ok(total)
}

fn outcome_from_error(error: EngineError) -> SubmissionOutcome {
    match &error {
        EngineError::Reqwest(inner) if inner.is_timeout() => SubmissionOutcome::TimedOut,
        _ => SubmissionOutcome::TransportError {
            cause: error.to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorWire>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorWire {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AlertPageWire {
    alerts: Vec<GridAlert>,
    cursor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn canonical_payload_joins_id_and_scaled_value() {
        assert_eq!(canonical_payload("abc", 2_730), "abc:2730");
    }

    #[test]
    fn rpc_body_carries_jsonrpc_envelope() {
        let body = build_rpc_body(METHOD_GET_BILL, json!(["acct"]), 42);

        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], 42);
        assert_eq!(body["method"], METHOD_GET_BILL);
        assert_eq!(body["params"], json!(["acct"]));
    }

    #[test]
    fn signature_is_deterministic_for_fixed_key() {
        let key = fixed_key();
        let payload = canonical_payload("reading-1", 500);

        let first = hex::encode(key.sign(payload.as_bytes()).to_bytes());
        let second = hex::encode(key.sign(payload.as_bytes()).to_bytes());

        assert_eq!(first, second);
        assert_eq!(first.len(), 128);
    }

    #[test]
    fn parses_well_formed_signing_key() {
        let key_hex = hex::encode([7u8; 32]);
        assert!(parse_signing_key(&key_hex).is_ok());
        assert!(parse_signing_key("zz").is_err());
        assert!(parse_signing_key(&hex::encode([7u8; 16])).is_err());
    }

    #[test]
    fn sums_scaled_reading_pairs() {
        let readings = json!([["a", 1_000], ["b", 730], ["c", 1_000]]);
        assert_eq!(
            sum_scaled_readings(&readings).expect("pairs should sum"),
            2_730
        );
    }

    #[test]
    fn rejects_malformed_reading_entries() {
        assert!(sum_scaled_readings(&json!("not-an-array")).is_err());
        assert!(sum_scaled_readings(&json!([["a", "not-a-number"]])).is_err());
        assert!(sum_scaled_readings(&json!([[42]])).is_err());
    }

    #[test]
    fn parses_rpc_error_envelope() {
        let envelope: RpcEnvelope = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"reverted"}}"#,
        )
        .expect("envelope should parse");

        let error = envelope.error.expect("error should be present");
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "reverted");
        assert!(envelope.result.is_none());
    }

    #[test]
    fn parses_alert_page() {
        let page: AlertPageWire = serde_json::from_value(json!({
            "alerts": [{"message": "Grid maintenance tonight", "severity": "info"}],
            "cursor": 9,
        }))
        .expect("alert page should parse");

        assert_eq!(page.alerts.len(), 1);
        assert_eq!(page.cursor, 9);
    }

    #[test]
    fn non_timeout_errors_map_to_transport_error_outcome() {
        let outcome = outcome_from_error(EngineError::Connectivity("down".to_string()));
        assert!(matches!(
            outcome,
            SubmissionOutcome::TransportError { .. }
        ));
    }
}
