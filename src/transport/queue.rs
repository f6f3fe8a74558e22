use crate::config::EngineConfig;
use crate::correlation::CorrelationTracker;
use crate::error::EngineError;
use crate::sink::GridAlert;
use crate::transport::{AlertPage, BillSnapshot, SubmissionOutcome};
use crate::types::{BillQueryWire, BillReplyWire, MeterReading, SubmissionWire};
use chrono::Utc;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// RabbitMQ pseudo-queue for direct reply-to RPC. Consuming from it with
/// no_ack must happen on the same channel that publishes the requests.
const REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";
const ALERT_EXCHANGE: &str = "grid_alerts";

/// Request/reply transport over AMQP. Each submission publishes one
/// message carrying a fresh correlation token; a consumer on the reply-to
/// queue resolves the matching in-flight request.
pub struct QueueTransport {
    amqp_url: String,
    request_queue: String,
    user_identifier: String,
    submit_timeout: Duration,
    tracker: Arc<CorrelationTracker>,
    alert_buffer: Arc<Mutex<VecDeque<GridAlert>>>,
    live: Mutex<Option<Live>>,
}

struct Live {
    connection: Connection,
    channel: Channel,
    reply_task: JoinHandle<()>,
    alert_task: JoinHandle<()>,
}

impl QueueTransport {
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let transport = Self {
            amqp_url: config.amqp_url.clone(),
            request_queue: config.request_queue.clone(),
            user_identifier: config.user_identifier.clone(),
            submit_timeout: config.submit_timeout,
            tracker: Arc::new(CorrelationTracker::new()),
            alert_buffer: Arc::new(Mutex::new(VecDeque::new())),
            live: Mutex::new(None),
        };
        transport.reconnect().await?;
        Ok(transport)
    }

    pub async fn reconnect(&self) -> Result<(), EngineError> {
        let fresh = self.establish().await?;
        let previous = self.live.lock().replace(fresh);
        if let Some(previous) = previous {
            previous.reply_task.abort();
            previous.alert_task.abort();
            drop(previous.connection);
        }
        log::info!("queue transport connected to {}", self.amqp_url);
        Ok(())
    }

    async fn establish(&self) -> Result<Live, EngineError> {
        let connection =
            Connection::connect(&self.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let reply_consumer = channel
            .basic_consume(
                REPLY_TO_QUEUE,
                "meterlink-reply",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_task = tokio::spawn(run_reply_consumer(
            reply_consumer,
            Arc::clone(&self.tracker),
        ));

        channel
            .exchange_declare(
                ALERT_EXCHANGE,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let alert_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                alert_queue.name().as_str(),
                ALERT_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let alert_consumer = channel
            .basic_consume(
                alert_queue.name().as_str(),
                "meterlink-alerts",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let alert_task = tokio::spawn(run_alert_consumer(
            alert_consumer,
            Arc::clone(&self.alert_buffer),
        ));

        Ok(Live {
            connection,
            channel,
            reply_task,
            alert_task,
        })
    }

    fn current_channel(&self) -> Option<Channel> {
        self.live.lock().as_ref().map(|live| live.channel.clone())
    }

    pub fn probe(&self) -> bool {
        self.live
            .lock()
            .as_ref()
            .map(|live| live.connection.status().connected())
            .unwrap_or(false)
    }

    pub async fn submit(&self, reading: &MeterReading) -> SubmissionOutcome {
        let Some(channel) = self.current_channel() else {
            return SubmissionOutcome::TransportError {
                cause: "queue channel not established".to_string(),
            };
        };

        let wire = SubmissionWire::from_reading(reading, &self.user_identifier);
        let payload = match serde_json::to_vec(&wire) {
            Ok(payload) => payload,
            Err(error) => {
                return SubmissionOutcome::TransportError {
                    cause: error.to_string(),
                }
            }
        };

        let (token, reply_rx) = self.tracker.register();
        if let Err(error) = self.publish_request(&channel, &payload, &token).await {
            self.tracker.abandon(&token);
            return SubmissionOutcome::TransportError {
                cause: error.to_string(),
            };
        }

        match self
            .tracker
            .await_reply(&token, reply_rx, self.submit_timeout)
            .await
        {
            Some(body) => match parse_price_reply(&body) {
                Ok(price) => SubmissionOutcome::Priced { price },
                Err(error) => SubmissionOutcome::TransportError {
                    cause: error.to_string(),
                },
            },
            None => SubmissionOutcome::TimedOut,
        }
    }

    pub async fn fetch_authoritative(&self) -> Result<BillSnapshot, EngineError> {
        let Some(channel) = self.current_channel() else {
            return Err(EngineError::Connectivity(
                "queue channel not established".to_string(),
            ));
        };

        let query = BillQueryWire::new(&self.user_identifier);
        let payload = serde_json::to_vec(&query)?;

        let (token, reply_rx) = self.tracker.register();
        if let Err(error) = self.publish_request(&channel, &payload, &token).await {
            self.tracker.abandon(&token);
            return Err(error);
        }

        let body = self
            .tracker
            .await_reply(&token, reply_rx, self.submit_timeout)
            .await
            .ok_or_else(|| {
                EngineError::Connectivity("no reply to bill query within deadline".to_string())
            })?;

        let reply = parse_bill_reply(&body)?;
        Ok(BillSnapshot {
            price: reply.price,
            authoritative_usage: reply.total_usage,
            as_of: Utc::now(),
        })
    }

    pub fn drain_alerts(&self) -> AlertPage {
        AlertPage {
            alerts: self.alert_buffer.lock().drain(..).collect(),
            cursor: 0,
        }
    }

    async fn publish_request(
        &self,
        channel: &Channel,
        payload: &[u8],
        token: &str,
    ) -> Result<(), EngineError> {
        let properties = BasicProperties::default()
            .with_reply_to(REPLY_TO_QUEUE.into())
            .with_correlation_id(token.into());

        let confirm = channel
            .basic_publish(
                "",
                &self.request_queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        confirm.await?;
        Ok(())
    }
}

async fn run_reply_consumer(mut consumer: Consumer, tracker: Arc<CorrelationTracker>) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                let Some(token) = delivery.properties.correlation_id().clone() else {
                    log::warn!("discarding reply without a correlation id");
                    continue;
                };
                let body = String::from_utf8_lossy(&delivery.data).to_string();
                tracker.resolve(token.as_str(), body);
            }
            Err(error) => {
                log::error!("reply consumer stream failed: {error}");
                break;
            }
        }
    }
}

async fn run_alert_consumer(mut consumer: Consumer, buffer: Arc<Mutex<VecDeque<GridAlert>>>) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => match parse_alert(&delivery.data) {
                Ok(alert) => buffer.lock().push_back(alert),
                Err(error) => log::warn!("discarding unparseable grid alert: {error}"),
            },
            Err(error) => {
                log::error!("alert consumer stream failed: {error}");
                break;
            }
        }
    }
}

fn parse_price_reply(body: &str) -> Result<f64, EngineError> {
    let price = body.trim().parse::<f64>()?;
    if !price.is_finite() || price < 0.0 {
        return Err(EngineError::MalformedData(format!(
            "price reply must be finite and non-negative, got '{body}'"
        )));
    }
    Ok(price)
}

fn parse_bill_reply(body: &str) -> Result<BillReplyWire, EngineError> {
    let reply: BillReplyWire = serde_json::from_str(body)?;
    if !reply.price.is_finite() || !reply.total_usage.is_finite() || reply.total_usage < 0.0 {
        return Err(EngineError::MalformedData(
            "bill reply values must be finite and non-negative".to_string(),
        ));
    }
    Ok(reply)
}

fn parse_alert(payload: &[u8]) -> Result<GridAlert, EngineError> {
    Ok(serde_json::from_slice(payload)?)
}
