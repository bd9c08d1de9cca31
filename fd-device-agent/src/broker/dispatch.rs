//! Task dispatch to the broker
//!
//! `DispatchClient::dispatch` never returns an error: every failure path is
//! logged and classified into a `DispatchOutcome`.

use super::{classify_amqp_error, close, connect, CLOSE_GRACE};
use crate::endpoint::Endpoint;
use crate::error::PublishError;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

/// Result of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    OperationalFailure,
    TimeoutFailure,
    ConnectionFailure,
    TransportFailure,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered => "delivered",
            DispatchOutcome::OperationalFailure => "operational_failure",
            DispatchOutcome::TimeoutFailure => "timeout_failure",
            DispatchOutcome::ConnectionFailure => "connection_failure",
            DispatchOutcome::TransportFailure => "transport_failure",
        }
    }
}

impl From<&PublishError> for DispatchOutcome {
    fn from(error: &PublishError) -> Self {
        match error {
            PublishError::Operational(_) => DispatchOutcome::OperationalFailure,
            PublishError::Timeout => DispatchOutcome::TimeoutFailure,
            PublishError::ConnectionClosed(_) => DispatchOutcome::ConnectionFailure,
            PublishError::Transport(_) => DispatchOutcome::TransportFailure,
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope for a named task with a single snapshot argument
#[derive(Debug, Clone, Serialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task: String,
    pub args: [Snapshot; 1],
    pub sent_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task: impl Into<String>, payload: Snapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args: [payload],
            sent_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(|e| PublishError::Transport(format!("serialization: {}", e)))
    }
}

/// Transport seam under the dispatch client
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Publish `message` within `timeout`; with `wait_for_ack` return only
    /// once the broker confirmed it. Implementations release their
    /// connection before returning, including on timeout.
    async fn publish(&self, message: &TaskMessage, wait_for_ack: bool, timeout: Duration) -> Result<(), PublishError>;

    /// Where messages go, for log lines
    fn target(&self) -> String {
        "broker".to_string()
    }
}

#[async_trait]
impl<P: TaskPublisher + ?Sized> TaskPublisher for Arc<P> {
    async fn publish(&self, message: &TaskMessage, wait_for_ack: bool, timeout: Duration) -> Result<(), PublishError> {
        (**self).publish(message, wait_for_ack, timeout).await
    }

    fn target(&self) -> String {
        (**self).target()
    }
}

/// Publishes tasks to `exchange` with `routing_key` on the resolved endpoint,
/// one connection per message
#[derive(Debug, Clone)]
pub struct AmqpPublisher {
    endpoint: Endpoint,
    exchange: String,
    routing_key: String,
    heartbeat: u16,
}

impl AmqpPublisher {
    pub fn new(endpoint: Endpoint, exchange: impl Into<String>, routing_key: impl Into<String>, heartbeat: u16) -> Self {
        Self {
            endpoint,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            heartbeat,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

#[async_trait]
impl TaskPublisher for AmqpPublisher {
    async fn publish(&self, message: &TaskMessage, wait_for_ack: bool, timeout: Duration) -> Result<(), PublishError> {
        let payload = message.to_bytes()?;
        let deadline = Instant::now() + timeout;

        let connection = match tokio::time::timeout_at(deadline, connect(&self.endpoint, "dispatch", self.heartbeat)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(classify_amqp_error(&e)),
            Err(_) => return Err(PublishError::Timeout),
        };

        let publish = exchange(
            &connection,
            &self.exchange,
            &self.routing_key,
            message,
            &payload,
            wait_for_ack,
        );
        let result = match tokio::time::timeout_at(deadline, publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout),
        };

        close(&connection).await;
        result
    }

    fn target(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Message properties: JSON body plus the task name and id as headers
fn properties(message: &TaskMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert("task".into(), AMQPValue::LongString(message.task.clone().into()));
    headers.insert("id".into(), AMQPValue::LongString(message.id.to_string().into()));

    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_content_encoding("utf-8".into())
        .with_message_id(message.id.to_string().into())
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers)
}

/// Open a channel, publish, then wait for the confirm when asked
async fn exchange(
    connection: &Connection,
    exchange: &str,
    routing_key: &str,
    message: &TaskMessage,
    payload: &[u8],
    wait_for_ack: bool,
) -> Result<(), PublishError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| classify_amqp_error(&e))?;

    if wait_for_ack {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| classify_amqp_error(&e))?;
    }

    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            properties(message),
        )
        .await
        .map_err(|e| classify_amqp_error(&e))?;

    if !wait_for_ack {
        debug!("Task {} handed to the network", message.id);
        return Ok(());
    }

    match confirm.await.map_err(|e| classify_amqp_error(&e))? {
        Confirmation::Nack(_) => Err(PublishError::Operational(format!("broker rejected task {}", message.id))),
        _ => {
            debug!("Task {} confirmed by the broker", message.id);
            Ok(())
        }
    }
}

/// Sends snapshots under task names and folds every failure into an outcome
pub struct DispatchClient<P> {
    publisher: P,
    default_timeout: Duration,
}

impl<P: TaskPublisher> DispatchClient<P> {
    pub fn new(publisher: P, default_timeout: Duration) -> Self {
        Self {
            publisher,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Submit `payload` under `task_name`, waiting at most `timeout`
    pub async fn dispatch(
        &self,
        task_name: &str,
        payload: Snapshot,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> DispatchOutcome {
        let message = TaskMessage::new(task_name, payload);
        let target = self.publisher.target();

        // publishers bound themselves; this only catches one that ignores the limit
        let backstop = timeout + CLOSE_GRACE * 2;
        let publish = self.publisher.publish(&message, wait_for_ack, timeout);
        let outcome = match tokio::time::timeout(backstop, publish).await {
            Ok(Ok(())) => DispatchOutcome::Delivered,
            Ok(Err(e)) => {
                let outcome = DispatchOutcome::from(&e);
                warn!(task = task_name, broker = %target, outcome = %outcome, "Dispatch failed: {}", e);
                outcome
            }
            Err(_) => {
                warn!(task = task_name, broker = %target, outcome = %DispatchOutcome::TimeoutFailure,
                      "No answer from broker within {:?}", timeout);
                DispatchOutcome::TimeoutFailure
            }
        };

        if outcome.is_delivered() {
            debug!(task = task_name, broker = %target, wait_for_ack, "Dispatched task {}", message.id);
        }
        outcome
    }

    /// `dispatch` with the configured timeout
    pub async fn send(&self, task_name: &str, payload: Snapshot, wait_for_ack: bool) -> DispatchOutcome {
        self.dispatch(task_name, payload, wait_for_ack, self.default_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Publisher double that fails, hangs, or records
    struct StubPublisher {
        behaviour: Behaviour,
        sent: Mutex<Vec<(String, bool)>>,
    }

    enum Behaviour {
        Accept,
        Fail(PublishError),
        /// accepts immediately, but acks only after the delay
        SlowAck(Duration),
    }

    impl StubPublisher {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskPublisher for StubPublisher {
        async fn publish(&self, message: &TaskMessage, wait_for_ack: bool, _timeout: Duration) -> Result<(), PublishError> {
            self.sent.lock().push((message.task.clone(), wait_for_ack));
            match &self.behaviour {
                Behaviour::Accept => Ok(()),
                Behaviour::Fail(e) => Err(e.clone()),
                Behaviour::SlowAck(delay) => {
                    if wait_for_ack {
                        tokio::time::sleep(*delay).await;
                    }
                    Ok(())
                }
            }
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot::builder().field("device_id", "fd-1").build()
    }

    #[tokio::test]
    async fn test_ack_timeout_is_timeout_failure() {
        let client = DispatchClient::new(
            StubPublisher::new(Behaviour::SlowAck(Duration::from_secs(30))),
            Duration::from_secs(1),
        );
        let outcome = client
            .dispatch("device.update", snapshot(), true, Duration::from_millis(50))
            .await;
        assert_eq!(outcome, DispatchOutcome::TimeoutFailure);
    }

    #[tokio::test]
    async fn test_no_ack_returns_without_waiting() {
        let client = DispatchClient::new(
            StubPublisher::new(Behaviour::SlowAck(Duration::from_secs(30))),
            Duration::from_secs(1),
        );
        let started = std::time::Instant::now();
        let outcome = client.send("grainbin.update", snapshot(), false).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(client.publisher().sent.lock()[0], ("grainbin.update".to_string(), false));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let cases = [
            (PublishError::Operational("channel error".into()), DispatchOutcome::OperationalFailure),
            (PublishError::Timeout, DispatchOutcome::TimeoutFailure),
            (PublishError::ConnectionClosed("reset by peer".into()), DispatchOutcome::ConnectionFailure),
            (PublishError::Transport("bad frame".into()), DispatchOutcome::TransportFailure),
        ];
        for (error, expected) in cases {
            let client = DispatchClient::new(StubPublisher::new(Behaviour::Fail(error)), Duration::from_secs(1));
            assert_eq!(client.send("device.update", snapshot(), true).await, expected);
        }
    }

    #[tokio::test]
    async fn test_delivered_with_ack() {
        let client = DispatchClient::new(StubPublisher::new(Behaviour::Accept), Duration::from_secs(1));
        assert!(client.send("device.update", snapshot(), true).await.is_delivered());
    }

    #[test]
    fn test_task_message_envelope() {
        let message = TaskMessage::new("device.update", snapshot());
        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(json["task"], "device.update");
        assert_eq!(json["args"][0]["device_id"], "fd-1");
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_publisher_target() {
        let endpoint = Endpoint::new("10.0.0.1", &crate::config::BrokerConfig::default());
        let publisher = AmqpPublisher::new(endpoint, "", "celery", 30);
        assert_eq!(publisher.routing_key(), "celery");
        assert_eq!(publisher.target(), "10.0.0.1:5672");
    }

    #[test]
    fn test_properties_carry_task_headers() {
        let message = TaskMessage::new("grainbin.update", snapshot());
        let properties = properties(&message);
        let headers = properties.headers().as_ref().unwrap();
        assert!(headers.inner().keys().any(|key| key.as_str() == "task"));
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT));
    }
}
