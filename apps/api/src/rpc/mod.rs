//! PubSub Request-Response Adapter
//!
//! Turns the fire-and-forget bus into single-shot request/response calls.
//! Each call picks its own reply topic from a fresh v4 UUID, subscribes to
//! it before the command goes out, and unsubscribes on every exit path,
//! including the caller dropping the call future.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Broker, BusMessage, ConnectionState, MessageSink, SubscriptionGuard};
use crate::error::{DeviceError, DeviceResult};

/// What a call does when the broker connection is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Fail with `BrokerUnavailable` as soon as the connection drops
    #[default]
    FailFast,
    /// Keep waiting for the reply until the deadline
    Wait,
}

impl std::str::FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "failfast" => Ok(Self::FailFast),
            "wait" => Ok(Self::Wait),
            other => Err(format!(
                "unknown disconnect policy '{}' (expected 'fail-fast' or 'wait')",
                other
            )),
        }
    }
}

impl std::fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// One in-flight call. Owned by exactly one `call` and never shared.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: Uuid,
    pub command_topic: String,
    pub reply_topic: String,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    deadline: Instant,
}

impl PendingRequest {
    pub fn new(command_topic: &str, reply_prefix: &str, timeout: Duration) -> DeviceResult<Self> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            DeviceError::InvalidInput(format!("call timeout {:?} is out of range", timeout))
        })?;
        let correlation_id = Uuid::new_v4();
        Ok(Self {
            correlation_id,
            command_topic: command_topic.to_string(),
            reply_topic: format!("{}/{}", reply_prefix, correlation_id),
            created_at: Utc::now(),
            timeout,
            deadline,
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Command body with the correlation id and reply topic injected
    pub fn envelope(&self, payload: Value) -> Result<Vec<u8>, serde_json::Error> {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        body.insert(
            "mutationId".to_string(),
            Value::String(self.correlation_id.to_string()),
        );
        body.insert("replyTo".to_string(), Value::String(self.reply_topic.clone()));
        serde_json::to_vec(&Value::Object(body))
    }

    fn timeout_error(&self) -> DeviceError {
        DeviceError::Timeout {
            topic: self.command_topic.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }
}

/// Request/response client over the shared broker
#[derive(Clone)]
pub struct RpcClient {
    broker: Broker,
    policy: DisconnectPolicy,
}

impl RpcClient {
    pub fn new(broker: Broker, policy: DisconnectPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> DisconnectPolicy {
        self.policy
    }

    /// Publish `payload` to `command_topic` and wait for one reply under
    /// `reply_prefix`.
    ///
    /// Fails with `SubscribeError` (nothing published) if the reply topic
    /// cannot be subscribed, `Timeout` when no reply arrives in time and
    /// `BrokerUnavailable` when the connection is lost under the fail-fast
    /// policy.
    pub async fn call(
        &self,
        command_topic: &str,
        reply_prefix: &str,
        payload: Value,
        timeout: Duration,
    ) -> DeviceResult<BusMessage> {
        self.call_routed(command_topic, reply_prefix, payload, timeout, |_| {
            let (sink, mut replies) = mpsc::unbounded_channel();
            let reply = async move {
                replies.recv().await.ok_or_else(|| {
                    DeviceError::BrokerUnavailable("broker connection closed".to_string())
                })
            };
            (sink, reply)
        })
        .await
    }

    /// Like [`call`](Self::call), but `route` decides where the reply is
    /// delivered. It is handed the reply topic and returns the sink to
    /// subscribe it with plus the future that yields the outcome once the
    /// reply has been handled.
    pub async fn call_routed<F, W, T>(
        &self,
        command_topic: &str,
        reply_prefix: &str,
        payload: Value,
        timeout: Duration,
        route: F,
    ) -> DeviceResult<T>
    where
        F: FnOnce(&str) -> (MessageSink, W),
        W: Future<Output = DeviceResult<T>>,
    {
        let pending = PendingRequest::new(command_topic, reply_prefix, timeout)?;

        let state = self.broker.state();
        if self.policy == DisconnectPolicy::FailFast && !state.is_connected() {
            return Err(DeviceError::BrokerUnavailable(format!("broker is {}", state)));
        }

        let (sink, reply) = route(&pending.reply_topic);
        let subscribe = SubscriptionGuard::subscribe(&self.broker, &pending.reply_topic, sink);
        let _subscription = match tokio::time::timeout_at(pending.deadline, subscribe).await {
            Ok(Ok(guard)) => guard,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(pending.timeout_error()),
        };

        let outcome = self.exchange(&pending, payload, reply).await;
        match &outcome {
            Ok(_) => tracing::debug!(
                correlation_id = %pending.correlation_id,
                command_topic = %pending.command_topic,
                elapsed_ms = pending.elapsed_ms(),
                "Reply received"
            ),
            Err(e) => tracing::debug!(
                correlation_id = %pending.correlation_id,
                command_topic = %pending.command_topic,
                elapsed_ms = pending.elapsed_ms(),
                error = %e,
                "Call failed"
            ),
        }
        outcome
    }

    async fn exchange<W, T>(&self, pending: &PendingRequest, payload: Value, reply: W) -> DeviceResult<T>
    where
        W: Future<Output = DeviceResult<T>>,
    {
        let mut state = self.broker.watch_state();

        if self.policy == DisconnectPolicy::Wait {
            loop {
                let current = *state.borrow_and_update();
                if current.is_connected() {
                    break;
                }
                if current.is_shut_down() {
                    return Err(DeviceError::BrokerUnavailable(format!("broker is {}", current)));
                }
                match tokio::time::timeout_at(pending.deadline, state.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return Err(DeviceError::BrokerUnavailable("broker dropped".to_string()))
                    }
                    Err(_) => return Err(pending.timeout_error()),
                }
            }
        }

        let body = pending.envelope(payload)?;
        self.broker.publish(&pending.command_topic, body).await?;
        tracing::debug!(
            correlation_id = %pending.correlation_id,
            command_topic = %pending.command_topic,
            reply_topic = %pending.reply_topic,
            "Command published"
        );

        tokio::pin!(reply);
        loop {
            tokio::select! {
                biased;

                outcome = &mut reply => return outcome,
                _ = tokio::time::sleep_until(pending.deadline) => {
                    return Err(pending.timeout_error());
                }
                changed = state.changed(), if self.policy == DisconnectPolicy::FailFast => {
                    let current = match changed {
                        Ok(()) => *state.borrow_and_update(),
                        Err(_) => ConnectionState::Closed,
                    };
                    if !current.is_connected() {
                        return Err(DeviceError::BrokerUnavailable(format!(
                            "broker {} while waiting on '{}'",
                            current, pending.reply_topic
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const COMMAND: &str = "home/L1/command";
    const REPLY_PREFIX: &str = "home/L1/reply";

    /// Answer every command by echoing its correlation id to its reply topic
    async fn spawn_echo(broker: &Broker) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(COMMAND, tx).await.unwrap();
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let body: Value = serde_json::from_slice(&message.payload).unwrap();
                let reply_to = body["replyTo"].as_str().unwrap().to_string();
                let reply = json!({ "echo": body["mutationId"] });
                let _ = broker
                    .publish(&reply_to, serde_json::to_vec(&reply).unwrap())
                    .await;
            }
        });
    }

    #[test]
    fn test_envelope_injects_correlation() {
        let pending = PendingRequest::new(COMMAND, REPLY_PREFIX, Duration::from_secs(1)).unwrap();
        let body: Value =
            serde_json::from_slice(&pending.envelope(json!({ "id": "L1" })).unwrap()).unwrap();

        assert_eq!(body["id"], "L1");
        assert_eq!(body["mutationId"], pending.correlation_id.to_string());
        assert_eq!(body["replyTo"], pending.reply_topic);
        assert!(pending.reply_topic.starts_with("home/L1/reply/"));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "fail-fast".parse::<DisconnectPolicy>(),
            Ok(DisconnectPolicy::FailFast)
        );
        assert_eq!("WAIT".parse::<DisconnectPolicy>(), Ok(DisconnectPolicy::Wait));
        assert!("retry".parse::<DisconnectPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_call_resolves_and_unsubscribes() {
        let broker = Broker::in_memory();
        spawn_echo(&broker).await;
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let reply = rpc
            .call(COMMAND, REPLY_PREFIX, json!({}), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(reply.topic.starts_with("home/L1/reply/"));
        let body: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert!(body["echo"].is_string());
        // Only the echo responder's subscription remains
        assert_eq!(broker.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_call_times_out_without_reply() {
        let broker = Broker::in_memory();
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);
        let started = Instant::now();

        let result = rpc
            .call(COMMAND, REPLY_PREFIX, json!({}), Duration::from_millis(100))
            .await;

        assert_matches!(result, Err(DeviceError::Timeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_publishes_nothing() {
        let broker = Broker::in_memory();
        let controls = broker.in_memory_controls().unwrap();
        controls.reject_subscriptions(REPLY_PREFIX);
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let result = rpc
            .call(COMMAND, REPLY_PREFIX, json!({}), Duration::from_secs(1))
            .await;

        assert_matches!(result, Err(DeviceError::SubscribeError { .. }));
        assert_eq!(controls.published_count(), 0);
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_when_disconnected() {
        let broker = Broker::in_memory();
        broker.in_memory_controls().unwrap().simulate_disconnect();
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let result = rpc
            .call(COMMAND, REPLY_PREFIX, json!({}), Duration::from_secs(1))
            .await;

        assert_matches!(result, Err(DeviceError::BrokerUnavailable(_)));
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_unsubscribes() {
        let broker = Broker::in_memory();
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let mut call = tokio_test::task::spawn(rpc.call(
            COMMAND,
            REPLY_PREFIX,
            json!({}),
            Duration::from_secs(5),
        ));
        tokio_test::assert_pending!(call.poll());
        assert_eq!(broker.active_subscriptions(), 1);

        drop(call);
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_call_unsubscribes() {
        let broker = Broker::in_memory();
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::Wait);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            rpc.call(COMMAND, REPLY_PREFIX, json!({}), Duration::from_secs(5)),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_routed_reply_outcome() {
        let broker = Broker::in_memory();
        spawn_echo(&broker).await;
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let echoed = rpc
            .call_routed(COMMAND, REPLY_PREFIX, json!({}), Duration::from_secs(1), |_| {
                let (sink, mut replies) = mpsc::unbounded_channel::<BusMessage>();
                let reply = async move {
                    let message = replies.recv().await.unwrap();
                    let body: Value = serde_json::from_slice(&message.payload).unwrap();
                    Ok(body["echo"].as_str().unwrap().len())
                };
                (sink, reply)
            })
            .await
            .unwrap();

        assert_eq!(echoed, 36);
        assert_eq!(broker.active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_rejected() {
        let broker = Broker::in_memory();
        let rpc = RpcClient::new(broker.clone(), DisconnectPolicy::FailFast);

        let result = rpc
            .call(COMMAND, REPLY_PREFIX, json!({}), Duration::MAX)
            .await;

        assert_matches!(result, Err(DeviceError::InvalidInput(_)));
        assert_eq!(broker.in_memory_controls().unwrap().published_count(), 0);
    }
}
