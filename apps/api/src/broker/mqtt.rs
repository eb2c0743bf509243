//! MQTT backend built on rumqttc

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use prysmalight_shared_config::MqttConfig;
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::table::SubscriptionTable;
use super::{set_state, BrokerError, BrokerResult, ConnectionState, StateSender};

/// Capacity of the client request channel
const REQUEST_CAPACITY: usize = 64;

/// How long `close` waits for the disconnect packet to go out
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the broker to answer a SUBSCRIBE
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts at queueing a SUBSCRIBE while the request channel is full
const QUEUE_ATTEMPTS: u32 = 50;
const QUEUE_RETRY_DELAY: Duration = Duration::from_millis(20);

type Verdict = Result<(), String>;

pub(crate) struct MqttTransport {
    client: AsyncClient,
    requests: Arc<Requests>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect, retrying forever with a fixed delay, then hand the event
    /// loop to a background driver.
    pub(crate) async fn connect(
        config: &MqttConfig,
        table: SubscriptionTable,
        state: StateSender,
    ) -> Self {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            set_state(&state, ConnectionState::Connecting);
            tracing::info!(attempt, broker = %config.address(), "Connecting to MQTT broker");

            let (client, mut eventloop) = AsyncClient::new(options(config), REQUEST_CAPACITY);

            match await_connack(&mut eventloop).await {
                Ok(()) => {
                    tracing::info!(attempt, broker = %config.address(), "Connected to MQTT broker");
                    set_state(&state, ConnectionState::Connected);
                    let requests = Arc::new(Requests::default());
                    requests.restore(&client, &table.filters());

                    let shutdown = CancellationToken::new();
                    let driver = tokio::spawn(drive(
                        eventloop,
                        Driver {
                            client: client.clone(),
                            requests: Arc::clone(&requests),
                            table,
                            state,
                        },
                        config.reconnect_delay(),
                        shutdown.clone(),
                    ));

                    return Self {
                        client,
                        requests,
                        shutdown,
                        driver: Mutex::new(Some(driver)),
                    };
                }
                Err(e) => {
                    set_state(&state, ConnectionState::Disconnected);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        retry_in_secs = config.reconnect_delay_secs,
                        "MQTT connection failed, retrying"
                    );
                    tokio::time::sleep(config.reconnect_delay()).await;
                }
            }
        }
    }

    /// Subscribe `filter` and wait for the broker's SUBACK.
    ///
    /// A refusal from the broker fails with `BrokerError::Subscribe`.
    pub(crate) async fn subscribe(&self, filter: &str) -> BrokerResult<()> {
        let (reply, verdict) = oneshot::channel();
        let mut reply = Some(reply);

        let mut attempts = 0;
        while let Err(e) = self.requests.subscribe(&self.client, filter, &mut reply) {
            attempts += 1;
            if attempts >= QUEUE_ATTEMPTS {
                return Err(subscribe_error(filter, e.to_string()));
            }
            tokio::time::sleep(QUEUE_RETRY_DELAY).await;
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, verdict).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(subscribe_error(filter, reason)),
            Ok(Err(_)) => Err(subscribe_error(filter, "request dropped before SUBACK".to_string())),
            Err(_) => Err(subscribe_error(
                filter,
                format!("no SUBACK within {}s", SUBACK_TIMEOUT.as_secs()),
            )),
        }
    }

    pub(crate) fn unsubscribe(&self, filter: &str) {
        self.requests.unsubscribe(&self.client, filter);
    }

    pub(crate) async fn publish(&self, topic: &str, payload: Bytes) -> BrokerResult<()> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    pub(crate) async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = driver {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                tracing::warn!("MQTT event loop did not stop in time");
            }
        }
        self.shutdown.cancel();
        self.requests.abandon();
    }
}

fn subscribe_error(filter: &str, reason: String) -> BrokerError {
    BrokerError::Subscribe {
        filter: filter.to_string(),
        reason,
    }
}

/// A SUBSCRIBE waiting for the broker's answer
struct PendingAck {
    filter: String,
    /// `None` for subscriptions restored after a reconnect, which only log
    reply: Option<oneshot::Sender<Verdict>>,
}

/// Bookkeeping for requests handed to the rumqttc client.
///
/// rumqttc assigns packet ids when it sends a request, in the order the
/// requests were queued. Queueing and recording happen under one lock, so
/// the n-th queued SUBSCRIBE is the n-th `Outgoing::Subscribe` event.
#[derive(Default)]
struct Requests {
    inner: Mutex<RequestsInner>,
}

#[derive(Default)]
struct RequestsInner {
    queued: VecDeque<PendingAck>,
    in_flight: HashMap<u16, PendingAck>,
    /// Sent before the connection dropped; re-attached on restore
    orphaned: Vec<PendingAck>,
    /// UNSUBSCRIBEs that did not fit in the request channel
    unsent: Vec<String>,
}

impl Requests {
    fn lock(&self) -> MutexGuard<'_, RequestsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a SUBSCRIBE. `reply` is only taken once it is queued.
    fn subscribe(
        &self,
        client: &AsyncClient,
        filter: &str,
        reply: &mut Option<oneshot::Sender<Verdict>>,
    ) -> Result<(), ClientError> {
        let mut inner = self.lock();
        client.try_subscribe(filter, QoS::AtLeastOnce)?;
        inner.unsent.retain(|unsent| unsent != filter);
        inner.queued.push_back(PendingAck {
            filter: filter.to_string(),
            reply: reply.take(),
        });
        Ok(())
    }

    /// Re-issue the bus subscription of every active filter
    fn restore(&self, client: &AsyncClient, filters: &[String]) {
        let mut inner = self.lock();
        let mut orphaned = std::mem::take(&mut inner.orphaned);
        if !filters.is_empty() {
            tracing::info!(count = filters.len(), "Restoring subscriptions");
        }

        for filter in filters {
            let reply = orphaned
                .iter()
                .position(|pending| &pending.filter == filter)
                .and_then(|index| orphaned.swap_remove(index).reply);
            match client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                Ok(()) => {
                    inner.unsent.retain(|unsent| unsent != filter);
                    inner.queued.push_back(PendingAck {
                        filter: filter.clone(),
                        reply,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, filter = %filter, "Failed to restore subscription");
                }
            }
        }
    }

    fn unsubscribe(&self, client: &AsyncClient, filter: &str) {
        let mut inner = self.lock();
        if let Err(e) = client.try_unsubscribe(filter) {
            tracing::debug!(error = %e, filter, "MQTT unsubscribe deferred");
            if !inner.unsent.iter().any(|unsent| unsent == filter) {
                inner.unsent.push(filter.to_string());
            }
        }
    }

    /// Retry deferred UNSUBSCRIBEs for filters nobody registered again
    fn flush_unsubscribes(&self, client: &AsyncClient, table: &SubscriptionTable) {
        let mut inner = self.lock();
        if inner.unsent.is_empty() {
            return;
        }

        let mut remaining = Vec::new();
        for filter in std::mem::take(&mut inner.unsent) {
            if table.count(&filter) > 0 {
                continue;
            }
            if !remaining.is_empty() || client.try_unsubscribe(filter.clone()).is_err() {
                remaining.push(filter);
            }
        }
        inner.unsent = remaining;
    }

    /// The event loop assigned `pkid` to the oldest queued SUBSCRIBE
    fn sent(&self, pkid: u16) {
        let mut inner = self.lock();
        match inner.queued.pop_front() {
            Some(pending) => {
                inner.in_flight.insert(pkid, pending);
            }
            None => tracing::debug!(pkid, "SUBSCRIBE sent that was not queued here"),
        }
    }

    fn acked(&self, ack: &SubAck) {
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let Some(pending) = self.lock().in_flight.remove(&ack.pkid) else {
            if refused {
                tracing::warn!(pkid = ack.pkid, "Broker rejected a subscription");
            }
            return;
        };

        let verdict = if refused {
            Err("refused by broker".to_string())
        } else {
            Ok(())
        };
        match pending.reply {
            Some(reply) => {
                // The subscriber may have given up already
                let _ = reply.send(verdict);
            }
            None if refused => {
                tracing::warn!(filter = %pending.filter, "Broker refused to restore a subscription");
            }
            None => {}
        }
    }

    /// The connection dropped; SUBSCRIBEs already sent will not be acked
    fn orphan_in_flight(&self) {
        let mut inner = self.lock();
        let in_flight: Vec<PendingAck> = inner.in_flight.drain().map(|(_, pending)| pending).collect();
        inner.orphaned.extend(in_flight);
    }

    /// Drop every waiter; they resolve as failed subscribes
    fn abandon(&self) {
        let mut inner = self.lock();
        inner.queued.clear();
        inner.in_flight.clear();
        inner.orphaned.clear();
        inner.unsent.clear();
    }
}

fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// What the event loop driver updates
struct Driver {
    client: AsyncClient,
    requests: Arc<Requests>,
    table: SubscriptionTable,
    state: StateSender,
}

impl Driver {
    /// Handle one event; returns false once the disconnect went out
    fn handle(&self, event: Event, reconnects: &mut u32) -> bool {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                self.table.dispatch(&publish.topic, publish.payload);
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                tracing::info!(attempts = *reconnects, "Reconnected to MQTT broker");
                *reconnects = 0;
                set_state(&self.state, ConnectionState::Connected);
                self.requests.restore(&self.client, &self.table.filters());
            }
            Event::Incoming(Packet::SubAck(ack)) => self.requests.acked(&ack),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => self.requests.sent(pkid),
            Event::Outgoing(Outgoing::Disconnect) => {
                tracing::debug!("Disconnect sent");
                return false;
            }
            _ => {}
        }
        self.requests.flush_unsubscribes(&self.client, &self.table);
        true
    }

    fn connection_lost(&self) {
        self.requests.orphan_in_flight();
        set_state(&self.state, ConnectionState::Disconnected);
    }
}

/// Poll the event loop until shutdown.
///
/// Connection errors re-enter the fixed-delay retry cycle; the next poll
/// reconnects and a fresh ConnAck restores every active filter.
async fn drive(mut eventloop: EventLoop, driver: Driver, delay: Duration, shutdown: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(event) => {
                if !driver.handle(event, &mut failures) {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    tracing::warn!(error = %e, "Lost connection to MQTT broker");
                } else {
                    tracing::warn!(error = %e, attempt = failures, "MQTT reconnect failed");
                }
                driver.connection_lost();

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                set_state(&driver.state, ConnectionState::Connecting);
            }
        }
    }

    tracing::debug!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::sync::{mpsc, watch};

    /// A transport whose client is never connected; tests play the event
    /// loop's part by hand
    fn offline(capacity: usize) -> (MqttTransport, Driver, EventLoop) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("prysmalight-test", "localhost", 1883), capacity);
        let requests = Arc::new(Requests::default());
        let (state, _) = watch::channel(ConnectionState::Connected);
        let driver = Driver {
            client: client.clone(),
            requests: Arc::clone(&requests),
            table: SubscriptionTable::default(),
            state: Arc::new(state),
        };
        let transport = MqttTransport {
            client,
            requests,
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
        };
        (transport, driver, eventloop)
    }

    fn suback(pkid: u16, code: SubscribeReasonCode) -> Event {
        Event::Incoming(Packet::SubAck(SubAck::new(pkid, vec![code])))
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(rumqttc::ConnAck::new(
            rumqttc::ConnectReturnCode::Success,
            false,
        )))
    }

    fn granted() -> SubscribeReasonCode {
        SubscribeReasonCode::Success(QoS::AtLeastOnce)
    }

    #[test]
    fn test_options_from_config() {
        let config = MqttConfig {
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ..MqttConfig::default()
        };
        let options = options(&config);

        assert_eq!(options.client_id(), config.client_id);
        assert!(options.clean_session());
        assert_eq!(options.keep_alive(), config.keep_alive());
        assert!(options.credentials().is_some());
    }

    #[tokio::test]
    async fn test_refused_subscribe_fails_the_caller() {
        let (transport, driver, _eventloop) = offline(8);
        let mut reconnects = 0;

        let mut subscribe = tokio_test::task::spawn(transport.subscribe("prysmalight/L1/reply/#"));
        tokio_test::assert_pending!(subscribe.poll());

        driver.handle(Event::Outgoing(Outgoing::Subscribe(1)), &mut reconnects);
        driver.handle(suback(1, SubscribeReasonCode::Failure), &mut reconnects);

        assert_matches!(
            tokio_test::assert_ready!(subscribe.poll()),
            Err(BrokerError::Subscribe { filter, .. }) => {
                assert_eq!(filter, "prysmalight/L1/reply/#");
            }
        );
    }

    #[tokio::test]
    async fn test_restored_subscriptions_keep_packet_order() {
        let (transport, driver, _eventloop) = offline(8);
        let (sink, _messages) = mpsc::unbounded_channel();
        driver.table.insert("prysmalight/+/+", sink);
        let mut reconnects = 3;

        // A reconnect restores the tracked pattern before the new request
        driver.handle(connack(), &mut reconnects);
        assert_eq!(reconnects, 0);
        let mut subscribe = tokio_test::task::spawn(transport.subscribe("prysmalight/L1/reply/a"));
        tokio_test::assert_pending!(subscribe.poll());

        driver.handle(Event::Outgoing(Outgoing::Subscribe(1)), &mut reconnects);
        driver.handle(Event::Outgoing(Outgoing::Subscribe(2)), &mut reconnects);
        driver.handle(suback(2, granted()), &mut reconnects);
        assert_matches!(tokio_test::assert_ready!(subscribe.poll()), Ok(()));

        // A refused restore is only logged
        driver.handle(suback(1, SubscribeReasonCode::Failure), &mut reconnects);
        assert!(transport.requests.lock().in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_survives_a_dropped_connection() {
        let (transport, driver, _eventloop) = offline(8);
        let (sink, _messages) = mpsc::unbounded_channel();
        driver.table.insert("prysmalight/L1/+", sink);
        let mut reconnects = 0;

        let mut subscribe = tokio_test::task::spawn(transport.subscribe("prysmalight/L1/+"));
        tokio_test::assert_pending!(subscribe.poll());
        driver.handle(Event::Outgoing(Outgoing::Subscribe(1)), &mut reconnects);

        driver.connection_lost();
        assert_eq!(*driver.state.borrow(), ConnectionState::Disconnected);
        tokio_test::assert_pending!(subscribe.poll());

        driver.handle(connack(), &mut reconnects);
        driver.handle(Event::Outgoing(Outgoing::Subscribe(2)), &mut reconnects);
        driver.handle(suback(2, granted()), &mut reconnects);

        assert_matches!(tokio_test::assert_ready!(subscribe.poll()), Ok(()));
    }

    #[tokio::test]
    async fn test_close_releases_waiting_subscribers() {
        let (transport, _driver, _eventloop) = offline(8);

        let mut subscribe = tokio_test::task::spawn(transport.subscribe("prysmalight/L1/+"));
        tokio_test::assert_pending!(subscribe.poll());
        transport.requests.abandon();

        assert_matches!(
            tokio_test::assert_ready!(subscribe.poll()),
            Err(BrokerError::Subscribe { .. })
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_retried_when_the_queue_drains() {
        let (transport, driver, mut eventloop) = offline(1);
        transport
            .client
            .try_publish("prysmalight/L1/command", QoS::AtLeastOnce, false, "{}")
            .unwrap();

        transport.unsubscribe("prysmalight/L1/reply/a");
        transport.unsubscribe("prysmalight/L2/+");
        assert_eq!(transport.requests.lock().unsent.len(), 2);

        // L2 is registered again before the queue drains; it must stay
        let (sink, _messages) = mpsc::unbounded_channel();
        driver.table.insert("prysmalight/L2/+", sink);
        eventloop.clean();
        driver.handle(Event::Outgoing(Outgoing::PingReq), &mut 0);
        assert!(transport.requests.lock().unsent.is_empty());

        // The publish plus the one UNSUBSCRIBE that still applies
        eventloop.clean();
        assert_eq!(eventloop.pending.len(), 2);
    }
}
