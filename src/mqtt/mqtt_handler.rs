//! `rumqttc`-backed implementation of [`Broker`].
//!
//! The connection event loop runs in its own task. Callers queue requests on
//! the [`AsyncClient`] and wait on a oneshot that the event loop resolves when
//! the matching PUBACK/SUBACK arrives. Correlation works in two steps:
//!
//! ```text
//! try_publish ──► queued (FIFO) ──Outgoing::Publish(pkid)──► inflight[pkid] ──PubAck(pkid)──► caller
//! ```
//!
//! rumqttc drains its request channel in order, so the n-th outgoing packet
//! of a kind belongs to the n-th queued waiter of that kind.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerError, ConnectError, ConnectionEvent};
use super::config::{Endpoint, MqttConfig};
use super::message_manager::{MessageHandler, MessageRouter, OFFLINE_PAYLOAD};

const REQUEST_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 8;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type AckResult = Result<(), BrokerError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Pending {
    topic: String,
    ack: oneshot::Sender<AckResult>,
}

impl Pending {
    fn resolve(self, result: AckResult) {
        // The caller may have given up waiting.
        let _ = self.ack.send(result);
    }
}

/// Waiters for one packet kind (publish or subscribe).
#[derive(Default)]
struct AckQueue {
    queued: VecDeque<Pending>,
    inflight: HashMap<u16, Pending>,
}

impl AckQueue {
    fn sent(&mut self, pkid: u16) {
        if self.inflight.contains_key(&pkid) {
            debug!(pkid, "Retransmitted packet");
            return;
        }
        match self.queued.pop_front() {
            Some(pending) => {
                self.inflight.insert(pkid, pending);
            }
            None => debug!(pkid, "Outgoing packet without a waiter"),
        }
    }

    fn take(&mut self, pkid: u16) -> Option<Pending> {
        self.inflight.remove(&pkid)
    }

    fn fail_inflight(&mut self, error: fn() -> BrokerError) {
        for (_, pending) in self.inflight.drain() {
            pending.resolve(Err(error()));
        }
    }

    fn fail_all(&mut self, error: fn() -> BrokerError) {
        self.fail_inflight(error);
        for pending in self.queued.drain(..) {
            pending.resolve(Err(error()));
        }
    }
}

#[derive(Default)]
struct AckTracker {
    publishes: Mutex<AckQueue>,
    subscribes: Mutex<AckQueue>,
}

impl AckTracker {
    /// Registers a waiter and queues the request under the same lock so the
    /// FIFO order matches the request channel order.
    fn enqueue(
        queue: &Mutex<AckQueue>,
        topic: &str,
        send: impl FnOnce() -> Result<(), ClientError>,
    ) -> Result<oneshot::Receiver<AckResult>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut queue = lock(queue);
        queue.queued.push_back(Pending {
            topic: topic.to_string(),
            ack: tx,
        });
        if let Err(e) = send() {
            queue.queued.pop_back();
            return Err(e.into());
        }
        Ok(rx)
    }

    fn on_puback(&self, pkid: u16) {
        if let Some(pending) = lock(&self.publishes).take(pkid) {
            pending.resolve(Ok(()));
        }
    }

    fn on_suback(&self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some(pending) = lock(&self.subscribes).take(pkid) else {
            return;
        };
        if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            let topic = pending.topic.clone();
            pending.resolve(Err(BrokerError::SubscriptionRejected { topic }));
        } else {
            pending.resolve(Ok(()));
        }
    }

    /// rumqttc replays unacknowledged publishes under their original packet
    /// ids after every reconnect, so publish waiters stay in flight and the
    /// replay counts as a retransmission. Subscriptions are never replayed.
    fn on_reconnect(&self) {
        lock(&self.subscribes).fail_inflight(|| BrokerError::Disconnected);
    }

    fn close(&self) {
        lock(&self.publishes).fail_all(|| BrokerError::Closed);
        lock(&self.subscribes).fail_all(|| BrokerError::Closed);
    }
}

/// Owns the rumqttc event loop for the lifetime of the session.
struct ConnectionDriver {
    eventloop: EventLoop,
    broker: String,
    tracker: Arc<AckTracker>,
    router: Arc<MessageRouter>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
}

impl ConnectionDriver {
    async fn run(mut self) {
        debug!(broker = %self.broker, "Starting MQTT event loop");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!(broker = %self.broker, session_present = ack.session_present, "Reconnected to MQTT");
                    self.tracker.on_reconnect();
                    let event = ConnectionEvent::Reconnected {
                        session_present: ack.session_present,
                    };
                    // A pending notification already triggers a full resubscribe.
                    if let Err(e) = self.events.try_send(event) {
                        debug!("Reconnect notification not delivered: {}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!(topic = %publish.topic, "Received message");
                    self.router.dispatch(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Incoming::PubAck(ack))) => self.tracker.on_puback(ack.pkid),
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    self.tracker.on_suback(ack.pkid, &ack.return_codes)
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    lock(&self.tracker.publishes).sent(pkid)
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    lock(&self.tracker.subscribes).sent(pkid)
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(broker = %self.broker, "Disconnected from MQTT");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    error!(broker = %self.broker, error = %e, "MQTT connection error, retrying in {:?}", self.reconnect_delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
        self.tracker.close();
        debug!(broker = %self.broker, "MQTT event loop stopped");
    }
}

/// Client options for one session. Credentials are applied only when both
/// halves are configured.
fn mqtt_options(
    config: &MqttConfig,
    client_id: &str,
    will_topic: &str,
    endpoint: &Endpoint,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    options
        .set_keep_alive(config.keep_alive)
        .set_clean_session(true)
        .set_last_will(LastWill::new(
            will_topic,
            OFFLINE_PAYLOAD,
            QoS::AtLeastOnce,
            true,
        ));
    if let Some((username, password)) = config.credentials() {
        debug!(username, "Using MQTT credentials");
        options.set_credentials(username, password);
    }
    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Broker session over a single rumqttc client.
pub struct MqttHandler {
    client: AsyncClient,
    tracker: Arc<AckTracker>,
    router: Arc<MessageRouter>,
    driver: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MqttHandler {
    /// Opens the connection and waits for the broker's CONNACK.
    ///
    /// The last will publishes `offline` (retained) on `will_topic` if the
    /// session drops uncleanly. Later reconnects are reported on the returned
    /// receiver; the initial connection is not.
    pub async fn connect(
        config: &MqttConfig,
        client_id: &str,
        will_topic: &str,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), ConnectError> {
        let endpoint = config.endpoint()?;
        let broker = endpoint.to_string();

        let options = mqtt_options(config, client_id, will_topic, &endpoint);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        info!(broker = %broker, client_id, "Connecting to MQTT");
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!(broker = %broker, session_present = ack.session_present, "Connected to MQTT");
                    break;
                }
                Ok(event) => debug!(?event, "Event before connection acknowledgement"),
                Err(source) => return Err(ConnectError::Handshake { broker, source }),
            }
        }

        let tracker = Arc::new(AckTracker::default());
        let router = Arc::new(MessageRouter::new());
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let driver = ConnectionDriver {
            eventloop,
            broker,
            tracker: tracker.clone(),
            router: router.clone(),
            events: events_tx,
            cancel: cancel.clone(),
            reconnect_delay: config.reconnect_delay,
        };
        let handle = tokio::spawn(driver.run());

        Ok((
            Self {
                client,
                tracker,
                router,
                driver: Mutex::new(Some(handle)),
                cancel,
            },
            events_rx,
        ))
    }
}

#[async_trait]
impl Broker for MqttHandler {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        let ack = AckTracker::enqueue(&self.tracker.publishes, topic, || {
            self.client
                .try_publish(topic, QoS::AtLeastOnce, retain, payload)
        })?;
        ack.await.map_err(|_| BrokerError::Closed)?
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        // Route first: retained messages can follow the SUBACK immediately.
        self.router.register(topic, handler);
        let ack = AckTracker::enqueue(&self.tracker.subscribes, topic, || {
            self.client.try_subscribe(topic, QoS::AtLeastOnce)
        })?;
        ack.await.map_err(|_| BrokerError::Closed)?
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let result = self.client.disconnect().await.map_err(BrokerError::from);
        if result.is_err() {
            self.cancel.cancel();
        }

        let handle = lock(&self.driver).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time, cancelling");
                self.cancel.cancel();
            }
        }
        result
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
