//! Broker session lifecycle with statum state machine
//!
//! ```text
//! connect() ──► Connected ──start()──► Ready ──shutdown()──► (disconnected)
//!                              │          ▲
//!                  online + subscribe_all │ reconnect: online + subscribe_all
//!                         (fatal)         │      (logged, non-fatal)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::error::EngineError;
use super::switch_actor::SwitchHandle;
use crate::config::AppConfig;
use crate::controls::{Executor, SwitchConfig};
use crate::mqtt::broker::{Broker, BrokerError, ConnectError, ConnectionEvent};
use crate::mqtt::message_manager::availability_payload;
use crate::mqtt::mqtt_handler::MqttHandler;
use crate::mqtt::topics::Topics;

/// Upper bound on waiting for the broker to acknowledge `offline` at shutdown.
const OFFLINE_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique per process so two instances never collide on the broker.
pub fn generate_client_id(app_id: &str) -> String {
    format!("{}-{:016x}", app_id, rand::random::<u64>())
}

/// Everything the on-connect sequence needs, shared with the reconnect watcher.
#[derive(Clone)]
struct Lifecycle {
    topics: Topics,
    broker: Arc<dyn Broker>,
    switches: Arc<[SwitchHandle]>,
}

impl Lifecycle {
    async fn announce(&self, online: bool) -> Result<(), EngineError> {
        let topic = self.topics.available();
        self.broker
            .publish(&topic, availability_payload(online), true)
            .await
            .map_err(|source| EngineError::Publish { topic, source })
    }

    /// Subscribes every switch's command topic, each with its own handler.
    /// Tries all switches and returns the first failure.
    async fn subscribe_all(&self) -> Result<(), EngineError> {
        let mut first_error = None;
        for switch in self.switches.iter() {
            let topic = switch.command_topic();
            debug!(switch = switch.name(), topic, "Subscribing");
            if let Err(source) = self.broker.subscribe(topic, switch.message_handler()).await {
                error!(switch = switch.name(), topic, error = %source, "Subscription failed");
                first_error.get_or_insert(EngineError::Subscribe {
                    topic: topic.to_string(),
                    source,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs on every reconnect. Failures are logged; the session stays
    /// degraded until the next reconnect.
    async fn on_connect(&self) {
        if let Err(e) = self.announce(true).await {
            error!(error = %e, "Failed to publish application availability");
        }
        if let Err(e) = self.subscribe_all().await {
            warn!(error = %e, "Resubscribe incomplete after reconnect");
        }
    }

    async fn watch(self, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Reconnected { session_present } => {
                    info!(session_present, "Session re-established, restoring subscriptions");
                    self.on_connect().await;
                }
            }
        }
        debug!("Connection event stream closed");
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Connected, // Transport up, nothing announced yet
    Ready,     // Online, subscribed, serving commands and refreshes
}

#[machine]
pub struct Session<S: SessionState> {
    client_id: String,
    lifecycle: Lifecycle,
    connection_events: Option<mpsc::Receiver<ConnectionEvent>>,
    watcher: Option<JoinHandle<()>>,
}

impl<S: SessionState> Session<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn app_id(&self) -> &str {
        self.lifecycle.topics.app_id()
    }

    /// Switch handles in configuration order.
    pub fn switches(&self) -> &[SwitchHandle] {
        &self.lifecycle.switches
    }
}

impl Session<Connected> {
    /// Connects to the configured broker. Failure is fatal; nothing retries.
    pub async fn connect(
        config: &AppConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, ConnectError> {
        let client_id = generate_client_id(&config.app_id);
        let topics = Topics::new(config.app_id.as_str());
        let (handler, events) =
            MqttHandler::connect(&config.mqtt, &client_id, &topics.available()).await?;

        Ok(Self::create(
            client_id,
            topics,
            Arc::new(handler),
            Some(events),
            &config.switches,
            executor,
        ))
    }

    /// Builds a session over an already connected broker and spawns one actor
    /// per switch, in configuration order.
    pub fn create(
        client_id: String,
        topics: Topics,
        broker: Arc<dyn Broker>,
        connection_events: Option<mpsc::Receiver<ConnectionEvent>>,
        switches: &[SwitchConfig],
        executor: Arc<dyn Executor>,
    ) -> Self {
        let handles: Vec<SwitchHandle> = switches
            .iter()
            .map(|config| {
                SwitchHandle::spawn(
                    config.clone(),
                    topics.switch(&config.name),
                    broker.clone(),
                    executor.clone(),
                )
            })
            .collect();
        info!(client_id = %client_id, switches = handles.len(), "Session created");

        Self::new(
            client_id,
            Lifecycle {
                topics,
                broker,
                switches: handles.into(),
            },
            connection_events,
            None, // watcher
        )
    }

    /// Startup on-connect: announce online, then subscribe every switch.
    /// A subscription failure here aborts startup.
    pub async fn start(mut self) -> Result<Session<Ready>, EngineError> {
        info!(client_id = %self.client_id, "Starting session");
        if let Err(e) = self.lifecycle.announce(true).await {
            error!(error = %e, "Failed to publish application availability");
        }
        self.lifecycle.subscribe_all().await?;

        if let Some(events) = self.connection_events.take() {
            let lifecycle = self.lifecycle.clone();
            self.watcher = Some(tokio::spawn(lifecycle.watch(events)));
        }

        info!(client_id = %self.client_id, "Session ready");
        Ok(self.transition())
    }
}

impl Session<Ready> {
    /// The on-connect sequence, as run on every reconnect.
    pub async fn on_connect(&self) {
        self.lifecycle.on_connect().await
    }

    pub async fn refresh_all(&self) -> usize {
        self.refresh_all_at(Instant::now()).await
    }

    /// Asks every switch to poll if due. Switches poll in parallel; returns
    /// how many actually queried their command.
    pub async fn refresh_all_at(&self, now: Instant) -> usize {
        let mut pending = Vec::with_capacity(self.lifecycle.switches.len());
        for switch in self.lifecycle.switches.iter() {
            match switch.request_refresh(now).await {
                Ok(rx) => pending.push((switch.name(), rx)),
                Err(e) => error!(switch = switch.name(), error = %e, "Refresh not queued"),
            }
        }

        let mut polled = 0;
        for (name, rx) in pending {
            match rx.await {
                Ok(true) => polled += 1,
                Ok(false) => {}
                Err(_) => warn!(switch = name, "Switch stopped during refresh"),
            }
        }
        debug!(polled, "Refresh cycle complete");
        polled
    }

    /// Refreshes every `every` until `shutdown` resolves. The first tick
    /// fires immediately and performs the initial poll of every switch. A
    /// refresh still waiting on the broker is abandoned on shutdown.
    pub async fn run_until_shutdown(&self, every: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = async {
                    ticker.tick().await;
                    self.refresh_all().await
                } => {}
            }
        }
    }

    /// Announces offline and disconnects cleanly.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        info!(client_id = %self.client_id, "Shutting down session");
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
        match tokio::time::timeout(OFFLINE_ANNOUNCE_TIMEOUT, self.lifecycle.announce(false)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to publish application availability"),
            Err(_) => warn!("Broker did not acknowledge offline announcement, disconnecting anyway"),
        }
        self.lifecycle.broker.disconnect().await
    }
}
