//! One actor task per switch.
//!
//! Every mutation of a switch's cached state (inbound commands, refresh
//! polls) is a message to its actor, so decode → execute → publish → cache
//! runs to completion before the next message for the same switch. Actors of
//! different switches run independently.
//!
//! ```text
//! MQTT event loop ──deliver()──┐
//!                              ├──► [SwitchActor] ──► Executor
//! Refresh driver ──refresh()───┘          │
//!                                         └──► Broker (publish-if-changed)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::error::EngineError;
use crate::controls::{Executor, SwitchConfig};
use crate::mqtt::broker::Broker;
use crate::mqtt::message_manager::{
    availability_payload, parse_payload, state_payload, MessageHandler,
};
use crate::mqtt::topics::SwitchTopics;

const INBOX_CAPACITY: usize = 32;

/// Broker-visible view of a switch as last published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchRuntime {
    /// `None` until a state was published.
    pub cached_state: Option<bool>,
    /// `None` until an availability was published.
    pub cached_available: Option<bool>,
    pub last_polled: Option<Instant>,
}

impl SwitchRuntime {
    /// Poll while anything is still unknown, then every `refresh_interval`
    /// (never, if zero).
    pub fn needs_poll(&self, refresh_interval: Duration, now: Instant) -> bool {
        if self.cached_state.is_none() || self.cached_available.is_none() {
            return true;
        }
        if refresh_interval.is_zero() {
            return false;
        }
        match self.last_polled {
            Some(last) => now >= last + refresh_interval,
            None => true,
        }
    }
}

#[derive(Debug)]
enum SwitchMessage {
    Command {
        payload: Vec<u8>,
    },
    Refresh {
        now: Instant,
        respond_to: oneshot::Sender<bool>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SwitchRuntime>,
    },
}

struct SwitchActor {
    config: SwitchConfig,
    topics: SwitchTopics,
    runtime: SwitchRuntime,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn Executor>,
}

impl SwitchActor {
    fn new(
        config: SwitchConfig,
        topics: SwitchTopics,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            topics,
            runtime: SwitchRuntime::default(),
            broker,
            executor,
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SwitchMessage>) {
        debug!("Switch actor started");
        while let Some(message) = inbox.recv().await {
            match message {
                SwitchMessage::Command { payload } => {
                    if let Err(e) = self.handle_command(&payload).await {
                        log_failure(&e, "Switch command failed");
                    }
                }
                SwitchMessage::Refresh { now, respond_to } => {
                    let polled = self.refresh(now).await;
                    if respond_to.send(polled).is_err() {
                        debug!("Refresh requester went away");
                    }
                }
                SwitchMessage::Snapshot { respond_to } => {
                    if respond_to.send(self.runtime).is_err() {
                        debug!("Snapshot requester went away");
                    }
                }
            }
        }
        debug!("Switch actor stopped");
    }

    async fn handle_command(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        let on = parse_payload(payload)?;
        info!(payload = state_payload(on), "Received switch command");

        match self
            .executor
            .switch_on_off(self.config.command_for(on), on)
            .await
        {
            Ok(output) => {
                debug!(output = %output, "Executed switch command successfully");
                self.publish_state(on).await
            }
            Err(e) => {
                if let Err(publish) = self.publish_available(false).await {
                    log_failure(&publish, "Failed to publish availability");
                }
                Err(e.into())
            }
        }
    }

    /// Returns whether the switch was polled.
    async fn refresh(&mut self, now: Instant) -> bool {
        if !self.runtime.needs_poll(self.config.refresh_interval, now) {
            return false;
        }

        let report = self
            .executor
            .query_state(&self.config.query_command)
            .await;
        self.runtime.last_polled = Some(now);

        match &report.result {
            Ok(()) => debug!(state = report.state, output = %report.output, "Queried switch state"),
            Err(e) if !e.is_failure() => {
                info!(output = %report.output, "Switch reported off/unavailable")
            }
            Err(e) => error!(error = %e, output = %report.output, "Error querying switch state"),
        }

        if let Err(e) = self.publish_state(report.state).await {
            log_failure(&e, "Failed to publish state");
        }
        if let Err(e) = self.publish_available(report.ok()).await {
            log_failure(&e, "Failed to publish availability");
        }
        true
    }

    async fn publish_state(&mut self, state: bool) -> Result<(), EngineError> {
        if self.runtime.cached_state == Some(state) {
            return Ok(());
        }
        publish(&*self.broker, &self.topics.state, state_payload(state)).await?;
        self.runtime.cached_state = Some(state);
        Ok(())
    }

    async fn publish_available(&mut self, available: bool) -> Result<(), EngineError> {
        if self.runtime.cached_available == Some(available) {
            return Ok(());
        }
        publish(
            &*self.broker,
            &self.topics.available,
            availability_payload(available),
        )
        .await?;
        self.runtime.cached_available = Some(available);
        Ok(())
    }
}

async fn publish(broker: &dyn Broker, topic: &str, payload: &str) -> Result<(), EngineError> {
    broker
        .publish(topic, payload, true)
        .await
        .map_err(|source| EngineError::Publish {
            topic: topic.to_string(),
            source,
        })?;
    debug!(topic, payload, "Published to MQTT");
    Ok(())
}

fn log_failure(error: &EngineError, context: &str) {
    match error {
        EngineError::Executor(e) => error!(error = %e, output = e.output(), "{}", context),
        EngineError::InvalidPayload(e) => warn!(error = %e, "{}", context),
        other => error!(error = %other, "{}", context),
    }
}

/// Cloneable address of a running switch actor.
#[derive(Debug, Clone)]
pub struct SwitchHandle {
    name: Arc<str>,
    command_topic: Arc<str>,
    tx: mpsc::Sender<SwitchMessage>,
}

impl SwitchHandle {
    /// Spawns the actor owning `config`'s runtime state.
    pub fn spawn(
        config: SwitchConfig,
        topics: SwitchTopics,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let name: Arc<str> = config.name.as_str().into();
        let command_topic: Arc<str> = topics.command.as_str().into();
        let span = info_span!("switch", switch = %name);

        let actor = SwitchActor::new(config, topics, broker, executor);
        tokio::spawn(actor.run(rx).instrument(span));

        Self {
            name,
            command_topic,
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Hands an inbound set-command to the actor without waiting.
    pub fn deliver(&self, payload: &[u8]) {
        let message = SwitchMessage::Command {
            payload: payload.to_vec(),
        };
        if let Err(e) = self.tx.try_send(message) {
            error!(switch = %self.name, topic = %self.command_topic, "Dropping switch command: {}", e);
        }
    }

    /// Message handler bound to this switch only.
    pub fn message_handler(&self) -> MessageHandler {
        let handle = self.clone();
        Arc::new(move |payload: &[u8]| handle.deliver(payload))
    }

    /// Queues a refresh and returns a receiver reporting whether it polled.
    pub async fn request_refresh(
        &self,
        now: Instant,
    ) -> Result<oneshot::Receiver<bool>, EngineError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SwitchMessage::Refresh { now, respond_to })
            .await
            .map_err(|_| self.stopped())?;
        Ok(rx)
    }

    /// Current cached view, after all previously queued messages.
    pub async fn snapshot(&self) -> Result<SwitchRuntime, EngineError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SwitchMessage::Snapshot { respond_to })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> EngineError {
        EngineError::SwitchStopped(self.name.to_string())
    }
}
