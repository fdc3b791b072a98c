use async_trait::async_trait;
use thiserror::Error;

use super::config::EndpointError;
use super::message_manager::MessageHandler;

/// Failure of a single publish, subscribe or disconnect request.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request could not be queued: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("broker rejected subscription to {topic}")]
    SubscriptionRejected { topic: String },

    #[error("connection dropped before the broker acknowledged the request")]
    Disconnected,

    #[error("connection event loop is no longer running")]
    Closed,
}

/// Startup connection failure. Always fatal.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid broker address: {0}")]
    Address(#[from] EndpointError),

    #[error("connection to {broker} failed: {source}")]
    Handshake {
        broker: String,
        #[source]
        source: rumqttc::ConnectionError,
    },
}

/// Lifecycle notifications emitted by the transport after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Reconnected { session_present: bool },
}

/// Publish/subscribe surface the engine talks to.
///
/// Every call resolves only once the broker acknowledged the request (or it
/// failed). Publishes and subscriptions use at-least-once delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError>;

    /// Installs `handler` for messages arriving on `topic`, then subscribes.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
