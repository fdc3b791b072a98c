//! Error definitions for the switch-synchronization engine

use thiserror::Error;

use crate::controls::ExecutorError;
use crate::mqtt::broker::BrokerError;
use crate::mqtt::message_manager::InvalidPayload;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Inbound set-command that is neither `ON` nor `OFF`
    #[error(transparent)]
    InvalidPayload(#[from] InvalidPayload),

    /// Publish failed; the cached value was left unchanged
    #[error("failed to publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: BrokerError,
    },

    /// Subscription failed (fatal only during startup)
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The switch's actor task has terminated
    #[error("switch {0} is no longer running")]
    SwitchStopped(String),
}
