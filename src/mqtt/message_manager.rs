use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

pub const ON_PAYLOAD: &str = "ON";
pub const OFF_PAYLOAD: &str = "OFF";
pub const ONLINE_PAYLOAD: &str = "online";
pub const OFFLINE_PAYLOAD: &str = "offline";

/// Per-message callback bound to one subscription.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid payload: {0:?}")]
pub struct InvalidPayload(pub String);

/// Decodes a set-command. Only the exact literals `ON` and `OFF` are accepted.
pub fn parse_payload(payload: &[u8]) -> Result<bool, InvalidPayload> {
    match payload {
        b"ON" => Ok(true),
        b"OFF" => Ok(false),
        other => Err(InvalidPayload(String::from_utf8_lossy(other).into_owned())),
    }
}

pub fn state_payload(state: bool) -> &'static str {
    if state {
        ON_PAYLOAD
    } else {
        OFF_PAYLOAD
    }
}

pub fn availability_payload(available: bool) -> &'static str {
    if available {
        ONLINE_PAYLOAD
    } else {
        OFFLINE_PAYLOAD
    }
}

/// Routes inbound publishes to the handler registered for their topic.
///
/// Handlers must not block: they run on the connection event loop.
#[derive(Default)]
pub struct MessageRouter {
    routes: RwLock<HashMap<String, MessageHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `topic`, replacing any previous one.
    pub fn register(&self, topic: &str, handler: MessageHandler) {
        match self.routes.write() {
            Ok(mut routes) => {
                routes.insert(topic.to_string(), handler);
            }
            Err(poisoned) => {
                warn!("Route table lock poisoned, recovering");
                poisoned.into_inner().insert(topic.to_string(), handler);
            }
        }
    }

    /// Returns false when no handler is registered for `topic`.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = match self.routes.read() {
            Ok(routes) => routes.get(topic).cloned(),
            Err(poisoned) => poisoned.into_inner().get(topic).cloned(),
        };
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => {
                debug!(topic, "No route for inbound message");
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.routes.read().map(|routes| routes.len()).unwrap_or(0);
        f.debug_struct("MessageRouter").field("routes", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn decodes_only_exact_literals() {
        assert_eq!(parse_payload(b"ON"), Ok(true));
        assert_eq!(parse_payload(b"OFF"), Ok(false));
        for bad in [&b"on"[..], b"Off", b" ON", b"ON\n", b"", b"1", b"\xff\xfe"] {
            assert!(parse_payload(bad).is_err(), "{:?} must be rejected", bad);
        }
    }

    #[test]
    fn encodes_state_and_availability() {
        assert_eq!(state_payload(true), "ON");
        assert_eq!(state_payload(false), "OFF");
        assert_eq!(availability_payload(true), "online");
        assert_eq!(availability_payload(false), "offline");
    }

    #[test]
    fn dispatches_to_registered_route_only() {
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.register(
            "app/switches/a/set",
            Arc::new(move |payload: &[u8]| sink.lock().unwrap().push(payload.to_vec())),
        );

        assert!(router.dispatch("app/switches/a/set", b"ON"));
        assert!(!router.dispatch("app/switches/b/set", b"ON"));
        assert_eq!(*seen.lock().unwrap(), vec![b"ON".to_vec()]);
    }
}
