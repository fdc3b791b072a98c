//! In-memory broker and scripted executor for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::controls::{Executor, ExecutorError, QueryReport};
use crate::mqtt::broker::{Broker, BrokerError};
use crate::mqtt::message_manager::MessageHandler;

/// Records every acknowledged publish and subscription.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<(String, String)>>,
    subscriptions: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    fail_publishes: AtomicBool,
    hang_publishes: AtomicBool,
    fail_subscribes: AtomicBool,
    disconnected: AtomicBool,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Publishes never get acknowledged while set.
    pub fn hang_publishes(&self, hang: bool) {
        self.hang_publishes.store(hang, Ordering::SeqCst);
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Simulates an inbound message. Returns false if nothing is subscribed.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self.handlers.lock().unwrap().get(topic).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BrokerError> {
        assert!(retain, "all bridge publishes are retained");
        if self.hang_publishes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        self.handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), handler);
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscriptionRejected {
                topic: topic.to_string(),
            });
        }
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Executor whose commands "exit" with scripted codes (default 0), following
/// the same exit-code convention as the shell executor.
#[derive(Default)]
pub struct ScriptedExecutor {
    exits: Mutex<HashMap<String, i32>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit(self, command: &str, code: i32) -> Self {
        self.set_exit(command, code);
        self
    }

    /// Every command sleeps this long between starting and exiting.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_exit(&self, command: &str, code: i32) {
        self.exits
            .lock()
            .unwrap()
            .insert(command.to_string(), code);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn run(&self, command: &str) -> i32 {
        self.calls.lock().unwrap().push(command.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.exits
            .lock()
            .unwrap()
            .get(command)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn switch_on_off(&self, command: &str, _on: bool) -> Result<String, ExecutorError> {
        match self.run(command).await {
            0 => Ok("done".to_string()),
            code => Err(ExecutorError::Exit {
                command: command.to_string(),
                code,
                output: "failed".to_string(),
            }),
        }
    }

    async fn query_state(&self, command: &str) -> QueryReport {
        let result = match self.run(command).await {
            0 => Ok(()),
            1 => Err(ExecutorError::Unavailable {
                command: command.to_string(),
                output: String::new(),
            }),
            code => Err(ExecutorError::Exit {
                command: command.to_string(),
                code,
                output: String::new(),
            }),
        };
        QueryReport {
            state: result.is_ok(),
            output: String::new(),
            result,
        }
    }
}
