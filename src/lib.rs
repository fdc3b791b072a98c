//! Bridges MQTT to shell commands: every configured switch gets a state
//! topic, an availability topic and a set-command topic.

pub mod config;
pub mod controls;
pub mod engine;
pub mod logging;
pub mod mqtt;

#[cfg(test)]
pub(crate) mod testing;
