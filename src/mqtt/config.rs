use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::duration_str;

const DEFAULT_BROKER: &str = "tcp://localhost:1883";
const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

/// Broker connection settings as read from the `[mqtt]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive", with = "duration_str")]
    pub keep_alive: Duration,
    /// Pause between reconnect attempts after the connection drops.
    #[serde(default = "default_reconnect_delay", with = "duration_str")]
    pub reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl MqttConfig {
    /// Credentials are only applied when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, EndpointError> {
        Endpoint::parse(&self.broker)
    }
}

fn default_broker() -> String {
    DEFAULT_BROKER.to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid broker URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported broker scheme `{0}` (expected tcp, mqtt, ssl, tls or mqtts)")]
    Scheme(String),

    #[error("broker URL has no host")]
    MissingHost,
}

/// Resolved broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Parses `scheme://host[:port]`, e.g. `tcp://localhost:1883`.
    pub fn parse(broker: &str) -> Result<Self, EndpointError> {
        let url = Url::parse(broker)?;
        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(EndpointError::Scheme(other.to_string())),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(EndpointError::MissingHost)?
            .to_string();
        let port = url.port().unwrap_or(if tls { TLS_PORT } else { PLAIN_PORT });
        Ok(Self { host, port, tls })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}
