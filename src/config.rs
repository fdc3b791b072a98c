//! Application configuration: TOML file, command line and `MQTT2CMD_*`
//! environment overrides.
//!
//! ```toml
//! app-id = "mqtt2cmd"
//! refresh-interval = "10s"
//!
//! [mqtt]
//! broker = "tcp://localhost:1883"
//! username = "hub"
//! password = "secret"
//!
//! [log]
//! path = "/var/log/mqtt2cmd/mqtt2cmd.log"
//!
//! [[switches]]
//! name = "porch"
//! turn_on = "porch-light on"
//! turn_off = "porch-light off"
//! get_state = "porch-light status"
//! refresh = "30s"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::controls::SwitchConfig;
use crate::logging::LogConfig;
use crate::mqtt::config::{EndpointError, MqttConfig};

pub const APP_NAME: &str = "mqtt2cmd";

/// Characters that would break the topic layout.
const RESERVED_TOPIC_CHARS: [char; 3] = ['/', '+', '#'];

#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about = "Expose shell commands as MQTT switches")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MQTT2CMD_CONFIG")]
    pub config: Option<PathBuf>,

    /// MQTT broker, e.g. tcp://localhost:1883
    #[arg(short = 'b', long = "mqtt-broker", env = "MQTT2CMD_MQTT_BROKER")]
    pub broker: Option<String>,

    /// MQTT username
    #[arg(long = "mqtt-username", env = "MQTT2CMD_MQTT_USERNAME")]
    pub username: Option<String>,

    /// MQTT password
    #[arg(long = "mqtt-password", env = "MQTT2CMD_MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Log file path
    #[arg(short = 'l', long = "log-path", env = "MQTT2CMD_LOG_PATH")]
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no configuration file given and no user config directory found")]
    NoConfigDir,

    #[error("invalid app-id {0:?}")]
    AppId(String),

    #[error("refresh-interval must be greater than zero")]
    RefreshInterval,

    #[error("mqtt keep-alive must be zero or at least one second")]
    KeepAlive,

    #[error("no switches configured")]
    NoSwitches,

    #[error("invalid switch name {0:?}")]
    SwitchName(String),

    #[error("duplicate switch name {0:?}")]
    DuplicateSwitch(String),

    #[error("switch {switch:?} has an empty {field} command")]
    EmptyCommand {
        switch: String,
        field: &'static str,
    },

    #[error(transparent)]
    Broker(#[from] EndpointError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    /// Root of every topic and prefix of the client ID.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Cadence of the refresh driver.
    #[serde(default = "default_refresh_interval", with = "duration_str")]
    pub refresh_interval: Duration,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub switches: Vec<SwitchConfig>,

    /// File the configuration was read from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_app_id() -> String {
    APP_NAME.to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(10)
}

impl AppConfig {
    /// Reads the file named on the command line (or the default location),
    /// applies overrides and validates the result.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_file().ok_or(ConfigError::NoConfigDir)?,
        };
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.log.path.is_none() {
            config.log.path = default_log_file();
        }
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(broker) = &cli.broker {
            self.mqtt.broker = broker.clone();
        }
        if let Some(username) = &cli.username {
            self.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &cli.password {
            self.mqtt.password = Some(password.clone());
        }
        if let Some(path) = &cli.log_path {
            self.log.path = Some(path.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_topic_segment(&self.app_id) {
            return Err(ConfigError::AppId(self.app_id.clone()));
        }
        self.mqtt.endpoint()?;
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::RefreshInterval);
        }
        let keep_alive = self.mqtt.keep_alive;
        if !keep_alive.is_zero() && keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::KeepAlive);
        }

        if self.switches.is_empty() {
            return Err(ConfigError::NoSwitches);
        }
        let mut seen = HashSet::new();
        for switch in &self.switches {
            if !is_topic_segment(&switch.name) {
                return Err(ConfigError::SwitchName(switch.name.clone()));
            }
            if !seen.insert(switch.name.as_str()) {
                return Err(ConfigError::DuplicateSwitch(switch.name.clone()));
            }
            for (field, command) in [
                ("turn_on", &switch.on_command),
                ("turn_off", &switch.off_command),
                ("get_state", &switch.query_command),
            ] {
                if command.trim().is_empty() {
                    return Err(ConfigError::EmptyCommand {
                        switch: switch.name.clone(),
                        field,
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_topic_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains(RESERVED_TOPIC_CHARS)
}

fn config_home() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

pub fn default_config_file() -> Option<PathBuf> {
    config_home().map(|dir| dir.join("config.toml"))
}

pub fn default_log_file() -> Option<PathBuf> {
    config_home().map(|dir| dir.join(format!("{}.log", APP_NAME)))
}

/// Serde adapter for durations written as `"30s"`, `"1m 30s"` or plain
/// seconds.
pub mod duration_str {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::Deserializer;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration such as \"30s\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(secs))
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Duration, E> {
            u64::try_from(secs)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            let value = value.trim();
            if value == "0" {
                return Ok(Duration::ZERO);
            }
            humantime::parse_duration(value).map_err(E::custom)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        app-id = "house"

        [mqtt]
        broker = "tcp://broker.lan:1884"
        username = "hub"

        [[switches]]
        name = "porch"
        turn_on = "porch on"
        turn_off = "porch off"
        get_state = "porch state"
        refresh = "1m 30s"

        [[switches]]
        name = "fan"
        turn_on = "fan on"
        turn_off = "fan off"
        get_state = "fan state"
    "#;

    fn parse(contents: &str) -> AppConfig {
        toml::from_str(contents).unwrap()
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once(APP_NAME).chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = parse(SAMPLE);
        assert_eq!(config.app_id, "house");
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.mqtt.broker, "tcp://broker.lan:1884");
        assert_eq!(config.mqtt.credentials(), None);
        assert_eq!(config.mqtt.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.switches.len(), 2);
        assert_eq!(config.switches[0].refresh_interval, Duration::from_secs(90));
        assert_eq!(config.switches[1].refresh_interval, Duration::ZERO);
        assert_eq!(config.switches[1].query_command, "fan state");
        config.validate().unwrap();
    }

    #[test]
    fn app_id_defaults_to_application_name() {
        let config = parse(
            r#"
            [[switches]]
            name = "a"
            turn_on = "x"
            turn_off = "y"
            get_state = "z"
            refresh = 15
            "#,
        );
        assert_eq!(config.app_id, "mqtt2cmd");
        assert_eq!(config.mqtt.broker, "tcp://localhost:1883");
        assert_eq!(config.switches[0].refresh_interval, Duration::from_secs(15));
    }

    #[test]
    fn rejects_bad_durations() {
        let result: Result<AppConfig, _> = toml::from_str("refresh-interval = \"soon\"");
        assert!(result.is_err());
    }

    #[test]
    fn validation_catches_topic_breaking_names() {
        let mut config = parse(SAMPLE);
        config.switches[1].name = "fan/attic".into();
        assert!(matches!(config.validate(), Err(ConfigError::SwitchName(_))));

        config.switches[1].name = "porch".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateSwitch(name)) if name == "porch"
        ));

        config.switches[1].name = "".into();
        assert!(matches!(config.validate(), Err(ConfigError::SwitchName(_))));
    }

    #[test]
    fn validation_requires_switches_and_commands() {
        let mut config = parse(SAMPLE);
        config.switches[0].off_command = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyCommand { field: "turn_off", .. })
        ));

        config.switches.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoSwitches)));
    }

    #[test]
    fn validation_checks_broker_and_app_id() {
        let mut config = parse(SAMPLE);
        config.mqtt.broker = "ftp://broker".into();
        assert!(matches!(config.validate(), Err(ConfigError::Broker(_))));

        let mut config = parse(SAMPLE);
        config.app_id = "home/automation".into();
        assert!(matches!(config.validate(), Err(ConfigError::AppId(_))));

        let mut config = parse(SAMPLE);
        config.refresh_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::RefreshInterval)));

        let mut config = parse(SAMPLE);
        config.mqtt.keep_alive = Duration::from_millis(500);
        assert!(matches!(config.validate(), Err(ConfigError::KeepAlive)));
    }

    #[test]
    fn command_line_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = cli(&[
            "-c",
            &path,
            "-b",
            "ssl://secure.lan",
            "--mqtt-password",
            "secret",
            "-l",
            "/tmp/bridge.log",
        ]);
        let config = AppConfig::load(&cli).unwrap();

        assert_eq!(config.mqtt.broker, "ssl://secure.lan");
        assert_eq!(config.mqtt.credentials(), Some(("hub", "secret")));
        assert_eq!(config.log.path, Some(PathBuf::from("/tmp/bridge.log")));
        assert_eq!(config.source, Some(file.path().to_path_buf()));
    }

    #[test]
    fn missing_file_is_read_error() {
        let cli = cli(&["--config", "/nonexistent/mqtt2cmd.toml"]);
        assert!(matches!(AppConfig::load(&cli), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[switches]\nname = ").unwrap();
        let cli = cli(&["--config", file.path().to_str().unwrap()]);
        assert!(matches!(AppConfig::load(&cli), Err(ConfigError::Parse { .. })));
    }
}
