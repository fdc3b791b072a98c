use std::time::Duration;

use serde::Deserialize;

use crate::config::duration_str;

/// A switch as declared in the `[[switches]]` configuration array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwitchConfig {
    /// Used verbatim in topic names.
    pub name: String,
    #[serde(rename = "turn_on")]
    pub on_command: String,
    #[serde(rename = "turn_off")]
    pub off_command: String,
    #[serde(rename = "get_state")]
    pub query_command: String,
    /// Zero disables periodic polling.
    #[serde(default, rename = "refresh", with = "duration_str")]
    pub refresh_interval: Duration,
}

impl SwitchConfig {
    pub fn command_for(&self, on: bool) -> &str {
        if on {
            &self.on_command
        } else {
            &self.off_command
        }
    }
}
