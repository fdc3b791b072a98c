//! Topic layout shared by the bridge and its subscribers.
//!
//! ```text
//! <app>/available                  retained  online | offline   (last will)
//! <app>/switches/<name>            retained  ON | OFF
//! <app>/switches/<name>/available  retained  online | offline
//! <app>/switches/<name>/set        inbound   ON | OFF
//! ```

/// Application-level topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    app_id: String,
}

impl Topics {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Application availability, also the last-will target.
    pub fn available(&self) -> String {
        format!("{}/available", self.app_id)
    }

    pub fn switch(&self, name: &str) -> SwitchTopics {
        let state = format!("{}/switches/{}", self.app_id, name);
        SwitchTopics {
            command: format!("{}/set", state),
            available: format!("{}/available", state),
            state,
        }
    }
}

/// Topics owned by a single switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTopics {
    pub command: String,
    pub state: String,
    pub available: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_exact_topic_surface() {
        let topics = Topics::new("mqtt2cmd");
        assert_eq!(topics.available(), "mqtt2cmd/available");

        let porch = topics.switch("porch");
        assert_eq!(porch.command, "mqtt2cmd/switches/porch/set");
        assert_eq!(porch.state, "mqtt2cmd/switches/porch");
        assert_eq!(porch.available, "mqtt2cmd/switches/porch/available");
    }

    #[test]
    fn distinct_switches_never_share_topics() {
        let topics = Topics::new("home");
        let a = topics.switch("lamp");
        let b = topics.switch("lamp2");
        assert_ne!(a.command, b.command);
        assert_ne!(a.state, b.state);
        assert_ne!(a.available, b.available);
    }
}
