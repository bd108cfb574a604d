//! Scenario configuration.

use reclaim_context::ContextConfig;
use reclaim_poller::PollConfig;
use reclaim_types::{DEFAULT_IMAGE, HIGH_PRIORITY, LOW_PRIORITY};
use serde::{Deserialize, Serialize};

/// Knobs shared by every scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Container image of every task
    #[serde(default = "default_image")]
    pub image: String,

    /// Waits on queue status
    #[serde(default = "PollConfig::one_minute")]
    pub queue_poll: PollConfig,

    /// Waits on job and task readiness
    #[serde(default = "PollConfig::two_minutes")]
    pub task_poll: PollConfig,

    /// Waits on namespace and queue removal
    #[serde(default = "PollConfig::two_minutes")]
    pub teardown_poll: PollConfig,

    #[serde(default = "default_low_priority")]
    pub low_priority: i32,

    #[serde(default = "default_high_priority")]
    pub high_priority: i32,

    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            queue_poll: PollConfig::one_minute(),
            task_poll: PollConfig::two_minutes(),
            teardown_poll: PollConfig::two_minutes(),
            low_priority: default_low_priority(),
            high_priority: default_high_priority(),
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_low_priority() -> i32 {
    10
}

fn default_high_priority() -> i32 {
    10_000
}

fn default_namespace_prefix() -> String {
    "reclaim".to_string()
}

impl ScenarioConfig {
    /// Load defaults, then the optional file, then `RECLAIM_` variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `RECLAIM_TASK_POLL__TIMEOUT_MS=300000`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ScenarioConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RECLAIM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Context settings every scenario starts from.
    pub fn context(&self) -> ContextConfig {
        ContextConfig::new()
            .with_namespace_prefix(&self.namespace_prefix)
            .with_teardown_poll(self.teardown_poll)
    }

    /// [`context`](Self::context) plus the low and high priority classes.
    pub fn context_with_priorities(&self) -> ContextConfig {
        self.context()
            .with_priority_class(LOW_PRIORITY, self.low_priority)
            .with_priority_class(HIGH_PRIORITY, self.high_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ScenarioConfig::default();
        assert_eq!(config.image, "nginx:1.14");
        assert_eq!(config.queue_poll.timeout(), Duration::from_secs(60));
        assert_eq!(config.task_poll.timeout(), Duration::from_secs(120));
        assert_eq!(config.queue_poll.interval(), Duration::from_millis(100));
        assert!(config.low_priority < config.high_priority);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: ScenarioConfig = serde_json::from_str(
            r#"{ "image": "nginx:1.25", "task_poll": { "timeout_ms": 300000 } }"#,
        )
        .unwrap();
        assert_eq!(config.image, "nginx:1.25");
        assert_eq!(config.task_poll.timeout(), Duration::from_secs(300));
        assert_eq!(config.task_poll.interval(), Duration::from_millis(100));
        assert_eq!(config.namespace_prefix, "reclaim");
    }

    #[test]
    fn test_load_without_file() {
        let config = ScenarioConfig::load(None).unwrap();
        assert_eq!(config.namespace_prefix, "reclaim");
    }

    #[test]
    fn test_context_carries_priorities() {
        let config = ScenarioConfig::default();
        let ctx = config.context_with_priorities();
        assert_eq!(ctx.priority_classes.get(LOW_PRIORITY), Some(&10));
        assert_eq!(ctx.priority_classes.get(HIGH_PRIORITY), Some(&10_000));
        assert_eq!(ctx.teardown_poll, config.teardown_poll);
    }
}
