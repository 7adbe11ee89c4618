// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application configuration.
//!
//! [`AppConfig`] is the declarative description of a device application:
//! broker address, identity, timing, topic templates, command schemas and
//! named subscriptions. Parsing the config *file* (YAML, TOML, ...) is the
//! host program's concern; this type only fixes the shape, so any
//! `serde`-capable format deserializes into it. Fields unknown to the
//! framework are ignored. The config is immutable once the application is
//! constructed.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::schema::SchemaNode;
use crate::topic;

/// Configuration for a device application.
///
/// # Examples
///
/// ```
/// use icsia_lib::AppConfig;
/// use serde_json::json;
///
/// let config: AppConfig = serde_json::from_value(json!({
///     "device_id": "motor1",
///     "broker_host": "192.168.1.50",
///     "command_schemas": {
///         "move": {
///             "target_position": {"x": 0.0, "y": 0.0, "z": 0.0},
///             "speed": {"default": 100},
///             "mode": "absolute",
///         },
///     },
/// }))
/// .unwrap();
///
/// assert_eq!(config.namespace, "icsia");
/// assert_eq!(config.command_filter(), "icsia/+/cmd/#");
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Topic namespace all devices share (first topic segment).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Identity of this device; used in outbound status/log topics.
    pub device_id: String,

    /// MQTT broker host name or address.
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    /// MQTT broker port.
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// Optional broker username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional broker password.
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Delay between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,

    /// Maximum reconnect attempts before giving up; −1 means retry
    /// forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i32,

    /// Minimum gap between two adjacent outbound publishes, in seconds.
    #[serde(default = "default_throttle_interval")]
    pub throttle_interval: f64,

    /// Period of the status publisher's wake-up timer, in seconds.
    #[serde(default = "default_status_publish_interval")]
    pub status_publish_interval: f64,

    /// When `true`, status is published on every timer wake even if
    /// nothing changed (keep-alive mode).
    #[serde(default)]
    pub keepalive_publishing: bool,

    /// Topic templates.
    #[serde(default)]
    pub topics: TopicConfig,

    /// Schema for each accepted command, by command name. Commands with
    /// no entry here are passed to their handler unvalidated.
    #[serde(default)]
    pub command_schemas: BTreeMap<String, SchemaNode>,

    /// Schema seeding the status snapshot.
    #[serde(default = "default_status_schema")]
    pub status_schema: SchemaNode,

    /// Named subscriptions: `name -> (topic pattern, callback name)`.
    #[serde(default)]
    pub subscriptions: BTreeMap<String, SubscriptionSpec>,
}

/// Topic templates; `{namespace}` and `{device_id}` are expanded at
/// startup. Ack and completion topics are protocol-fixed and derived per
/// inbound command instead.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    /// Subscription filter for inbound commands.
    #[serde(default = "default_command_filter")]
    pub command_filter: String,

    /// Topic for the retained status snapshot.
    #[serde(default = "default_status_topic")]
    pub status: String,

    /// Topic for published log records.
    #[serde(default = "default_logs_topic")]
    pub logs: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            command_filter: default_command_filter(),
            status: default_status_topic(),
            logs: default_logs_topic(),
        }
    }
}

/// One entry of `config.subscriptions`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Topic filter to subscribe to (may contain `+` and `#`).
    pub topic: String,

    /// Name of the callback this subscription routes to, resolved
    /// against the callbacks registered at startup.
    pub callback: String,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the
    /// device id.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            namespace: default_namespace(),
            device_id: device_id.into(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            throttle_interval: default_throttle_interval(),
            status_publish_interval: default_status_publish_interval(),
            keepalive_publishing: false,
            topics: TopicConfig::default(),
            command_schemas: BTreeMap::new(),
            status_schema: default_status_schema(),
            subscriptions: BTreeMap::new(),
        }
    }

    /// Sets the broker address.
    #[must_use]
    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.broker_host = host.into();
        self.broker_port = port;
        self
    }

    /// Sets the topic namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Adds a command schema.
    #[must_use]
    pub fn with_command_schema(mut self, command: impl Into<String>, schema: SchemaNode) -> Self {
        self.command_schemas.insert(command.into(), schema);
        self
    }

    /// Sets the status schema.
    #[must_use]
    pub fn with_status_schema(mut self, schema: SchemaNode) -> Self {
        self.status_schema = schema;
        self
    }

    /// Adds a named subscription.
    #[must_use]
    pub fn with_subscription(
        mut self,
        name: impl Into<String>,
        pattern: impl Into<String>,
        callback: impl Into<String>,
    ) -> Self {
        self.subscriptions.insert(
            name.into(),
            SubscriptionSpec {
                topic: pattern.into(),
                callback: callback.into(),
            },
        );
        self
    }

    /// Checks the configuration for errors that would make the
    /// application unable to run.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found. These errors are
    /// irrecoverable and abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::MissingDeviceId);
        }
        if self.namespace.is_empty()
            || self.namespace.contains(['/', '+', '#'])
        {
            return Err(ConfigError::InvalidNamespace(self.namespace.clone()));
        }
        for (field, value) in [
            ("reconnect_interval", self.reconnect_interval),
            ("status_publish_interval", self.status_publish_interval),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidInterval { field, value });
            }
        }
        if !self.throttle_interval.is_finite() || self.throttle_interval < 0.0 {
            return Err(ConfigError::InvalidInterval {
                field: "throttle_interval",
                value: self.throttle_interval,
            });
        }
        let command_filter = self.command_filter();
        if !topic::is_valid_filter(&command_filter) {
            return Err(ConfigError::InvalidTopicFilter(command_filter));
        }
        for spec in self.subscriptions.values() {
            if !topic::is_valid_filter(&spec.topic) {
                return Err(ConfigError::InvalidTopicFilter(spec.topic.clone()));
            }
        }
        Ok(())
    }

    /// Returns the command subscription filter with placeholders
    /// expanded.
    #[must_use]
    pub fn command_filter(&self) -> String {
        self.expand(&self.topics.command_filter)
    }

    /// Returns the status topic with placeholders expanded.
    #[must_use]
    pub fn status_topic(&self) -> String {
        self.expand(&self.topics.status)
    }

    /// Returns the log topic with placeholders expanded.
    #[must_use]
    pub fn logs_topic(&self) -> String {
        self.expand(&self.topics.logs)
    }

    /// Delay between reconnect attempts.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_interval)
    }

    /// Minimum gap between adjacent publishes.
    #[must_use]
    pub fn throttle(&self) -> Duration {
        Duration::from_secs_f64(self.throttle_interval)
    }

    /// Period of the status publisher timer.
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_publish_interval)
    }

    fn expand(&self, template: &str) -> String {
        template
            .replace("{namespace}", &self.namespace)
            .replace("{device_id}", &self.device_id)
    }
}

fn default_namespace() -> String {
    "icsia".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_interval() -> f64 {
    5.0
}

fn default_max_reconnect_attempts() -> i32 {
    -1
}

fn default_throttle_interval() -> f64 {
    0.1
}

fn default_status_publish_interval() -> f64 {
    30.0
}

fn default_status_schema() -> SchemaNode {
    SchemaNode::Any
}

fn default_command_filter() -> String {
    "{namespace}/+/cmd/#".to_string()
}

fn default_status_topic() -> String {
    "{namespace}/{device_id}/status/current".to_string()
}

fn default_logs_topic() -> String {
    "{namespace}/{device_id}/logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AppConfig = serde_json::from_value(json!({"device_id": "m"})).unwrap();
        assert_eq!(config.namespace, "icsia");
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.max_reconnect_attempts, -1);
        assert!(!config.keepalive_publishing);
        assert!((config.status_publish_interval - 30.0).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config: AppConfig = serde_json::from_value(json!({
            "device_id": "m",
            "tls_profile": "strict",
            "extra": {"nested": true},
        }))
        .unwrap();
        assert_eq!(config.device_id, "m");
    }

    #[test]
    fn topic_templates_expand() {
        let config = AppConfig::new("motor1").with_namespace("plant");
        assert_eq!(config.command_filter(), "plant/+/cmd/#");
        assert_eq!(config.status_topic(), "plant/motor1/status/current");
        assert_eq!(config.logs_topic(), "plant/motor1/logs");
    }

    #[test]
    fn empty_device_id_is_rejected() {
        let config = AppConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDeviceId)
        ));
    }

    #[test]
    fn namespace_with_wildcards_is_rejected() {
        let config = AppConfig::new("m").with_namespace("ic+sia");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn negative_throttle_is_rejected() {
        let mut config = AppConfig::new("m");
        config.throttle_interval = -0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval {
                field: "throttle_interval",
                ..
            })
        ));
    }

    #[test]
    fn bad_subscription_filter_is_rejected() {
        let config = AppConfig::new("m").with_subscription("acks", "icsia/#/ack", "on_ack");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopicFilter(_))
        ));
    }

    #[test]
    fn command_schemas_deserialize() {
        let config: AppConfig = serde_json::from_value(json!({
            "device_id": "m",
            "command_schemas": {
                "move": {"speed": {"default": 100}, "mode": "absolute"},
            },
            "status_schema": {"position": {"x": 0.0}},
        }))
        .unwrap();
        assert!(config.command_schemas.contains_key("move"));
        assert!(config.status_schema.is_mapping());
    }

    #[test]
    fn subscriptions_deserialize() {
        let config: AppConfig = serde_json::from_value(json!({
            "device_id": "orchestrator",
            "subscriptions": {
                "acks": {"topic": "icsia/+/status/ack", "callback": "on_ack"},
            },
        }))
        .unwrap();
        assert_eq!(
            config.subscriptions["acks"],
            SubscriptionSpec {
                topic: "icsia/+/status/ack".to_string(),
                callback: "on_ack".to_string(),
            }
        );
    }

    #[test]
    fn durations_convert() {
        let config = AppConfig::new("m");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.throttle(), Duration::from_millis(100));
        assert_eq!(config.status_interval(), Duration::from_secs(30));
    }
}
