use std::fmt;

use serde::Deserialize;
use thiserror::Error;

pub type ServiceId = String;
pub type DestinationName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => write!(f, "queue"),
            DestinationKind::Topic => write!(f, "topic"),
        }
    }
}

/// Policy governing when a delivered message counts as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum AckMode {
    /// Acknowledged by the broker on receipt, before the handler runs.
    #[default]
    Auto,
    /// Acknowledged explicitly after the handler returns without fault.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ConsumerType {
    #[default]
    Default,
    Durable,
    Shared,
}

/// Per-service destination record supplied by the registration source.
///
/// Mirrors the two recognized configuration shapes: a queue receiver or a
/// topic subscription with optional durability fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DestinationConfig {
    Queue {
        queue_name: String,
        #[serde(default)]
        message_selector: String,
        #[serde(default)]
        no_local: bool,
    },
    Topic {
        topic_name: String,
        #[serde(default)]
        message_selector: String,
        #[serde(default)]
        no_local: bool,
        #[serde(default)]
        consumer_type: ConsumerType,
        #[serde(default)]
        subscriber_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub ack_mode: AckMode,
    pub destination: DestinationConfig,
}

impl ServiceConfig {
    pub fn queue(queue_name: impl Into<String>) -> Self {
        ServiceConfig {
            ack_mode: AckMode::Auto,
            destination: DestinationConfig::Queue {
                queue_name: queue_name.into(),
                message_selector: String::new(),
                no_local: false,
            },
        }
    }

    pub fn topic(topic_name: impl Into<String>) -> Self {
        ServiceConfig {
            ack_mode: AckMode::Auto,
            destination: DestinationConfig::Topic {
                topic_name: topic_name.into(),
                message_selector: String::new(),
                no_local: false,
                consumer_type: ConsumerType::Default,
                subscriber_name: None,
            },
        }
    }

    pub fn durable_topic(
        topic_name: impl Into<String>,
        subscriber_name: impl Into<String>,
    ) -> Self {
        ServiceConfig {
            ack_mode: AckMode::Auto,
            destination: DestinationConfig::Topic {
                topic_name: topic_name.into(),
                message_selector: String::new(),
                no_local: false,
                consumer_type: ConsumerType::Durable,
                subscriber_name: Some(subscriber_name.into()),
            },
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        match &mut self.destination {
            DestinationConfig::Queue {
                message_selector, ..
            }
            | DestinationConfig::Topic {
                message_selector, ..
            } => *message_selector = selector.into(),
        }
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("services '{first}' and '{second}' both bind {kind} '{name}'")]
    ConflictingDestination {
        first: ServiceId,
        second: ServiceId,
        kind: DestinationKind,
        name: DestinationName,
    },
    #[error("required field '{field}' is missing or empty")]
    MissingRequiredField { field: &'static str },
    #[error("durable subscription on topic '{topic}' requires a subscriber name")]
    InvalidDurableSubscriptionConfig { topic: DestinationName },
}

/// Immutable descriptor a consumer session is built from.
///
/// Produced only through [`DestinationBinding::from_config`], so a binding
/// that exists has already passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationBinding {
    pub kind: DestinationKind,
    pub name: DestinationName,
    pub message_selector: String,
    pub no_local: bool,
    pub ack_mode: AckMode,
    pub consumer_type: ConsumerType,
    pub subscriber_name: Option<String>,
}

impl DestinationBinding {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ConfigError> {
        match &config.destination {
            DestinationConfig::Queue {
                queue_name,
                message_selector,
                no_local,
            } => {
                if queue_name.is_empty() {
                    return Err(ConfigError::MissingRequiredField {
                        field: "queue_name",
                    });
                }
                Ok(DestinationBinding {
                    kind: DestinationKind::Queue,
                    name: queue_name.clone(),
                    message_selector: message_selector.clone(),
                    no_local: *no_local,
                    ack_mode: config.ack_mode,
                    consumer_type: ConsumerType::Default,
                    subscriber_name: None,
                })
            }
            DestinationConfig::Topic {
                topic_name,
                message_selector,
                no_local,
                consumer_type,
                subscriber_name,
            } => {
                if topic_name.is_empty() {
                    return Err(ConfigError::MissingRequiredField {
                        field: "topic_name",
                    });
                }
                if *consumer_type == ConsumerType::Durable
                    && subscriber_name.as_ref().map_or(true, |name| name.is_empty())
                {
                    return Err(ConfigError::InvalidDurableSubscriptionConfig {
                        topic: topic_name.clone(),
                    });
                }
                Ok(DestinationBinding {
                    kind: DestinationKind::Topic,
                    name: topic_name.clone(),
                    message_selector: message_selector.clone(),
                    no_local: *no_local,
                    ack_mode: config.ack_mode,
                    consumer_type: *consumer_type,
                    subscriber_name: subscriber_name.clone(),
                })
            }
        }
    }

    pub fn is_shared(&self) -> bool {
        self.consumer_type == ConsumerType::Shared
    }

    /// Two bindings target the same broker destination.
    pub fn same_destination(&self, other: &DestinationBinding) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_builds_binding() {
        let config = ServiceConfig::queue("orders").with_ack_mode(AckMode::Client);
        let binding = DestinationBinding::from_config(&config).unwrap();
        assert_eq!(binding.kind, DestinationKind::Queue);
        assert_eq!(binding.name, "orders");
        assert_eq!(binding.ack_mode, AckMode::Client);
        assert_eq!(binding.subscriber_name, None);
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let config = ServiceConfig::queue("");
        assert_eq!(
            DestinationBinding::from_config(&config).unwrap_err(),
            ConfigError::MissingRequiredField {
                field: "queue_name"
            }
        );
    }

    #[test]
    fn durable_topic_without_subscriber_name_is_rejected() {
        let mut config = ServiceConfig::topic("alerts");
        if let DestinationConfig::Topic { consumer_type, .. } = &mut config.destination {
            *consumer_type = ConsumerType::Durable;
        }
        assert_eq!(
            DestinationBinding::from_config(&config).unwrap_err(),
            ConfigError::InvalidDurableSubscriptionConfig {
                topic: "alerts".to_string()
            }
        );
    }

    #[test]
    fn durable_topic_with_subscriber_name_is_accepted() {
        let config = ServiceConfig::durable_topic("alerts", "sub1");
        let binding = DestinationBinding::from_config(&config).unwrap();
        assert_eq!(binding.consumer_type, ConsumerType::Durable);
        assert_eq!(binding.subscriber_name.as_deref(), Some("sub1"));
    }

    #[test]
    fn same_destination_compares_kind_and_name() {
        let queue = DestinationBinding::from_config(&ServiceConfig::queue("orders")).unwrap();
        let topic = DestinationBinding::from_config(&ServiceConfig::topic("orders")).unwrap();
        assert!(!queue.same_destination(&topic));
        assert!(queue
            .same_destination(&DestinationBinding::from_config(&ServiceConfig::queue("orders")).unwrap()));
    }

    #[test]
    fn topic_config_parses_from_json() {
        let raw = r#"{
            "ack_mode": "Client",
            "destination": {
                "topic_name": "alerts",
                "consumer_type": "Durable",
                "subscriber_name": "sub1"
            }
        }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        let binding = DestinationBinding::from_config(&config).unwrap();
        assert_eq!(binding.kind, DestinationKind::Topic);
        assert_eq!(binding.ack_mode, AckMode::Client);
        assert_eq!(binding.consumer_type, ConsumerType::Durable);
    }

    #[test]
    fn queue_config_parses_with_defaults() {
        let raw = r#"{ "destination": { "queue_name": "orders" } }"#;
        let config: ServiceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.ack_mode, AckMode::Auto);
        let binding = DestinationBinding::from_config(&config).unwrap();
        assert_eq!(binding.message_selector, "");
        assert!(!binding.no_local);
    }
}
