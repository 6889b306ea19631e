use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::SerdeRegistry;
use crate::errors::ConfigError;
use crate::store::KeyValueStore;

/// Full configuration for one topic-processor container.
///
/// The serde registry and store backends are wired in code; the broker and
/// processing options are plain data and can be loaded from YAML.
#[derive(Clone)]
pub struct TopicProcessorConfig {
    /// Consumer-group identity and metrics prefix.
    pub name: String,
    pub input_topics: Vec<String>,
    pub serdes: SerdeRegistry,
    /// Total number of containers the partition space is divided over.
    pub container_count: u32,
    /// Static assignment of partition id to container id, applied uniformly
    /// to every input topic. Fixed for the container's lifetime.
    pub partition_to_container: HashMap<i32, u32>,
    /// How often each partition closes its batch and marked offsets are
    /// committed to the broker.
    pub auto_mark_offsets_interval: Duration,
    /// Store backends by name, shared process-wide. Each partition gets its
    /// own tracked handles onto these.
    pub stores: HashMap<String, Arc<dyn KeyValueStore>>,
    pub broker: BrokerOptions,
    pub processing: ProcessingOptions,
}

/// Broker client options, pass-through tuning included.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerOptions {
    pub bootstrap_servers: Vec<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    /// Applied verbatim to the underlying client config, after the options
    /// above.
    #[serde(default)]
    pub client_overrides: HashMap<String, String>,
}

impl BrokerOptions {
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: None,
            session_timeout_ms: None,
            heartbeat_interval_ms: None,
            client_overrides: HashMap::new(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::LoadFailed {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|err| ConfigError::LoadFailed {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let content =
            std::env::var("STREAMWORK_BROKER_CONFIG").map_err(|_| ConfigError::MissingField {
                field: "STREAMWORK_BROKER_CONFIG".to_string(),
            })?;
        serde_yaml::from_str(&content).map_err(|err| ConfigError::LoadFailed {
            path: "STREAMWORK_BROKER_CONFIG".to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Batch boundary: a partition closes its batch after this many records
    /// even if the auto-mark timer has not fired.
    pub batch_size: usize,
    /// Bounded retries for producer and store flushes inside the commit
    /// protocol.
    pub max_retries: u32,
    /// Base delay for the exponential backoff between retries.
    pub retry_delay_ms: u64,
    /// How long shutdown waits for in-flight work before force-closing.
    pub shutdown_timeout_ms: u64,
    /// Capacity of each partition's record queue.
    pub channel_capacity: usize,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            shutdown_timeout_ms: 30_000,
            channel_capacity: 256,
        }
    }
}

impl TopicProcessorConfig {
    /// Everything checkable before touching the broker. A missing serde for
    /// an input topic fails here, before any subscription.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "name".to_string(),
            });
        }
        if self.broker.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "broker.bootstrap_servers".to_string(),
            });
        }
        if self.input_topics.is_empty() {
            return Err(ConfigError::MissingField {
                field: "input_topics".to_string(),
            });
        }
        for topic in &self.input_topics {
            if !self.serdes.contains(topic) {
                return Err(ConfigError::MissingSerde {
                    topic: topic.clone(),
                });
            }
        }
        if self.container_count == 0 {
            return Err(ConfigError::Invalid {
                message: "container_count must be at least 1".to_string(),
            });
        }
        if self.partition_to_container.is_empty() {
            return Err(ConfigError::InvalidPartitionMap {
                reason: "no partitions mapped".to_string(),
            });
        }
        for (&partition, &container) in &self.partition_to_container {
            if partition < 0 {
                return Err(ConfigError::InvalidPartitionMap {
                    reason: format!("negative partition id {partition}"),
                });
            }
            if container >= self.container_count {
                return Err(ConfigError::InvalidPartitionMap {
                    reason: format!(
                        "partition {partition} mapped to container {container}, but container_count is {}",
                        self.container_count
                    ),
                });
            }
        }
        if self.auto_mark_offsets_interval.is_zero() {
            return Err(ConfigError::Invalid {
                message: "auto_mark_offsets_interval must be non-zero".to_string(),
            });
        }
        if self.processing.batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "processing.batch_size must be at least 1".to_string(),
            });
        }
        if self.processing.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "processing.channel_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The partition ids this container serves, in ascending order.
    pub fn assigned_partitions(&self, container_id: u32) -> Vec<i32> {
        let mut partitions: Vec<i32> = self
            .partition_to_container
            .iter()
            .filter(|(_, &container)| container == container_id)
            .map(|(&partition, _)| partition)
            .collect();
        partitions.sort_unstable();
        partitions
    }
}
