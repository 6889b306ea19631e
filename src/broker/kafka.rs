use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{FetchedRecord, OffsetMark, ProducedRecord, RecordSink, RecordSource};
use crate::config::BrokerOptions;
use crate::errors::BrokerError;

fn base_client_config(options: &BrokerOptions) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", options.bootstrap_servers.join(","));

    if let Some(security_protocol) = &options.security_protocol {
        config.set("security.protocol", security_protocol);
    }
    if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
        config.set("sasl.mechanisms", sasl_mechanisms);
    }
    if let Some(sasl_username) = &options.sasl_username {
        config.set("sasl.username", sasl_username);
    }
    if let Some(sasl_password) = &options.sasl_password {
        config.set("sasl.password", sasl_password);
    }
    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        config.set("ssl.ca.location", ssl_ca_location);
    }
    for (key, value) in &options.client_overrides {
        config.set(key, value);
    }
    config
}

/// Kafka consumer behind the [`RecordSource`] seam.
///
/// Auto-commit is disabled; the runtime owns commit timing through the
/// auto-mark ticker and shutdown.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(options: &BrokerOptions, group_id: &str) -> Result<Self, BrokerError> {
        let mut config = base_client_config(options);
        config
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                options.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(timeout) = options.session_timeout_ms {
            config.set("session.timeout.ms", timeout.to_string());
        }
        if let Some(heartbeat) = options.heartbeat_interval_ms {
            config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        let consumer: StreamConsumer =
            config.create().map_err(|err| BrokerError::ConsumerCreation {
                reason: err.to_string(),
            })?;

        Ok(Self { consumer })
    }

    fn convert_message(
        &self,
        message: &rdkafka::message::BorrowedMessage<'_>,
    ) -> FetchedRecord {
        let mut headers = HashMap::new();
        if let Some(header_map) = message.headers() {
            for header in header_map.iter() {
                if let Some(value) = header.value {
                    headers.insert(header.key.to_string(), value.to_vec());
                }
            }
        }

        FetchedRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            value: message.payload().map(|p| p.to_vec()),
            timestamp: message.timestamp().to_millis(),
            headers,
        }
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|err| BrokerError::Subscription {
                topics: topics.to_vec(),
                reason: err.to_string(),
            })?;
        info!(?topics, "subscribed to input topics");
        Ok(())
    }

    async fn recv(&self) -> Result<FetchedRecord, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|err| BrokerError::Fetch {
                reason: err.to_string(),
            })?;
        debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "fetched record"
        );
        Ok(self.convert_message(&message))
    }

    async fn commit(&self, marks: &[OffsetMark]) -> Result<(), BrokerError> {
        if marks.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for mark in marks {
            tpl.add_partition_offset(&mark.topic, mark.partition, Offset::Offset(mark.offset + 1))
                .map_err(|err| BrokerError::OffsetCommit {
                    reason: err.to_string(),
                })?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|err| BrokerError::OffsetCommit {
                reason: err.to_string(),
            })?;

        debug!(count = marks.len(), "committed offsets");
        Ok(())
    }
}

/// Kafka producer behind the [`RecordSink`] seam. The whole batch is
/// enqueued first, then every delivery is awaited, so a returned `Ok`
/// means the broker acknowledged each record.
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(options: &BrokerOptions) -> Result<Self, BrokerError> {
        let mut config = base_client_config(options);
        config.set("message.timeout.ms", "30000");

        let producer: FutureProducer =
            config.create().map_err(|err| BrokerError::ProducerCreation {
                reason: err.to_string(),
            })?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn produce_all(&self, records: &[ProducedRecord]) -> Result<(), BrokerError> {
        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            let future_record = FutureRecord::to(&record.topic)
                .partition(record.partition)
                .key(&record.key)
                .payload(&record.value);
            match self.producer.send_result(future_record) {
                Ok(delivery) => deliveries.push((record, delivery)),
                Err((err, _)) => {
                    return Err(BrokerError::Produce {
                        topic: record.topic.clone(),
                        reason: err.to_string(),
                    })
                }
            }
        }

        for (record, delivery) in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((err, _))) => {
                    return Err(BrokerError::Produce {
                        topic: record.topic.clone(),
                        reason: err.to_string(),
                    })
                }
                Err(_) => {
                    return Err(BrokerError::Produce {
                        topic: record.topic.clone(),
                        reason: "delivery canceled".to_string(),
                    })
                }
            }
        }

        debug!(count = records.len(), "produced batch");
        Ok(())
    }
}
