use std::sync::Arc;

use tracing::debug;

use crate::broker::{ProducedRecord, RecordSink};
use crate::codec::SerdeRegistry;
use crate::errors::{ProcessorError, Result, SerdeError};
use crate::message::OutgoingMessage;

/// The outgoing side of a partition processor, handed to user code.
///
/// `send` is buffer-append only: the message is serialized through the
/// output topic's serde and queued; nothing touches the wire until the
/// commit protocol flushes the batch. Senders are per-partition
/// capabilities and must never be shared across partitions.
pub struct Sender {
    registry: Arc<SerdeRegistry>,
    buffer: Vec<ProducedRecord>,
}

impl Sender {
    pub(crate) fn new(registry: Arc<SerdeRegistry>) -> Self {
        Self {
            registry,
            buffer: Vec::new(),
        }
    }

    /// Serializes the message and appends it to the outgoing buffer. A
    /// missing serde for the output topic or an encode failure indicates a
    /// mismatch between the user's domain type and the registry, and is
    /// fatal to the container.
    pub fn send(&mut self, message: OutgoingMessage) -> Result<()> {
        let serde = self
            .registry
            .lookup(&message.topic)
            .ok_or_else(|| SerdeError::UnknownTopic {
                topic: message.topic.clone(),
            })?;

        let key = serde.key.encode(&message.key)?;
        let value = serde.value.encode(&message.value)?;

        self.buffer.push(ProducedRecord {
            topic: message.topic,
            partition: message.partition,
            key,
            value,
        });
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drains the buffer as one batch and waits for every acknowledgment.
    /// On failure the buffer is retained unchanged so a retry resends the
    /// exact same set; broker-side duplicates are tolerated.
    pub(crate) async fn flush(&mut self, sink: &dyn RecordSink) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        sink.produce_all(&self.buffer)
            .await
            .map_err(ProcessorError::Broker)?;
        debug!(count = self.buffer.len(), "flushed outgoing buffer");
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::codec::TopicSerde;
    use crate::errors::BrokerError;
    use crate::message::Value;

    struct VecSink {
        produced: Mutex<Vec<ProducedRecord>>,
        failures_remaining: AtomicUsize,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                produced: Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(0),
            }
        }

        fn failing(times: usize) -> Self {
            let sink = Self::new();
            sink.failures_remaining.store(times, Ordering::SeqCst);
            sink
        }

        fn produced(&self) -> Vec<ProducedRecord> {
            self.produced.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn produce_all(
            &self,
            records: &[ProducedRecord],
        ) -> std::result::Result<(), BrokerError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(BrokerError::Produce {
                    topic: records[0].topic.clone(),
                    reason: "broker unavailable".to_string(),
                });
            }
            self.produced.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn registry() -> Arc<SerdeRegistry> {
        let mut registry = SerdeRegistry::new();
        registry.register("word-counts", TopicSerde::string_json());
        Arc::new(registry)
    }

    fn outgoing(word: &str, count: u64) -> OutgoingMessage {
        OutgoingMessage {
            topic: "word-counts".to_string(),
            partition: 0,
            key: Value::Text(word.to_string()),
            value: Value::Json(serde_json::json!({"word": word, "count": count})),
        }
    }

    #[test]
    fn send_serializes_into_the_buffer() {
        let mut sender = Sender::new(registry());
        sender.send(outgoing("fox", 1)).unwrap();
        sender.send(outgoing("dog", 1)).unwrap();

        assert_eq!(sender.pending(), 2);
        assert_eq!(sender.buffer[0].key, b"fox".to_vec());
        let value: serde_json::Value = serde_json::from_slice(&sender.buffer[0].value).unwrap();
        assert_eq!(value["count"], 1);
    }

    #[test]
    fn send_to_unregistered_topic_fails() {
        let mut sender = Sender::new(registry());
        let message = OutgoingMessage {
            topic: "unknown".to_string(),
            partition: 0,
            key: Value::Text("k".to_string()),
            value: Value::Text("v".to_string()),
        };
        let err = sender.send(message).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Serde(SerdeError::UnknownTopic { .. })
        ));
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn send_with_mismatched_value_fails() {
        let mut sender = Sender::new(registry());
        let message = OutgoingMessage {
            topic: "word-counts".to_string(),
            partition: 0,
            key: Value::Text("k".to_string()),
            // Registry expects a JSON value here.
            value: Value::Bytes(vec![1, 2, 3]),
        };
        let err = sender.send(message).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Serde(SerdeError::Encode { .. })
        ));
    }

    #[tokio::test]
    async fn flush_drains_the_buffer_in_order() {
        let mut sender = Sender::new(registry());
        sender.send(outgoing("the", 1)).unwrap();
        sender.send(outgoing("quick", 1)).unwrap();

        let sink = VecSink::new();
        sender.flush(&sink).await.unwrap();

        assert_eq!(sender.pending(), 0);
        let produced = sink.produced();
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].key, b"the".to_vec());
        assert_eq!(produced[1].key, b"quick".to_vec());
    }

    #[tokio::test]
    async fn failed_flush_retains_the_buffer() {
        let mut sender = Sender::new(registry());
        sender.send(outgoing("the", 1)).unwrap();

        let sink = VecSink::failing(1);
        let err = sender.flush(&sink).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sender.pending(), 1);

        // The retry resends the exact same record.
        sender.flush(&sink).await.unwrap();
        assert_eq!(sender.pending(), 0);
        assert_eq!(sink.produced().len(), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_buffer_is_a_no_op() {
        let mut sender = Sender::new(registry());
        let sink = VecSink::failing(1);
        // Would fail if it reached the sink.
        sender.flush(&sink).await.unwrap();
    }
}
