mod kafka;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::BrokerError;

pub use kafka::{KafkaSink, KafkaSource};

/// A raw record fetched from the broker, before decoding.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, Vec<u8>>,
}

/// A serialized record waiting to be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub partition: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The highest offset of a partition whose processing has fully committed
/// locally. Carries the offset of the record itself; implementations commit
/// the broker-native "next offset to read".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetMark {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Consumer side of the broker, at the seam the runtime depends on. The
/// concrete client lives behind this trait so tests can drive the container
/// with scripted records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Returns the next record, blocking until one is available.
    async fn recv(&self) -> Result<FetchedRecord, BrokerError>;

    /// Commits the given marks using the broker's native commit API.
    async fn commit(&self, marks: &[OffsetMark]) -> Result<(), BrokerError>;
}

/// Producer side of the broker. `produce_all` returns only once every
/// record in the batch has been acknowledged; a failed batch reports an
/// error without any claim about which records made it.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn produce_all(&self, records: &[ProducedRecord]) -> Result<(), BrokerError>;
}
