pub mod broker;
pub mod codec;
pub mod config;
pub mod errors;
pub mod message;
mod offsets;
pub mod partition;
pub mod processor;
pub mod sender;
pub mod store;
pub mod telemetry;

pub use broker::{FetchedRecord, KafkaSink, KafkaSource, OffsetMark, ProducedRecord, RecordSink, RecordSource};
pub use codec::{BytesCodec, Codec, JsonCodec, SerdeRegistry, StringCodec, TopicSerde};
pub use config::{BrokerOptions, ProcessingOptions, TopicProcessorConfig};
pub use errors::{BrokerError, ConfigError, ProcessorError, Result, SerdeError, StoreError};
pub use message::{IncomingMessage, OutgoingMessage, Value};
pub use partition::{Coordinator, MessageProcessor};
pub use processor::TopicProcessor;
pub use sender::Sender;
pub use store::{
    InMemoryKeyValueStore, KeyValue, KeyValueStore, StoreMetrics, StoreMetricsSnapshot, StoreSet,
    TrackedStore,
};
pub use telemetry::{init_tracing, MetricsSnapshot, ProcessorMetrics};
