use thiserror::Error;

/// Top-level error for the topic-processor runtime.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serde(#[from] SerdeError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processing failed for {topic}/{partition} at offset {offset}: {cause}")]
    Process {
        topic: String,
        partition: i32,
        offset: i64,
        cause: anyhow::Error,
    },

    #[error("Shutdown did not complete within {waited_ms} ms; clients were force-closed")]
    ShutdownTimedOut { waited_ms: u64 },

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("No serde registered for input topic {topic}")]
    MissingSerde { topic: String },

    #[error("Invalid partition assignment: {reason}")]
    InvalidPartitionMap { reason: String },

    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SerdeError {
    #[error("no serde registered for output topic {topic}")]
    UnknownTopic { topic: String },

    #[error("encode failed: {reason}")]
    Encode { reason: String },

    #[error("decode failed: {reason}")]
    Decode { reason: String },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics:?}: {reason}")]
    Subscription { topics: Vec<String>, reason: String },

    #[error("Failed to fetch records: {reason}")]
    Fetch { reason: String },

    #[error("Failed to produce to topic {topic}: {reason}")]
    Produce { topic: String, reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Network hiccups, timeouts, 5xx responses. Retried by the commit
    /// protocol before escalating.
    #[error("transient store failure: {reason}")]
    Transient { reason: String },

    /// Permanent backend failure (malformed request, 4xx other than
    /// not-found). Fatal to the container.
    #[error("store backend failure: {reason}")]
    Backend { reason: String },

    /// A key that violates the backend's addressing rules. This is a
    /// programmer error, not a data error, and is fatal.
    #[error("malformed store key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("batch write failed for some entries: {}", render_batch_reasons(.reasons, .omitted))]
    BatchWrite { reasons: Vec<String>, omitted: usize },
}

/// Per-key failure reasons in an aggregated batch-write error are capped;
/// the remainder is summarized in an overflow tail.
const MAX_BATCH_ERROR_REASONS: usize = 5;

fn render_batch_reasons(reasons: &[String], omitted: &usize) -> String {
    let mut out = reasons.join("; ");
    if *omitted > 0 {
        out.push_str(&format!(" (omitted {omitted} more errors)"));
    }
    out
}

impl StoreError {
    /// Aggregates per-key failures from a batch write into a single error,
    /// keeping at most [`MAX_BATCH_ERROR_REASONS`] reasons.
    pub fn batch_write<I>(failures: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let failures: Vec<_> = failures.into_iter().collect();
        let omitted = failures.len().saturating_sub(MAX_BATCH_ERROR_REASONS);
        let reasons = failures
            .into_iter()
            .take(MAX_BATCH_ERROR_REASONS)
            .map(|(key, reason)| format!("key = {key}, error = {reason}"))
            .collect();
        StoreError::BatchWrite { reasons, omitted }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transient { .. } | StoreError::BatchWrite { .. }
        )
    }
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Fetch { .. }
                | BrokerError::Produce { .. }
                | BrokerError::OffsetCommit { .. }
        )
    }
}

impl ProcessorError {
    /// Whether the commit protocol may retry the failed step. Everything
    /// else bubbles to the container, which initiates clean shutdown.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessorError::Broker(err) => err.is_retryable(),
            ProcessorError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
