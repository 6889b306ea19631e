use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::broker::{FetchedRecord, OffsetMark, RecordSink};
use crate::codec::TopicSerde;
use crate::errors::{ProcessorError, Result};
use crate::message::IncomingMessage;
use crate::offsets::OffsetRegistry;
use crate::sender::Sender;
use crate::store::{KeyValueStore, StoreSet};
use crate::telemetry::ProcessorMetrics;

/// Per-message processing logic supplied by the user.
///
/// One instance exists per partition, created by the user factory; the
/// runtime never shares it across partitions, so implementations need no
/// internal synchronization. Returning an error is fatal to the container:
/// the partition's state is no longer trustworthy.
#[async_trait]
pub trait MessageProcessor: Send {
    async fn process(
        &mut self,
        message: IncomingMessage,
        sender: &mut Sender,
        coordinator: &mut Coordinator,
    ) -> anyhow::Result<()>;
}

/// Partition introspection handle passed to user code. Exposes the owning
/// topic and partition and lets the user request that the current batch be
/// committed after this message; it deliberately exposes neither the
/// consumer nor the producer.
pub struct Coordinator {
    topic: String,
    partition: i32,
    commit_requested: bool,
}

impl Coordinator {
    pub(crate) fn new(topic: String, partition: i32) -> Self {
        Self {
            topic,
            partition,
            commit_requested: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Asks the runtime to close the current batch once the in-flight
    /// message has been processed.
    pub fn request_commit(&mut self) {
        self.commit_requested = true;
    }

    fn take_commit_request(&mut self) -> bool {
        std::mem::take(&mut self.commit_requested)
    }
}

pub(crate) enum PartitionCommand {
    Record(FetchedRecord),
    CloseBatch(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// The single-writer unit owning one (input topic, partition): the user
/// processor instance, the outgoing buffer, the store handles and the
/// offset trio `last_marked <= last_processed <= last_consumed`.
pub(crate) struct PartitionProcessor {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) serde: TopicSerde,
    pub(crate) processor: Box<dyn MessageProcessor>,
    pub(crate) sender: Sender,
    pub(crate) coordinator: Coordinator,
    pub(crate) stores: StoreSet,
    pub(crate) sink: Arc<dyn RecordSink>,
    pub(crate) offsets: Arc<OffsetRegistry>,
    pub(crate) metrics: Arc<ProcessorMetrics>,
    pub(crate) batch_size: usize,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) last_consumed: Option<i64>,
    pub(crate) last_processed: Option<i64>,
    pub(crate) last_marked: Option<i64>,
    pub(crate) records_in_batch: usize,
}

impl PartitionProcessor {
    /// Command loop for the partition task. Records are processed in
    /// arrival (offset) order; when the queue idles with an open batch the
    /// batch is closed, which covers the end of a fetch burst. Errors are
    /// reported on the fatal channel and terminate the task.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<PartitionCommand>,
        fatal: mpsc::UnboundedSender<ProcessorError>,
    ) {
        loop {
            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => {
                    if self.batch_open() {
                        if let Err(err) = self.close_batch().await {
                            let _ = fatal.send(err);
                            return;
                        }
                    }
                    match commands.recv().await {
                        Some(command) => command,
                        None => return,
                    }
                }
                Err(TryRecvError::Disconnected) => return,
            };

            match command {
                PartitionCommand::Record(record) => {
                    if let Err(err) = self.handle_record(record).await {
                        let _ = fatal.send(err);
                        return;
                    }
                }
                PartitionCommand::CloseBatch(reply) => {
                    let result = self.close_batch().await;
                    let failed = result.is_err();
                    match reply.send(result) {
                        Err(Err(err)) => {
                            // Requester vanished; surface the failure anyway.
                            let _ = fatal.send(err);
                            return;
                        }
                        _ => {
                            if failed {
                                return;
                            }
                        }
                    }
                }
                PartitionCommand::Shutdown(reply) => {
                    let _ = reply.send(self.close_batch().await);
                    return;
                }
            }
        }
    }

    /// Decode, process and account for one record. Closes the batch when
    /// the configured batch size is reached or the user requested an early
    /// commit through the coordinator.
    pub(crate) async fn handle_record(&mut self, record: FetchedRecord) -> Result<()> {
        if let Some(consumed) = self.last_consumed {
            if record.offset <= consumed {
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = record.offset,
                    last_consumed = consumed,
                    "dropping redelivered record"
                );
                return Ok(());
            }
        }

        let key = self
            .serde
            .key
            .decode(record.key.as_deref().unwrap_or_default())
            .map_err(|err| {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = record.offset,
                    %err,
                    "key decode failed"
                );
                ProcessorError::Serde(err)
            })?;
        let value = self
            .serde
            .value
            .decode(record.value.as_deref().unwrap_or_default())
            .map_err(|err| {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = record.offset,
                    %err,
                    "value decode failed"
                );
                ProcessorError::Serde(err)
            })?;

        let message = IncomingMessage {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key,
            value,
            timestamp: record.timestamp,
            headers: record.headers,
        };

        self.last_consumed = Some(record.offset);
        self.processor
            .process(message, &mut self.sender, &mut self.coordinator)
            .await
            .map_err(|cause| ProcessorError::Process {
                topic: self.topic.clone(),
                partition: self.partition,
                offset: record.offset,
                cause,
            })?;
        self.last_processed = Some(record.offset);
        self.records_in_batch += 1;
        self.metrics.record_processed();

        if self.coordinator.take_commit_request() {
            debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = record.offset,
                "early commit requested"
            );
            self.close_batch().await?;
        } else if self.records_in_batch >= self.batch_size {
            self.close_batch().await?;
        }
        Ok(())
    }

    pub(crate) fn batch_open(&self) -> bool {
        self.sender.pending() > 0
            || self.stores.any_dirty()
            || self.last_processed > self.last_marked
    }

    /// The commit protocol, in order: flush the outgoing buffer to the
    /// broker, flush every store this batch touched, then advance the mark.
    /// An offset is never marked before its sends and store writes are
    /// acknowledged. Closing with nothing pending is a no-op, so a timer
    /// tick racing a batch-size trigger commits once, not twice.
    pub(crate) async fn close_batch(&mut self) -> Result<()> {
        if !self.batch_open() {
            return Ok(());
        }

        self.flush_outgoing().await?;
        self.flush_stores().await?;

        if self.last_processed > self.last_marked {
            if let Some(offset) = self.last_processed {
                self.last_marked = self.last_processed;
                self.offsets.mark(OffsetMark {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset,
                });
            }
        }
        self.records_in_batch = 0;
        self.metrics.batch_closed();
        Ok(())
    }

    async fn flush_outgoing(&mut self) -> Result<()> {
        if self.sender.pending() == 0 {
            return Ok(());
        }
        let mut attempt: u32 = 0;
        loop {
            match self.sender.flush(self.sink.as_ref()).await {
                Ok(()) => {
                    self.metrics.producer_flushed();
                    return Ok(());
                }
                Err(err) => {
                    if err.is_retryable() && attempt < self.max_retries {
                        attempt += 1;
                        let delay = backoff_delay(self.retry_delay, attempt);
                        warn!(
                            topic = %self.topic,
                            partition = self.partition,
                            attempt,
                            max_retries = self.max_retries,
                            ?delay,
                            %err,
                            "producer flush failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(
                            topic = %self.topic,
                            partition = self.partition,
                            %err,
                            "producer flush failed permanently"
                        );
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn flush_stores(&mut self) -> Result<()> {
        for store in self.stores.tracked() {
            if !store.is_dirty() {
                continue;
            }
            let mut attempt: u32 = 0;
            loop {
                match store.flush().await {
                    Ok(()) => {
                        self.metrics.store_flushed();
                        break;
                    }
                    Err(err) => {
                        let err = ProcessorError::Store(err);
                        if err.is_retryable() && attempt < self.max_retries {
                            attempt += 1;
                            let delay = backoff_delay(self.retry_delay, attempt);
                            warn!(
                                topic = %self.topic,
                                partition = self.partition,
                                store = store.name(),
                                attempt,
                                max_retries = self.max_retries,
                                ?delay,
                                %err,
                                "store flush failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        } else {
                            error!(
                                topic = %self.topic,
                                partition = self.partition,
                                store = store.name(),
                                %err,
                                "store flush failed permanently"
                            );
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    // 1x, 2x, 4x ... capped at 32x the base delay.
    let factor = 1u32 << (attempt.saturating_sub(1)).min(5);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::broker::ProducedRecord;
    use crate::codec::{SerdeRegistry, TopicSerde};
    use crate::errors::{BrokerError, SerdeError, StoreError};
    use crate::message::{OutgoingMessage, Value};
    use crate::store::{InMemoryKeyValueStore, KeyValue, KeyValueStore, TrackedStore};

    struct VecSink {
        produced: Mutex<Vec<ProducedRecord>>,
        failures_remaining: AtomicUsize,
        calls: AtomicUsize,
    }

    impl VecSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                produced: Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(times: usize) -> Arc<Self> {
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
        async fn produce_all(&self, records: &[ProducedRecord]) -> std::result::Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    /// Counts flushes and optionally fails the first few.
    struct FlushProbe {
        inner: InMemoryKeyValueStore,
        flushes: AtomicUsize,
        flush_failures_remaining: AtomicUsize,
    }

    impl FlushProbe {
        fn new(flush_failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryKeyValueStore::new(),
                flushes: AtomicUsize::new(0),
                flush_failures_remaining: AtomicUsize::new(flush_failures),
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for FlushProbe {
        async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }
        async fn get_all(&self, keys: &[String]) -> std::result::Result<Vec<KeyValue>, StoreError> {
            self.inner.get_all(keys).await
        }
        async fn put(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), StoreError> {
            self.inner.put(key, value).await
        }
        async fn put_all(&self, entries: Vec<KeyValue>) -> std::result::Result<(), StoreError> {
            self.inner.put_all(entries).await
        }
        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn flush(&self) -> std::result::Result<(), StoreError> {
            if self.flush_failures_remaining.load(Ordering::SeqCst) > 0 {
                self.flush_failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transient {
                    reason: "flush timed out".to_string(),
                });
            }
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Echoes each input line back out and tracks what it saw.
    struct Echo {
        store: Option<TrackedStore>,
        emit: bool,
        commit_after: Option<i64>,
        fail_at: Option<i64>,
    }

    #[async_trait]
    impl MessageProcessor for Echo {
        async fn process(
            &mut self,
            message: IncomingMessage,
            sender: &mut Sender,
            coordinator: &mut Coordinator,
        ) -> anyhow::Result<()> {
            if self.fail_at == Some(message.offset) {
                anyhow::bail!("poisoned record");
            }
            if let Some(store) = &self.store {
                store
                    .put(
                        message.key.as_text().unwrap_or_default(),
                        message.offset.to_le_bytes().to_vec(),
                    )
                    .await?;
            }
            if self.emit {
                sender.send(OutgoingMessage {
                    topic: "out".to_string(),
                    partition: 0,
                    key: message.key.clone(),
                    value: message.value.clone(),
                })?;
            }
            if self.commit_after == Some(message.offset) {
                coordinator.request_commit();
            }
            Ok(())
        }
    }

    struct Fixture {
        sink: Arc<VecSink>,
        offsets: Arc<OffsetRegistry>,
        stores: StoreSet,
    }

    fn fixture(
        emit: bool,
        batch_size: usize,
        sink: Arc<VecSink>,
        backend: Option<Arc<dyn KeyValueStore>>,
    ) -> (PartitionProcessor, Fixture) {
        let mut registry = SerdeRegistry::new();
        registry.register("in", TopicSerde::strings());
        registry.register("out", TopicSerde::strings());
        let registry = Arc::new(registry);

        let mut backends: HashMap<String, Arc<dyn KeyValueStore>> = HashMap::new();
        if let Some(backend) = backend {
            backends.insert("state".to_string(), backend);
        }
        let stores = StoreSet::new(&backends);

        let offsets = Arc::new(OffsetRegistry::default());
        let processor = PartitionProcessor {
            topic: "in".to_string(),
            partition: 0,
            serde: registry.lookup("in").unwrap().clone(),
            processor: Box::new(Echo {
                store: stores.get("state"),
                emit,
                commit_after: None,
                fail_at: None,
            }),
            sender: Sender::new(registry),
            coordinator: Coordinator::new("in".to_string(), 0),
            stores: stores.clone(),
            sink: sink.clone(),
            offsets: offsets.clone(),
            metrics: Arc::new(ProcessorMetrics::default()),
            batch_size,
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            last_consumed: None,
            last_processed: None,
            last_marked: None,
            records_in_batch: 0,
        };
        (
            processor,
            Fixture {
                sink,
                offsets,
                stores,
            },
        )
    }

    fn record(offset: i64, key: &str, value: &str) -> FetchedRecord {
        FetchedRecord {
            topic: "in".to_string(),
            partition: 0,
            offset,
            key: Some(key.as_bytes().to_vec()),
            value: Some(value.as_bytes().to_vec()),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::new(),
        }
    }

    fn marked_offset(fixture: &Fixture) -> Option<i64> {
        fixture
            .offsets
            .changed()
            .into_iter()
            .find(|m| m.topic == "in" && m.partition == 0)
            .map(|m| m.offset)
    }

    #[tokio::test]
    async fn records_are_processed_in_order_and_offsets_advance() {
        let (mut pp, fixture) = fixture(false, 100, VecSink::new(), None);

        for offset in 0..3 {
            pp.handle_record(record(offset, "k", "v")).await.unwrap();
        }

        assert_eq!(pp.last_consumed, Some(2));
        assert_eq!(pp.last_processed, Some(2));
        assert_eq!(pp.last_marked, None);

        pp.close_batch().await.unwrap();
        assert_eq!(pp.last_marked, Some(2));
        assert_eq!(marked_offset(&fixture), Some(2));
    }

    #[tokio::test]
    async fn redelivered_records_are_dropped() {
        let (mut pp, _fixture) = fixture(false, 100, VecSink::new(), None);

        pp.handle_record(record(5, "k", "v")).await.unwrap();
        pp.handle_record(record(5, "k", "v")).await.unwrap();
        pp.handle_record(record(4, "k", "v")).await.unwrap();

        assert_eq!(pp.last_consumed, Some(5));
        assert_eq!(pp.metrics.snapshot().records_processed, 1);
    }

    #[tokio::test]
    async fn batch_size_triggers_the_commit_protocol() {
        let (mut pp, fixture) = fixture(true, 2, VecSink::new(), None);

        pp.handle_record(record(0, "a", "1")).await.unwrap();
        assert_eq!(marked_offset(&fixture), None);

        pp.handle_record(record(1, "b", "2")).await.unwrap();
        assert_eq!(marked_offset(&fixture), Some(1));
        assert_eq!(fixture.sink.produced().len(), 2);
        assert_eq!(pp.sender.pending(), 0);
    }

    #[tokio::test]
    async fn close_batch_with_nothing_pending_is_a_no_op() {
        let (mut pp, fixture) = fixture(false, 100, VecSink::new(), None);

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        pp.close_batch().await.unwrap();
        let batches = pp.metrics.snapshot().batches_closed;

        // Simultaneous timer and batch-size triggers collapse to one close.
        pp.close_batch().await.unwrap();
        pp.close_batch().await.unwrap();
        assert_eq!(pp.metrics.snapshot().batches_closed, batches);
        assert_eq!(marked_offset(&fixture), Some(0));
    }

    #[tokio::test]
    async fn offsets_advance_without_any_sends() {
        let (mut pp, fixture) = fixture(false, 100, VecSink::new(), None);

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        pp.close_batch().await.unwrap();

        assert_eq!(marked_offset(&fixture), Some(0));
        assert!(fixture.sink.produced().is_empty());
        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn coordinator_early_commit_closes_the_batch() {
        let (mut pp, fixture) = fixture(true, 100, VecSink::new(), None);
        pp.processor = Box::new(Echo {
            store: None,
            emit: true,
            commit_after: Some(0),
            fail_at: None,
        });

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        assert_eq!(marked_offset(&fixture), Some(0));
        assert_eq!(fixture.sink.produced().len(), 1);
    }

    #[tokio::test]
    async fn transient_producer_failure_is_retried_before_marking() {
        let (mut pp, fixture) = fixture(true, 100, VecSink::failing(2), None);

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        pp.close_batch().await.unwrap();

        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.sink.produced().len(), 1);
        assert_eq!(marked_offset(&fixture), Some(0));
    }

    #[tokio::test]
    async fn exhausted_producer_retries_escalate_and_do_not_mark() {
        let (mut pp, fixture) = fixture(true, 100, VecSink::failing(10), None);

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        let err = pp.close_batch().await.unwrap_err();

        assert!(matches!(err, ProcessorError::Broker(_)));
        assert_eq!(marked_offset(&fixture), None);
        assert_eq!(pp.last_marked, None);
        // Buffer is retained for the (hypothetical) next attempt.
        assert_eq!(pp.sender.pending(), 1);
    }

    #[tokio::test]
    async fn dirty_stores_are_flushed_before_marking() {
        let probe = FlushProbe::new(0);
        let (mut pp, fixture) =
            fixture(false, 100, VecSink::new(), Some(probe.clone() as Arc<dyn KeyValueStore>));

        pp.handle_record(record(0, "fox", "v")).await.unwrap();
        assert!(fixture.stores.any_dirty());

        pp.close_batch().await.unwrap();
        assert_eq!(probe.flushes.load(Ordering::SeqCst), 1);
        assert!(!fixture.stores.any_dirty());
        assert_eq!(marked_offset(&fixture), Some(0));

        // A batch that never touched the store does not flush it again.
        let (mut pp2, _fixture2) = fixture_without_store_touch(probe.clone());
        pp2.handle_record(record(0, "k", "v")).await.unwrap();
        pp2.close_batch().await.unwrap();
        assert_eq!(probe.flushes.load(Ordering::SeqCst), 1);
    }

    fn fixture_without_store_touch(probe: Arc<FlushProbe>) -> (PartitionProcessor, Fixture) {
        let (mut pp, fixture) = fixture(false, 100, VecSink::new(), Some(probe as Arc<dyn KeyValueStore>));
        pp.processor = Box::new(Echo {
            store: None,
            emit: false,
            commit_after: None,
            fail_at: None,
        });
        (pp, fixture)
    }

    #[tokio::test]
    async fn transient_store_flush_failure_is_retried() {
        let probe = FlushProbe::new(1);
        let (mut pp, fixture) =
            fixture(false, 100, VecSink::new(), Some(probe.clone() as Arc<dyn KeyValueStore>));

        pp.handle_record(record(0, "fox", "v")).await.unwrap();
        pp.close_batch().await.unwrap();

        assert_eq!(probe.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(marked_offset(&fixture), Some(0));
    }

    #[tokio::test]
    async fn exhausted_store_retries_escalate_and_do_not_mark() {
        let probe = FlushProbe::new(10);
        let (mut pp, fixture) =
            fixture(false, 100, VecSink::new(), Some(probe.clone() as Arc<dyn KeyValueStore>));

        pp.handle_record(record(0, "fox", "v")).await.unwrap();
        let err = pp.close_batch().await.unwrap_err();

        assert!(matches!(err, ProcessorError::Store(_)));
        assert_eq!(marked_offset(&fixture), None);
    }

    #[tokio::test]
    async fn decode_failure_is_fatal() {
        let (mut pp, _fixture) = fixture(false, 100, VecSink::new(), None);
        pp.serde = TopicSerde::string_json();

        let err = pp
            .handle_record(record(0, "k", "not json {{"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Serde(SerdeError::Decode { .. })));
        // A record that fails to decode is never recorded as consumed.
        assert_eq!(pp.last_processed, None);
        assert_eq!(pp.last_consumed, None);
    }

    #[tokio::test]
    async fn user_error_carries_partition_context() {
        let (mut pp, _fixture) = fixture(false, 100, VecSink::new(), None);
        pp.processor = Box::new(Echo {
            store: None,
            emit: false,
            commit_after: None,
            fail_at: Some(1),
        });

        pp.handle_record(record(0, "k", "v")).await.unwrap();
        let err = pp.handle_record(record(1, "k", "v")).await.unwrap_err();

        match err {
            ProcessorError::Process {
                topic,
                partition,
                offset,
                ..
            } => {
                assert_eq!(topic, "in");
                assert_eq!(partition, 0);
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pp.last_consumed, Some(1));
        assert_eq!(pp.last_processed, Some(0));
    }

    #[tokio::test]
    async fn partition_task_closes_batch_when_queue_drains() {
        let (pp, fixture) = fixture(true, 100, VecSink::new(), None);
        let (tx, rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pp.run(rx, fatal_tx));

        tx.send(PartitionCommand::Record(record(0, "a", "1")))
            .await
            .unwrap();
        tx.send(PartitionCommand::Record(record(1, "b", "2")))
            .await
            .unwrap();

        // Wait for the drain-triggered close.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if marked_offset(&fixture) == Some(1) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "batch never closed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fixture.sink.produced().len(), 2);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PartitionCommand::Shutdown(reply_tx)).await.unwrap();
        reply_rx.await.unwrap().unwrap();
        task.await.unwrap();
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn partition_task_reports_fatal_errors() {
        let (mut pp, _fixture) = fixture(false, 100, VecSink::new(), None);
        pp.processor = Box::new(Echo {
            store: None,
            emit: false,
            commit_after: None,
            fail_at: Some(0),
        });

        let (tx, rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pp.run(rx, fatal_tx));

        tx.send(PartitionCommand::Record(record(0, "k", "v")))
            .await
            .unwrap();

        let err = fatal_rx.recv().await.expect("fatal error expected");
        assert!(matches!(err, ProcessorError::Process { .. }));
        task.await.unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 10), Duration::from_millis(3200));
    }

    #[test]
    fn coordinator_exposes_partition_identity() {
        let mut coordinator = Coordinator::new("words".to_string(), 7);
        assert_eq!(coordinator.topic(), "words");
        assert_eq!(coordinator.partition(), 7);
        assert!(!coordinator.take_commit_request());
        coordinator.request_commit();
        assert!(coordinator.take_commit_request());
        assert!(!coordinator.take_commit_request());
    }
}
