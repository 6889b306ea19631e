use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::{FetchedRecord, KafkaSink, KafkaSource, RecordSink, RecordSource};
use crate::config::TopicProcessorConfig;
use crate::errors::{ConfigError, ProcessorError, Result};
use crate::offsets::OffsetRegistry;
use crate::partition::{Coordinator, MessageProcessor, PartitionCommand, PartitionProcessor};
use crate::sender::Sender;
use crate::store::StoreSet;
use crate::telemetry::{MetricsSnapshot, ProcessorMetrics};

type PartitionRoutes = HashMap<String, HashMap<i32, mpsc::Sender<PartitionCommand>>>;

/// One running container: the broker consumer, the partition processors for
/// this container's slice of the partition map, and the auto-mark ticker.
///
/// Constructed with [`TopicProcessor::start`]; runs until [`shutdown`] is
/// called or a fatal error stops it. The library installs no signal
/// handlers; the embedding program reacts to signals by calling
/// [`shutdown`], which drains in-flight work, commits marked offsets and
/// returns the terminal result.
///
/// [`shutdown`]: TopicProcessor::shutdown
#[derive(Debug)]
pub struct TopicProcessor {
    name: String,
    shutdown: watch::Sender<bool>,
    run_loop: JoinHandle<Result<()>>,
    metrics: Arc<ProcessorMetrics>,
}

impl TopicProcessor {
    /// Validates the config, connects the Kafka clients and starts the
    /// container. The factory is invoked once per assigned partition with
    /// that partition's store handles.
    pub async fn start<F>(
        config: TopicProcessorConfig,
        container_id: u32,
        factory: F,
    ) -> Result<Self>
    where
        F: FnMut(&StoreSet) -> Box<dyn MessageProcessor>,
    {
        config.validate()?;
        let source = Arc::new(KafkaSource::new(&config.broker, &config.name)?);
        let sink = Arc::new(KafkaSink::new(&config.broker)?);
        Self::start_with_broker(config, container_id, factory, source, sink).await
    }

    /// Like [`start`], but over caller-supplied broker endpoints. This is
    /// the seam integration tests (and alternative brokers) plug into.
    ///
    /// [`start`]: TopicProcessor::start
    pub async fn start_with_broker<F>(
        config: TopicProcessorConfig,
        container_id: u32,
        mut factory: F,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self>
    where
        F: FnMut(&StoreSet) -> Box<dyn MessageProcessor>,
    {
        config.validate()?;
        let partitions = config.assigned_partitions(container_id);
        if partitions.is_empty() {
            return Err(ConfigError::InvalidPartitionMap {
                reason: format!("no partitions mapped to container {container_id}"),
            }
            .into());
        }

        let registry = Arc::new(config.serdes.clone());
        let offsets = Arc::new(OffsetRegistry::default());
        let metrics = Arc::new(ProcessorMetrics::default());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut routes: PartitionRoutes = HashMap::new();
        let mut tasks = Vec::new();
        for topic in &config.input_topics {
            let serde = config
                .serdes
                .lookup(topic)
                .cloned()
                .ok_or_else(|| ConfigError::MissingSerde {
                    topic: topic.clone(),
                })?;
            for &partition in &partitions {
                let stores = StoreSet::new(&config.stores);
                let processor = factory(&stores);
                let partition_processor = PartitionProcessor {
                    topic: topic.clone(),
                    partition,
                    serde: serde.clone(),
                    processor,
                    sender: Sender::new(registry.clone()),
                    coordinator: Coordinator::new(topic.clone(), partition),
                    stores,
                    sink: sink.clone(),
                    offsets: offsets.clone(),
                    metrics: metrics.clone(),
                    batch_size: config.processing.batch_size,
                    max_retries: config.processing.max_retries,
                    retry_delay: Duration::from_millis(config.processing.retry_delay_ms),
                    last_consumed: None,
                    last_processed: None,
                    last_marked: None,
                    records_in_batch: 0,
                };
                let (tx, rx) = mpsc::channel(config.processing.channel_capacity);
                tasks.push(tokio::spawn(partition_processor.run(rx, fatal_tx.clone())));
                routes.entry(topic.clone()).or_default().insert(partition, tx);
            }
        }

        source.subscribe(&config.input_topics).await?;
        info!(
            name = %config.name,
            container_id,
            topics = ?config.input_topics,
            ?partitions,
            "topic processor started"
        );

        let run_loop = RunLoop {
            name: config.name.clone(),
            source,
            routes,
            offsets,
            fatal: fatal_rx,
            shutdown: shutdown_rx,
            auto_mark_interval: config.auto_mark_offsets_interval,
            shutdown_timeout: Duration::from_millis(config.processing.shutdown_timeout_ms),
            tasks,
            metrics: metrics.clone(),
        };

        Ok(Self {
            name: config.name,
            shutdown: shutdown_tx,
            run_loop: tokio::spawn(run_loop.run()),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops fetching, closes every partition's batch (producer flush,
    /// store flush, mark), commits the final offsets and closes the
    /// clients. Returns the fatal error if the container had already
    /// stopped because of one.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.run_loop.await {
            Ok(result) => result,
            Err(err) => Err(ProcessorError::Generic(anyhow!(
                "topic processor task panicked: {err}"
            ))),
        }
    }
}

struct RunLoop {
    name: String,
    source: Arc<dyn RecordSource>,
    routes: PartitionRoutes,
    offsets: Arc<OffsetRegistry>,
    fatal: mpsc::UnboundedReceiver<ProcessorError>,
    shutdown: watch::Receiver<bool>,
    auto_mark_interval: Duration,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<ProcessorMetrics>,
}

impl RunLoop {
    async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.auto_mark_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; consume it so
        // ticks start one interval from now.
        ticker.tick().await;

        let mut fatal_error: Option<ProcessorError> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!(name = %self.name, "shutdown requested");
                    break;
                }
                received = self.fatal.recv() => {
                    let err = received.unwrap_or_else(|| {
                        ProcessorError::Generic(anyhow!("all partition processors terminated"))
                    });
                    error!(name = %self.name, %err, "partition processor failed");
                    fatal_error = Some(err);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.close_all_batches().await {
                        error!(name = %self.name, %err, "auto-mark failed");
                        fatal_error = Some(err);
                        break;
                    }
                    self.commit_marks().await;
                }
                fetched = self.source.recv() => {
                    match fetched {
                        Ok(record) => {
                            if let Err(route_err) = self.route(record).await {
                                let err = self.fatal.try_recv().ok().unwrap_or(route_err);
                                error!(name = %self.name, %err, "partition routing failed");
                                fatal_error = Some(err);
                                break;
                            }
                        }
                        Err(err) => {
                            let err = ProcessorError::Broker(err);
                            if err.is_retryable() {
                                warn!(name = %self.name, %err, "fetch failed, continuing");
                            } else {
                                error!(name = %self.name, %err, "fetch failed permanently");
                                fatal_error = Some(err);
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.drain(fatal_error).await
    }

    /// Routes a fetched record to its partition processor. Routing is O(1)
    /// over the precomputed topic/partition map; records for partitions not
    /// owned by this container are dropped with a warning.
    async fn route(&self, record: FetchedRecord) -> Result<()> {
        let Some(tx) = self
            .routes
            .get(record.topic.as_str())
            .and_then(|partitions| partitions.get(&record.partition))
        else {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "dropping record for partition not owned by this container"
            );
            self.metrics.record_dropped();
            return Ok(());
        };

        if tx.send(PartitionCommand::Record(record)).await.is_err() {
            return Err(ProcessorError::Generic(anyhow!(
                "partition processor terminated unexpectedly"
            )));
        }
        Ok(())
    }

    /// Asks every partition processor to run the commit protocol on its
    /// current batch and waits for all of them.
    async fn close_all_batches(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for partitions in self.routes.values() {
            for tx in partitions.values() {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(PartitionCommand::CloseBatch(reply_tx)).await.is_err() {
                    return Err(take_fatal_or(
                        &mut self.fatal,
                        anyhow!("partition processor terminated unexpectedly"),
                    ));
                }
                pending.push(reply_rx);
            }
        }
        for reply in pending {
            match reply.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(take_fatal_or(
                        &mut self.fatal,
                        anyhow!("partition processor dropped a close-batch request"),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Commits every mark that changed since the last successful commit. A
    /// failed commit is retried on the next tick; at-least-once semantics
    /// tolerate the redelivery window.
    async fn commit_marks(&self) {
        let marks = self.offsets.changed();
        if marks.is_empty() {
            return;
        }
        match self.source.commit(&marks).await {
            Ok(()) => {
                self.offsets.record_committed(&marks);
                self.metrics.offset_committed();
                debug!(name = %self.name, count = marks.len(), "committed offsets");
            }
            Err(err) => {
                warn!(name = %self.name, %err, "offset commit failed, will retry on next tick");
            }
        }
    }

    async fn drain(mut self, fatal: Option<ProcessorError>) -> Result<()> {
        let clean = fatal.is_none();
        let deadline = self.shutdown_timeout;
        let drained = {
            let drain = self.drain_inner(clean);
            tokio::time::timeout(deadline, drain).await
        };

        match drained {
            Ok(result) => {
                if clean {
                    info!(name = %self.name, "topic processor stopped");
                }
                match fatal {
                    Some(err) => Err(err),
                    None => result,
                }
            }
            Err(_elapsed) => {
                error!(
                    name = %self.name,
                    timeout_ms = deadline.as_millis() as u64,
                    "shutdown did not finish in time, force-closing"
                );
                for task in &self.tasks {
                    task.abort();
                }
                match fatal {
                    Some(err) => Err(err),
                    None => Err(ProcessorError::ShutdownTimedOut {
                        waited_ms: deadline.as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Shutdown steps in order: close every batch (full commit protocol),
    /// issue the final broker commit, stop the partition tasks. On a fatal
    /// stop no new offsets are committed.
    async fn drain_inner(&mut self, clean: bool) -> Result<()> {
        let mut result = Ok(());
        if clean {
            result = self.close_all_batches().await;
            if result.is_ok() {
                let marks = self.offsets.changed();
                if !marks.is_empty() {
                    match self.source.commit(&marks).await {
                        Ok(()) => {
                            self.offsets.record_committed(&marks);
                            self.metrics.offset_committed();
                        }
                        Err(err) => result = Err(err.into()),
                    }
                }
            }
        }
        let stopped = self.stop_partitions().await;
        result.and(stopped)
    }

    async fn stop_partitions(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for partitions in self.routes.values() {
            for tx in partitions.values() {
                let (reply_tx, reply_rx) = oneshot::channel();
                // A task that already stopped has closed its queue; skip it.
                if tx.send(PartitionCommand::Shutdown(reply_tx)).await.is_ok() {
                    pending.push(reply_rx);
                }
            }
        }

        let mut first_error = None;
        for reply in pending {
            if let Ok(Err(err)) = reply.await {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(join_err) = task.await {
                if join_err.is_panic() && first_error.is_none() {
                    first_error = Some(ProcessorError::Generic(anyhow!(
                        "partition task panicked"
                    )));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Prefers the error a partition task already reported over a generic
/// channel-closure diagnosis.
fn take_fatal_or(
    fatal: &mut mpsc::UnboundedReceiver<ProcessorError>,
    fallback: anyhow::Error,
) -> ProcessorError {
    fatal
        .try_recv()
        .ok()
        .unwrap_or(ProcessorError::Generic(fallback))
}
