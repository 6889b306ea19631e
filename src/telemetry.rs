use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamwork=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// In-process counters for one container. Shared by every partition task,
/// hence atomics rather than plain fields.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    records_processed: AtomicU64,
    records_dropped: AtomicU64,
    batches_closed: AtomicU64,
    producer_flushes: AtomicU64,
    store_flushes: AtomicU64,
    offset_commits: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_dropped: u64,
    pub batches_closed: u64,
    pub producer_flushes: u64,
    pub store_flushes: u64,
    pub offset_commits: u64,
}

impl ProcessorMetrics {
    pub(crate) fn record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_closed(&self) {
        self.batches_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn producer_flushed(&self) {
        self.producer_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn store_flushed(&self) {
        self.store_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn offset_committed(&self) {
        self.offset_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            batches_closed: self.batches_closed.load(Ordering::Relaxed),
            producer_flushes: self.producer_flushes.load(Ordering::Relaxed),
            store_flushes: self.store_flushes.load(Ordering::Relaxed),
            offset_commits: self.offset_commits.load(Ordering::Relaxed),
        }
    }
}
