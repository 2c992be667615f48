use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bridge::{ProgressFn, StreamBridge, DEFAULT_BUFFER_SIZE};
use crate::throttle::TokenBucket;
use crate::timing::RunTimings;

/// Knobs that change what a transfer does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    pub buffer_size: usize,
    pub include_versions: bool,
    pub force: bool,
    pub verify: bool,
    /// Compare source and target without writing anything.
    pub verify_only: bool,
    /// Delete each source object once it reached the target.
    pub delete_source: bool,
    /// Bytes per second read from sources, across all tasks.
    pub bandwidth_limit: Option<u64>,
    /// Objects per second handed to the pool.
    pub throughput_limit: Option<u64>,
    pub timing_window: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            include_versions: true,
            force: false,
            verify: false,
            verify_only: false,
            delete_source: false,
            bandwidth_limit: None,
            throughput_limit: None,
            timing_window: 1000,
        }
    }
}

/// Everything one run shares between its tasks.
pub struct RunContext {
    pub options: SyncOptions,
    pub timings: RunTimings,
    pub stats: Arc<TransferStats>,
    pub bandwidth: Option<Arc<TokenBucket>>,
    pub throughput: Option<TokenBucket>,
}

impl RunContext {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            timings: RunTimings::new(options.timing_window),
            stats: Arc::new(TransferStats::default()),
            bandwidth: options.bandwidth_limit.map(|l| Arc::new(TokenBucket::new(l))),
            throughput: options.throughput_limit.map(TokenBucket::new),
            options,
        }
    }

    /// A bridge sized for this run. Its progress callback feeds the run's
    /// byte counter, so bridged reads must not be counted again.
    pub fn bridge(&self) -> StreamBridge {
        let stats = self.stats.clone();
        let seen = AtomicU64::new(0);
        let progress: ProgressFn = Arc::new(move |total| {
            let prev = seen.swap(total, Ordering::Relaxed);
            stats.add_bytes(total.saturating_sub(prev));
        });
        let bridge = StreamBridge::new(self.options.buffer_size).with_progress(progress);
        if self.options.verify || self.options.verify_only {
            bridge.with_checksum()
        } else {
            bridge
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferStats {
    pub objects_copied: AtomicU64,
    pub objects_unchanged: AtomicU64,
    pub objects_failed: AtomicU64,
    pub objects_verified: AtomicU64,
    pub sources_deleted: AtomicU64,
    pub versions_replayed: AtomicU64,
    pub versions_deleted: AtomicU64,
    pub bytes: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub objects_copied: u64,
    pub objects_unchanged: u64,
    pub objects_failed: u64,
    pub objects_verified: u64,
    pub sources_deleted: u64,
    pub versions_replayed: u64,
    pub versions_deleted: u64,
    pub bytes: u64,
}

impl TransferStats {
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_copied: self.objects_copied.load(Ordering::Relaxed),
            objects_unchanged: self.objects_unchanged.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
            objects_verified: self.objects_verified.load(Ordering::Relaxed),
            sources_deleted: self.sources_deleted.load(Ordering::Relaxed),
            versions_replayed: self.versions_replayed.load(Ordering::Relaxed),
            versions_deleted: self.versions_deleted.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}
