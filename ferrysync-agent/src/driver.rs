//! Sync driver: lists the source and feeds one task per key into the pool.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use ferrysync_common::StorageBackend;
use ferrysync_engine::{
    transfer_object, uses_versions, RunContext, StatsSnapshot, TaskError, TaskHandle,
    TransferReport, WorkerPool,
};

use crate::config::SyncConfig;
use crate::ledger::StatusLedger;

pub const POOL_NAME: &str = "ferrysync";

enum KeyOutcome {
    Transferred(TransferReport),
    /// The ledger already has this key at the current source content.
    AlreadyCurrent,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub keys: usize,
    pub submitted: usize,
    pub already_current: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub stats: StatsSnapshot,
}

pub struct Driver {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    ctx: Arc<RunContext>,
    pool: WorkerPool,
    ledger: Option<Arc<StatusLedger>>,
}

impl Driver {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        ledger: Option<Arc<StatusLedger>>,
    ) -> anyhow::Result<Self> {
        let pool = WorkerPool::new(POOL_NAME, config.pool_config())?;
        Ok(Self {
            source,
            target,
            ctx: Arc::new(RunContext::new(config.sync_options())),
            pool,
            ledger,
        })
    }

    /// Handle for resizing, pausing or stopping the pool from outside the run.
    pub fn pool(&self) -> WorkerPool {
        self.pool.clone()
    }

    /// Run to completion. Blocks the calling thread.
    pub fn run(&self) -> anyhow::Result<RunSummary> {
        let keys = self.source.list_keys()?;
        info!(
            source = self.source.name(),
            target = self.target.name(),
            keys = keys.len(),
            "Starting sync"
        );

        let mut summary = RunSummary { keys: keys.len(), ..RunSummary::default() };
        let mut handles: Vec<(String, TaskHandle<KeyOutcome>)> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bucket) = &self.ctx.throughput {
                bucket.consume(1);
            }
            let task = self.task(key.clone());
            match self.pool.blocking_submit(task) {
                Ok(handle) => handles.push((key, handle)),
                Err(e) => {
                    warn!(error = %e, "Pool stopped accepting work; ending submission");
                    break;
                }
            }
        }
        summary.submitted = handles.len();
        self.pool.set_shutdown_when_idle(true);

        for (key, handle) in handles {
            match handle.wait() {
                Ok(KeyOutcome::Transferred(report)) => {
                    debug!(key = %key, action = report.action.as_str(), bytes = report.bytes, "Object done");
                }
                Ok(KeyOutcome::AlreadyCurrent) => summary.already_current += 1,
                Err(TaskError::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(key = %key, error = %e, "Object transfer failed");
                    if let Some(ledger) = &self.ledger {
                        if let Err(le) = ledger.record_failure(&key, &e.to_string()) {
                            warn!(key = %key, error = %le, "Failed to record failure in ledger");
                        }
                    }
                }
            }
        }

        self.pool.await_termination();
        self.ctx.timings.dump();
        summary.stats = self.ctx.stats.snapshot();
        info!(
            keys = summary.keys,
            copied = summary.stats.objects_copied,
            unchanged = summary.stats.objects_unchanged,
            already_current = summary.already_current,
            failed = summary.failed,
            cancelled = summary.cancelled,
            bytes = summary.stats.bytes,
            "Sync finished"
        );
        Ok(summary)
    }

    fn task(&self, key: String) -> impl FnOnce() -> anyhow::Result<KeyOutcome> + Send + 'static {
        let source = self.source.clone();
        let target = self.target.clone();
        let ctx = self.ctx.clone();
        let ledger = self.ledger.clone();
        move || {
            // A head fingerprint says nothing about the versions behind it,
            // so versioned keys always go to the reconciler.
            let shortcut = !ctx.options.force
                && !ctx.options.verify_only
                && !uses_versions(&ctx, source.as_ref(), target.as_ref());
            if let Some(ledger) = &ledger {
                if shortcut {
                    let fingerprint = source.head(&key)?.and_then(|r| r.fingerprint);
                    if let Some(fp) = fingerprint {
                        if ledger.is_current(&key, &fp)? {
                            debug!(key = %key, "Already synced in an earlier run");
                            return Ok(KeyOutcome::AlreadyCurrent);
                        }
                    }
                }
            }
            let report = transfer_object(&ctx, source.as_ref(), target.as_ref(), &key)?;
            if let Some(ledger) = &ledger {
                ledger.record_success(&report)?;
            }
            Ok(KeyOutcome::Transferred(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cas::CasBackend;
    use crate::backend::directory::DirectoryBackend;
    use crate::config::{BackendConfig, BackendKind};
    use crate::ledger::SyncStatus;
    use ferrysync_common::memory::MemoryBackend;
    use std::io::Read;

    fn config(threads: usize) -> SyncConfig {
        SyncConfig {
            threads,
            queue_size: Some(2),
            buffer_size: 64,
            include_versions: true,
            force: false,
            verify: true,
            verify_only: false,
            delete_source: false,
            bandwidth_limit: None,
            throughput_limit: None,
            timing_window: 0,
            ledger_path: None,
            source: BackendConfig { kind: BackendKind::Memory, path: None },
            target: BackendConfig { kind: BackendKind::Memory, path: None },
        }
    }

    #[test]
    fn test_directory_to_cas_run() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source = Arc::new(DirectoryBackend::new(src_dir.path()));
        for i in 0..25 {
            let body = format!("object {i}").repeat(i + 1);
            source.write_version(&format!("dir{}/obj{i}.txt", i % 3), &mut body.as_bytes(), true).unwrap();
        }
        let target = Arc::new(CasBackend::open(dst_dir.path()).unwrap());

        let driver = Driver::new(&config(3), source.clone(), target.clone(), None).unwrap();
        let summary = driver.run().unwrap();
        assert_eq!(summary.keys, 25);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.stats.objects_copied, 25);
        assert!(driver.pool().is_shutdown());

        assert_eq!(target.list_keys().unwrap(), source.list_keys().unwrap());
        for key in source.list_keys().unwrap() {
            let src = source.head(&key).unwrap().unwrap();
            let dst = target.head(&key).unwrap().unwrap();
            assert!(src.same_content(&dst), "{key}");
        }
    }

    #[test]
    fn test_versioned_memory_run_and_rerun() {
        let source = Arc::new(MemoryBackend::new("src", true));
        let target = Arc::new(MemoryBackend::new("dst", true));
        source.put("a", b"a1").unwrap();
        source.put("a", b"a2").unwrap();
        source.put("b", b"b1").unwrap();
        source.write_delete_marker("b").unwrap();
        source.set_push_reads(true);

        let first = Driver::new(&config(2), source.clone(), target.clone(), None)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(first.failed, 0);
        assert_eq!(first.stats.objects_copied, 2);
        for key in ["a", "b"] {
            assert!(target.list_versions(key).unwrap().matches(&source.list_versions(key).unwrap()));
        }
        assert!(target.head("b").unwrap().is_none());

        let second = Driver::new(&config(2), source.clone(), target.clone(), None)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(second.stats.objects_unchanged, 2);
        assert_eq!(second.stats.objects_copied, 0);

        let mut current = Vec::new();
        match target.read("a", None).unwrap() {
            ferrysync_common::ContentSource::Pull(mut r) => {
                r.read_to_end(&mut current).unwrap();
            }
            ferrysync_common::ContentSource::Push(_) => panic!("target reads are pull-style"),
        }
        assert_eq!(current, b"a2");
    }

    #[test]
    fn test_ledger_skips_and_records_failures() {
        let source = Arc::new(MemoryBackend::new("src", false));
        let target = Arc::new(MemoryBackend::new("dst", false));
        for key in ["x", "y", "z"] {
            source.put(key, key.as_bytes()).unwrap();
        }
        let ledger = Arc::new(StatusLedger::open_in_memory().unwrap());

        target.fail_next_writes(1);
        let first = Driver::new(&config(1), source.clone(), target.clone(), Some(ledger.clone()))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(ledger.count(SyncStatus::Complete).unwrap(), 2);
        assert_eq!(ledger.count(SyncStatus::Failed).unwrap(), 1);

        let second = Driver::new(&config(1), source.clone(), target.clone(), Some(ledger.clone()))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(second.failed, 0);
        assert_eq!(second.already_current, 2);
        assert_eq!(second.stats.objects_copied, 1);
        assert_eq!(ledger.count(SyncStatus::Complete).unwrap(), 3);
        assert_eq!(target.object_count(), 3);
    }

    #[test]
    fn test_ledger_does_not_hide_new_versions() {
        let source = Arc::new(MemoryBackend::new("src", true));
        let target = Arc::new(MemoryBackend::new("dst", true));
        let ledger = Arc::new(StatusLedger::open_in_memory().unwrap());
        source.put("k", b"A").unwrap();

        let run = || {
            Driver::new(&config(1), source.clone(), target.clone(), Some(ledger.clone()))
                .unwrap()
                .run()
                .unwrap()
        };
        assert_eq!(run().stats.objects_copied, 1);

        // deleted and re-created with the same content: the head fingerprint
        // is unchanged but the chain grew
        source.write_delete_marker("k").unwrap();
        source.put("k", b"A").unwrap();
        let second = run();
        assert_eq!(second.already_current, 0);
        assert_eq!(second.stats.objects_copied, 1);
        assert_eq!(target.list_versions("k").unwrap().len(), 3);
        assert!(target.list_versions("k").unwrap().matches(&source.list_versions("k").unwrap()));

        // identical content put again
        source.put("k", b"A").unwrap();
        run();
        assert!(target.list_versions("k").unwrap().matches(&source.list_versions("k").unwrap()));

        // nothing new: the reconciler reports it unchanged
        let settled = run();
        assert_eq!(settled.stats.objects_unchanged, 1);
        assert_eq!(settled.stats.objects_copied, 0);
    }

    #[test]
    fn test_throughput_limit_paces_submission() {
        let source = Arc::new(MemoryBackend::new("src", false));
        let target = Arc::new(MemoryBackend::new("dst", false));
        for i in 0..25 {
            source.put(&format!("k{i:02}"), b"x").unwrap();
        }
        let mut config = config(4);
        config.throughput_limit = Some(10);

        let started = std::time::Instant::now();
        let summary = Driver::new(&config, source, target.clone(), None).unwrap().run().unwrap();
        // 20 objects fit the burst, the last 5 need half a second
        assert!(started.elapsed() >= std::time::Duration::from_millis(400));
        assert_eq!(summary.stats.objects_copied, 25);
        assert_eq!(target.object_count(), 25);
    }

    #[test]
    fn test_empty_source() {
        let source = Arc::new(MemoryBackend::new("src", false));
        let target = Arc::new(MemoryBackend::new("dst", false));
        let summary = Driver::new(&config(2), source, target, None).unwrap().run().unwrap();
        assert_eq!(summary.keys, 0);
        assert_eq!(summary.submitted, 0);
    }
}
