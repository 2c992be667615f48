//! The per-object transfer task run on pool workers.

use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{debug, info, warn};

use ferrysync_common::backend::HashingReader;
use ferrysync_common::{ContentSource, StorageBackend, VersionRecord};

use crate::bridge::BridgeReader;
use crate::context::RunContext;
use crate::reconcile::{ReconcileError, VersionReconciler};
use crate::throttle::TokenBucket;

pub const OP_TRANSFER: &str = "TransferObject";
pub const OP_WRITE: &str = "WriteObject";
pub const OP_VERIFY: &str = "VerifyObject";

// ── Source content ──

enum SourceInner {
    Direct(HashingReader<Box<dyn Read + Send>>),
    Bridged(BridgeReader),
}

/// Object content opened from a source backend, bridged when the backend
/// only pushes. Reads are charged to the run's bandwidth limit, if any.
pub struct SourceReader {
    inner: SourceInner,
    bandwidth: Option<Arc<TokenBucket>>,
}

/// What was read once a [`SourceReader`] is finished.
#[derive(Debug, Clone)]
pub struct ReadSummary {
    pub bytes: u64,
    pub checksum: Option<String>,
}

impl SourceReader {
    pub fn is_bridged(&self) -> bool {
        matches!(self.inner, SourceInner::Bridged(_))
    }

    /// Release the source. A push producer's failure surfaces here if the
    /// consumer had not already seen it.
    pub fn finish(self) -> anyhow::Result<ReadSummary> {
        match self.inner {
            SourceInner::Direct(reader) => {
                let (digest, bytes) = reader.finish();
                Ok(ReadSummary { bytes, checksum: Some(digest) })
            }
            SourceInner::Bridged(mut reader) => {
                reader.close()?;
                Ok(ReadSummary { bytes: reader.bytes_read(), checksum: reader.checksum().ok() })
            }
        }
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &mut self.inner {
            SourceInner::Direct(r) => r.read(buf)?,
            SourceInner::Bridged(r) => r.read(buf)?,
        };
        if let Some(bucket) = &self.bandwidth {
            if n > 0 {
                bucket.consume(n as u64);
            }
        }
        Ok(n)
    }
}

/// Open a version of `key` (`None` = current) from `backend`.
pub fn open_source(
    ctx: &RunContext,
    backend: &dyn StorageBackend,
    key: &str,
    version_id: Option<&str>,
) -> anyhow::Result<SourceReader> {
    let inner = match backend.read(key, version_id)? {
        ContentSource::Pull(reader) => SourceInner::Direct(HashingReader::new(reader)),
        ContentSource::Push(producer) => {
            let name = format!("{}-bridge", backend.name());
            let reader = ctx
                .bridge()
                .spawn_push(&name, producer)
                .with_context(|| format!("Failed to start stream bridge for {}", key))?;
            SourceInner::Bridged(reader)
        }
    };
    Ok(SourceReader { inner, bandwidth: ctx.bandwidth.clone() })
}

/// Stream one source version into `target`, finish the read side and apply
/// verification. Returns the record the target reports and the bytes moved.
pub fn copy_version(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    key: &str,
    record: &VersionRecord,
    is_latest: bool,
) -> anyhow::Result<(VersionRecord, u64)> {
    let mut reader = open_source(ctx, source, key, Some(&record.version_id))?;
    let bridged = reader.is_bridged();
    let written = target.write_version(key, &mut reader, is_latest);
    let summary = reader.finish()?;
    let written = written.with_context(|| format!("{}: write failed for {}", target.name(), key))?;
    if !bridged {
        ctx.stats.add_bytes(summary.bytes);
    }
    if ctx.options.verify {
        verify(key, record, &written, &summary)?;
    }
    Ok((written, summary.bytes))
}

/// Compare what the source said, what was read, and what the target stored.
fn verify(
    key: &str,
    expected: &VersionRecord,
    written: &VersionRecord,
    read: &ReadSummary,
) -> anyhow::Result<()> {
    let Some(want) = expected.fingerprint.as_deref() else {
        debug!(key = %key, "Source has no fingerprint; skipping verification");
        return Ok(());
    };
    if let Some(got) = read.checksum.as_deref() {
        if got != want {
            bail!("Verification failed for {}: read {} but source reports {}", key, got, want);
        }
    }
    match written.fingerprint.as_deref() {
        Some(stored) if stored != want => {
            bail!("Verification failed for {}: target stored {} but source has {}", key, stored, want)
        }
        _ => Ok(()),
    }
}

// ── Transfer task ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    /// Current version copied.
    Copied,
    /// Target already matched.
    Unchanged,
    /// Missing newer versions appended to the target chain.
    Appended,
    /// Target chain deleted and rebuilt.
    Replaced,
    /// Source key disappeared after listing.
    Vanished,
    /// Target compared against the source without writing.
    Verified,
}

impl TransferAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferAction::Copied => "copied",
            TransferAction::Unchanged => "unchanged",
            TransferAction::Appended => "appended",
            TransferAction::Replaced => "replaced",
            TransferAction::Vanished => "vanished",
            TransferAction::Verified => "verified",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub key: String,
    pub action: TransferAction,
    pub bytes: u64,
    pub versions_replayed: usize,
    pub versions_deleted: usize,
    pub source_fingerprint: Option<String>,
    pub source_deleted: bool,
}

impl TransferReport {
    pub(crate) fn new(key: &str, action: TransferAction) -> Self {
        Self {
            key: key.to_string(),
            action,
            bytes: 0,
            versions_replayed: 0,
            versions_deleted: 0,
            source_fingerprint: None,
            source_deleted: false,
        }
    }
}

/// Bring `key` on the target in line with the source.
///
/// Keys whose backends both keep versions go through the version
/// reconciler when enabled; everything else, and any key the reconciler
/// cannot reason about, takes the current-version path.
pub fn transfer_object(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    key: &str,
) -> anyhow::Result<TransferReport> {
    let timer = ctx.timings.start(OP_TRANSFER);
    let mut result = transfer_inner(ctx, source, target, key);
    match &mut result {
        Ok(report) => {
            timer.complete();
            let counter = match report.action {
                TransferAction::Unchanged | TransferAction::Vanished => &ctx.stats.objects_unchanged,
                TransferAction::Verified => &ctx.stats.objects_verified,
                _ => &ctx.stats.objects_copied,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            if ctx.options.delete_source && report.action != TransferAction::Vanished {
                delete_source(ctx, source, report);
            }
        }
        Err(_) => {
            timer.fail();
            ctx.stats.objects_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    result
}

/// Remove the source object once the target holds it. A failed delete is
/// logged and leaves the transfer successful.
fn delete_source(ctx: &RunContext, source: &dyn StorageBackend, report: &mut TransferReport) {
    match source.write_delete_marker(&report.key) {
        Ok(_) => {
            report.source_deleted = true;
            ctx.stats.sources_deleted.fetch_add(1, Ordering::Relaxed);
            info!(key = %report.key, source = source.name(), "Deleted from source");
        }
        Err(e) => warn!(key = %report.key, error = %e, "Could not delete from source"),
    }
}

/// True when keys are synced by reconciling version chains rather than by
/// comparing current versions.
pub fn uses_versions(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
) -> bool {
    ctx.options.include_versions && source.supports_versions() && target.supports_versions()
}

fn transfer_inner(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    key: &str,
) -> anyhow::Result<TransferReport> {
    let versioned = uses_versions(ctx, source, target);
    if ctx.options.verify_only {
        return verify_existing(ctx, source, target, key, versioned);
    }
    if versioned {
        match VersionReconciler::new(ctx, source, target).sync_key(key) {
            Ok(report) => return Ok(report),
            Err(ReconcileError::Inconsistent) => {
                debug!(key = %key, "Source version chain unusable; falling back to current-version sync");
            }
            Err(ReconcileError::Backend(e)) => return Err(e),
        }
    }
    sync_current(ctx, source, target, key)
}

/// Non-versioned path: copy the current version unless the target already
/// holds the same content.
fn sync_current(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    key: &str,
) -> anyhow::Result<TransferReport> {
    let Some(current) = source.head(key)? else {
        info!(key = %key, source = source.name(), "Source object vanished after listing");
        return Ok(TransferReport::new(key, TransferAction::Vanished));
    };

    if !ctx.options.force {
        if let Some(existing) = target.head(key)? {
            if existing.same_content(&current) {
                debug!(key = %key, "Target already up to date");
                let mut report = TransferReport::new(key, TransferAction::Unchanged);
                report.source_fingerprint = current.fingerprint.clone();
                return Ok(report);
            }
        }
    }

    let timer = ctx.timings.start(OP_WRITE);
    let (written, bytes) = copy_version(ctx, source, target, key, &current, true)?;
    timer.complete();
    debug!(key = %key, version = %written.version_id, bytes, "Object copied");

    let mut report = TransferReport::new(key, TransferAction::Copied);
    report.bytes = bytes;
    report.source_fingerprint = current.fingerprint;
    Ok(report)
}

/// Check that the target already holds what the source has, reading the
/// source content but writing nothing.
fn verify_existing(
    ctx: &RunContext,
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
    key: &str,
    versioned: bool,
) -> anyhow::Result<TransferReport> {
    let timer = ctx.timings.start(OP_VERIFY);
    if versioned {
        let source_chain = source.list_versions(key)?;
        if !source_chain.is_empty() && !target.list_versions(key)?.matches(&source_chain) {
            bail!("Verification failed for {}: target version history differs from source", key);
        }
    }

    let Some(current) = source.head(key)? else {
        timer.complete();
        return Ok(TransferReport::new(key, TransferAction::Vanished));
    };
    let stored = target
        .head(key)?
        .ok_or_else(|| anyhow::anyhow!("Verification failed for {}: missing on {}", key, target.name()))?;

    let mut reader = open_source(ctx, source, key, None)?;
    let bridged = reader.is_bridged();
    io::copy(&mut reader, &mut io::sink())
        .with_context(|| format!("{}: read failed for {}", source.name(), key))?;
    let summary = reader.finish()?;
    if !bridged {
        ctx.stats.add_bytes(summary.bytes);
    }
    verify(key, &current, &stored, &summary)?;
    timer.complete();
    debug!(key = %key, bytes = summary.bytes, "Object verified");

    let mut report = TransferReport::new(key, TransferAction::Verified);
    report.bytes = summary.bytes;
    report.source_fingerprint = current.fingerprint;
    Ok(report)
}
