//! Version chain reconciliation.
//!
//! [`decide`] compares the version chain of a key on the source with the
//! chain on the target and picks the smallest correct plan:
//!
//! - `Skip` when the chains already match position for position
//! - `AppendNew` when the target is a clean prefix of the source
//! - `ReplaceAll` on any divergence, when the target is longer, or in
//!   forced mode
//!
//! [`VersionReconciler`] executes that plan against the two backends.
//! Replay is strictly sequential and oldest first; the first backend error
//! aborts it with no rollback, and a later run converges from wherever the
//! target was left.

use std::sync::atomic::Ordering;

use tracing::{debug, info};

use ferrysync_common::{StorageBackend, VersionChain, VersionRecord};

use crate::context::RunContext;
use crate::transfer::{copy_version, TransferAction, TransferReport};

pub const OP_REPLAY: &str = "ReplayVersion";
pub const OP_DELETE: &str = "DeleteVersion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip,
    /// Source records missing from the target, oldest first. Excludes a live
    /// latest version, which is written through the ordinary object path.
    AppendNew(Vec<VersionRecord>),
    ReplaceAll,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Skip => "skip",
            Decision::AppendNew(_) => "append_new",
            Decision::ReplaceAll => "replace_all",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The source chain cannot be reasoned about; sync the current version
    /// without history instead.
    #[error("source version chain is empty")]
    Inconsistent,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Decide how to bring `target` in line with `source`.
pub fn decide(
    source: &VersionChain,
    target: &VersionChain,
    forced: bool,
) -> Result<Decision, ReconcileError> {
    if source.is_empty() {
        return Err(ReconcileError::Inconsistent);
    }
    if forced {
        return Ok(Decision::ReplaceAll);
    }

    let src = source.records();
    let dst = target.records();
    for (i, record) in src.iter().enumerate() {
        match dst.get(i) {
            Some(existing) if record.same_content(existing) => continue,
            Some(_) => return Ok(Decision::ReplaceAll),
            None => {
                let mut suffix = src[i..].to_vec();
                if suffix.last().is_some_and(VersionRecord::is_live_latest) {
                    suffix.pop();
                }
                return Ok(Decision::AppendNew(suffix));
            }
        }
    }

    if dst.len() > src.len() {
        Ok(Decision::ReplaceAll)
    } else {
        Ok(Decision::Skip)
    }
}

/// Executes reconciliation decisions for one source/target pair.
pub struct VersionReconciler<'a> {
    ctx: &'a RunContext,
    source: &'a dyn StorageBackend,
    target: &'a dyn StorageBackend,
}

impl<'a> VersionReconciler<'a> {
    pub fn new(
        ctx: &'a RunContext,
        source: &'a dyn StorageBackend,
        target: &'a dyn StorageBackend,
    ) -> Self {
        Self { ctx, source, target }
    }

    pub fn sync_key(&self, key: &str) -> Result<TransferReport, ReconcileError> {
        let source_chain = self.source.list_versions(key)?;
        let target_chain = self.target.list_versions(key)?;
        let decision = decide(&source_chain, &target_chain, self.ctx.options.force)?;

        let action = match &decision {
            Decision::Skip => TransferAction::Unchanged,
            Decision::AppendNew(_) => TransferAction::Appended,
            Decision::ReplaceAll => TransferAction::Replaced,
        };
        let mut report = TransferReport::new(key, action);
        report.source_fingerprint = source_chain.newest().and_then(|r| r.fingerprint.clone());

        match &decision {
            Decision::Skip => {
                debug!(key = %key, versions = source_chain.len(), "Version chains already match");
                return Ok(report);
            }
            Decision::AppendNew(suffix) => {
                self.replay(key, suffix, &mut report)?;
            }
            Decision::ReplaceAll => {
                self.delete_all(key, &target_chain, &mut report)?;
                self.replay(key, source_chain.history(), &mut report)?;
            }
        }
        self.write_current(key, &source_chain, &mut report)?;

        info!(
            key = %key,
            decision = decision.label(),
            replayed = report.versions_replayed,
            deleted = report.versions_deleted,
            "Version chain reconciled"
        );
        Ok(report)
    }

    /// Delete every target version, newest first.
    fn delete_all(
        &self,
        key: &str,
        chain: &VersionChain,
        report: &mut TransferReport,
    ) -> anyhow::Result<()> {
        for record in chain.iter().rev() {
            let timer = self.ctx.timings.start(OP_DELETE);
            self.target.delete_version(key, &record.version_id)?;
            timer.complete();
            report.versions_deleted += 1;
            self.ctx.stats.versions_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Replay records oldest first as non-latest versions.
    fn replay(
        &self,
        key: &str,
        records: &[VersionRecord],
        report: &mut TransferReport,
    ) -> anyhow::Result<()> {
        for record in records {
            let timer = self.ctx.timings.start(OP_REPLAY);
            if record.is_delete_marker {
                self.target.write_delete_marker(key)?;
            } else {
                let (_, bytes) =
                    copy_version(self.ctx, self.source, self.target, key, record, false)?;
                report.bytes += bytes;
            }
            timer.complete();
            debug!(key = %key, version = %record.version_id, delete_marker = record.is_delete_marker, "Version replayed");
            report.versions_replayed += 1;
            self.ctx.stats.versions_replayed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn write_current(
        &self,
        key: &str,
        chain: &VersionChain,
        report: &mut TransferReport,
    ) -> anyhow::Result<()> {
        if let Some(current) = chain.newest().filter(|r| r.is_live_latest()) {
            let (_, bytes) = copy_version(self.ctx, self.source, self.target, key, current, true)?;
            report.bytes += bytes;
        }
        Ok(())
    }
}
