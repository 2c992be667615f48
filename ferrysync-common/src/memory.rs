//! In-process backend.
//!
//! Keeps every version of every key in memory. Used for dry runs and as the
//! collaborator in engine tests. Reads can be switched to push style to
//! exercise the same path a push-only SDK takes.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{content_fingerprint, ContentSource, StorageBackend};
use crate::versions::{VersionChain, VersionRecord};

struct StoredVersion {
    record: VersionRecord,
    data: Bytes,
}

pub struct MemoryBackend {
    name: String,
    versioned: bool,
    push_reads: AtomicBool,
    failing_writes: AtomicUsize,
    objects: Mutex<BTreeMap<String, Vec<StoredVersion>>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, versioned: bool) -> Self {
        Self {
            name: name.into(),
            versioned,
            push_reads: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Serve reads as `ContentSource::Push` instead of readers.
    pub fn set_push_reads(&self, push: bool) {
        self.push_reads.store(push, Ordering::SeqCst);
    }

    /// Make the next `n` writes (content or delete marker) fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Insert a version verbatim, keeping the caller's record metadata.
    pub fn insert_version(&self, key: &str, record: VersionRecord, data: impl Into<Bytes>) {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = objects.entry(key.to_string()).or_default();
        versions.push(StoredVersion { record, data: data.into() });
        versions.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.version_id.cmp(&b.record.version_id))
        });
    }

    /// Convenience for tests: store `data` as the new current version.
    pub fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<VersionRecord> {
        self.write_version(key, &mut &data[..], true)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn append(&self, key: &str, mut record: VersionRecord, data: Bytes) -> VersionRecord {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = objects.entry(key.to_string()).or_default();

        // Creation times must strictly increase within a key.
        if let Some(prev) = versions.last() {
            if record.created_at <= prev.record.created_at {
                record.created_at = prev.record.created_at + Duration::milliseconds(1);
            }
        }

        if self.versioned {
            for v in versions.iter_mut() {
                v.record.is_latest = false;
            }
        } else {
            versions.clear();
        }
        versions.push(StoredVersion { record: record.clone(), data });
        record
    }

    fn find(&self, key: &str, version_id: Option<&str>) -> anyhow::Result<Bytes> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = objects
            .get(key)
            .ok_or_else(|| anyhow!("{}: object not found: {}", self.name, key))?;
        let found = match version_id {
            Some(id) => versions.iter().find(|v| v.record.version_id == id),
            None => versions.last(),
        };
        match found {
            Some(v) if v.record.is_delete_marker => {
                bail!("{}: {} is a delete marker", self.name, key)
            }
            Some(v) => Ok(v.data.clone()),
            None => bail!("{}: version {:?} of {} not found", self.name, version_id, key),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_versions(&self) -> bool {
        self.versioned
    }

    fn list_keys(&self) -> anyhow::Result<Vec<String>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.keys().cloned().collect())
    }

    fn list_versions(&self, key: &str) -> anyhow::Result<VersionChain> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let records = objects
            .get(key)
            .map(|vs| vs.iter().map(|v| v.record.clone()).collect())
            .unwrap_or_default();
        Ok(VersionChain::new(records))
    }

    fn head(&self, key: &str) -> anyhow::Result<Option<VersionRecord>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .get(key)
            .and_then(|vs| vs.last())
            .filter(|v| !v.record.is_delete_marker)
            .map(|v| v.record.clone()))
    }

    fn read(&self, key: &str, version_id: Option<&str>) -> anyhow::Result<ContentSource> {
        let data = self.find(key, version_id)?;
        if self.push_reads.load(Ordering::SeqCst) {
            Ok(ContentSource::Push(Box::new(move |sink: &mut dyn Write| -> anyhow::Result<()> {
                // Push in small pieces so bridge buffers fill and drain.
                for chunk in data.chunks(4096) {
                    sink.write_all(chunk)?;
                }
                Ok(())
            })))
        } else {
            Ok(ContentSource::Pull(Box::new(std::io::Cursor::new(data))))
        }
    }

    fn write_version(
        &self,
        key: &str,
        content: &mut dyn Read,
        is_latest: bool,
    ) -> anyhow::Result<VersionRecord> {
        let mut buf = Vec::new();
        content.read_to_end(&mut buf)?;
        if self.take_write_failure() {
            bail!("{}: injected write failure for {}", self.name, key);
        }
        let record = VersionRecord::content(
            Uuid::new_v4().to_string(),
            Self::now(),
            content_fingerprint(&buf),
            buf.len() as u64,
        )
        .with_latest(is_latest || !self.versioned);
        let record = self.append(key, record, Bytes::from(buf));
        debug!(backend = %self.name, key = %key, version = %record.version_id, "Memory write complete");
        Ok(record)
    }

    fn write_delete_marker(&self, key: &str) -> anyhow::Result<VersionRecord> {
        if self.take_write_failure() {
            bail!("{}: injected write failure for {}", self.name, key);
        }
        let marker = VersionRecord::delete_marker(Uuid::new_v4().to_string(), Self::now())
            .with_latest(true);
        if !self.versioned {
            let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
            objects.remove(key);
            return Ok(marker);
        }
        Ok(self.append(key, marker, Bytes::new()))
    }

    fn delete_version(&self, key: &str, version_id: &str) -> anyhow::Result<()> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(versions) = objects.get_mut(key) {
            versions.retain(|v| v.record.version_id != version_id);
            if versions.is_empty() {
                objects.remove(key);
            }
        }
        Ok(())
    }
}
