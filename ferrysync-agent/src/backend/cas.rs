//! Content-addressable versioned store.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/ab/abcdef…   blob named by its SHA-256
//! index/<key>.json     version log of one key, oldest first
//! ```
//!
//! Identical content is stored once. Every write appends a version to the
//! key's log. Reads are push-only: the store copies a blob into a sink it is
//! handed, so the engine reaches it through a stream bridge.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, bail, Context};
use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use ferrysync_common::backend::normalize_key;
use ferrysync_common::{ContentSource, StorageBackend, VersionChain, VersionRecord};

use super::{is_temp_file, write_atomically};

const INDEX_SUFFIX: &str = ".json";

pub struct CasBackend {
    root: PathBuf,
    name: String,
    /// Serializes read-modify-write cycles on version logs.
    index_lock: Mutex<()>,
}

impl CasBackend {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))
            .with_context(|| format!("Failed to create store at {}", root.display()))?;
        fs::create_dir_all(root.join("index"))?;
        let name = format!("cas:{}", root.display());
        Ok(Self { root, name, index_lock: Mutex::new(()) })
    }

    fn index_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let key = normalize_key(key);
        if key.is_empty() {
            bail!("Empty object key");
        }
        Ok(self.root.join("index").join(format!("{}{}", key, INDEX_SUFFIX)))
    }

    fn blob_path(&self, fingerprint: &str) -> PathBuf {
        let shard = fingerprint.get(..2).unwrap_or("00");
        self.root.join("objects").join(shard).join(fingerprint)
    }

    fn load_log(&self, key: &str) -> anyhow::Result<Vec<VersionRecord>> {
        let path = self.index_path(key)?;
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Corrupt version log {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn store_log(&self, key: &str, log: &[VersionRecord]) -> anyhow::Result<()> {
        let path = self.index_path(key)?;
        if log.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("Failed to remove version log"),
            }
            return Ok(());
        }
        let data = serde_json::to_vec_pretty(log)?;
        write_atomically(&path, &mut &data[..])?;
        Ok(())
    }

    /// Append `record` as the newest version of `key`.
    fn append(&self, key: &str, mut record: VersionRecord) -> anyhow::Result<VersionRecord> {
        let _guard = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut log = self.load_log(key)?;
        if let Some(prev) = log.last() {
            if record.created_at <= prev.created_at {
                record.created_at = prev.created_at + Duration::microseconds(1);
            }
        }
        for r in log.iter_mut() {
            r.is_latest = false;
        }
        log.push(record.clone());
        self.store_log(key, &log)?;
        Ok(record)
    }

    /// Store a blob, deduplicating on its fingerprint.
    fn put_blob(&self, content: &mut dyn Read) -> anyhow::Result<(String, u64)> {
        let staging = self.root.join("objects").join(format!("{}{}", Uuid::new_v4().simple(), super::TMP_SUFFIX));
        let (fingerprint, size) = write_atomically(&staging, content)?;
        let dest = self.blob_path(&fingerprint);
        if dest.exists() {
            fs::remove_file(&staging)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&staging, &dest).context("Failed to move blob into place")?;
        }
        Ok((fingerprint, size))
    }
}

impl StorageBackend for CasBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_versions(&self) -> bool {
        true
    }

    fn list_keys(&self) -> anyhow::Result<Vec<String>> {
        let index = self.root.join("index");
        let mut keys = Vec::new();
        for entry in WalkDir::new(&index) {
            let entry = entry.context("Failed to walk index")?;
            if !entry.file_type().is_file() || is_temp_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&index) else {
                continue;
            };
            let rel = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if let Some(key) = rel.strip_suffix(INDEX_SUFFIX) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn list_versions(&self, key: &str) -> anyhow::Result<VersionChain> {
        Ok(VersionChain::new(self.load_log(key)?))
    }

    fn head(&self, key: &str) -> anyhow::Result<Option<VersionRecord>> {
        Ok(self.load_log(key)?.pop().filter(|r| !r.is_delete_marker))
    }

    fn read(&self, key: &str, version_id: Option<&str>) -> anyhow::Result<ContentSource> {
        let log = self.load_log(key)?;
        let record = match version_id {
            Some(id) => log.iter().find(|r| r.version_id == id),
            None => log.last(),
        }
        .ok_or_else(|| anyhow!("{}: no version {:?} of {}", self.name, version_id, key))?;
        if record.is_delete_marker {
            bail!("{}: {} is a delete marker", self.name, key);
        }
        let fingerprint = record
            .fingerprint
            .clone()
            .ok_or_else(|| anyhow!("{}: version {} has no fingerprint", self.name, record.version_id))?;
        let blob = self.blob_path(&fingerprint);
        Ok(ContentSource::Push(Box::new(move |sink: &mut dyn Write| -> anyhow::Result<()> {
            let mut file = fs::File::open(&blob)
                .with_context(|| format!("Missing blob {}", blob.display()))?;
            io::copy(&mut file, sink)?;
            Ok(())
        })))
    }

    fn write_version(
        &self,
        key: &str,
        content: &mut dyn Read,
        is_latest: bool,
    ) -> anyhow::Result<VersionRecord> {
        let (fingerprint, size) = self.put_blob(content)?;
        let record = VersionRecord::content(Uuid::new_v4().to_string(), Utc::now(), fingerprint, size)
            .with_latest(is_latest);
        let record = self.append(key, record)?;
        debug!(key = %key, version = %record.version_id, size, "CAS version stored");
        Ok(record)
    }

    fn write_delete_marker(&self, key: &str) -> anyhow::Result<VersionRecord> {
        let marker = VersionRecord::delete_marker(Uuid::new_v4().to_string(), Utc::now()).with_latest(true);
        let marker = self.append(key, marker)?;
        debug!(key = %key, version = %marker.version_id, "CAS delete marker stored");
        Ok(marker)
    }

    // TODO: blobs are never garbage-collected; a sweep over all version logs
    // could remove those no record references.
    fn delete_version(&self, key: &str, version_id: &str) -> anyhow::Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut log = self.load_log(key)?;
        log.retain(|r| r.version_id != version_id);
        self.store_log(key, &log)?;
        debug!(key = %key, version = %version_id, "CAS version deleted");
        Ok(())
    }
}
