//! Local directory backend.
//!
//! Plain files under a base directory, one per key. Unversioned: each key
//! reports its current file as a single latest version. Writes are atomic
//! (temp file → fsync → rename) so a failed transfer never leaves a partial
//! object behind.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use ferrysync_common::backend::{normalize_key, HashingReader};
use ferrysync_common::{ContentSource, StorageBackend, VersionChain, VersionRecord};

use super::{is_temp_file, write_atomically};

pub struct DirectoryBackend {
    base_path: PathBuf,
    name: String,
}

impl DirectoryBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let name = format!("directory:{}", base_path.display());
        Self { base_path, name }
    }

    fn full_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        // normalize_key strips `..` segments, so the result stays under base_path
        let key = normalize_key(key);
        if key.is_empty() {
            bail!("Empty object key");
        }
        Ok(self.base_path.join(key))
    }

    /// The file's modification time doubles as its version id.
    fn version_id(meta: &fs::Metadata) -> anyhow::Result<(String, DateTime<Utc>)> {
        let modified = meta.modified().context("File has no modification time")?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok((nanos.to_string(), DateTime::<Utc>::from(modified)))
    }

    fn current(&self, key: &str) -> anyhow::Result<Option<VersionRecord>> {
        let path = self.full_path(key)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        };
        let (version_id, created_at) = Self::version_id(&meta)?;
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = HashingReader::new(file);
        io::copy(&mut reader, &mut io::sink())
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (fingerprint, size) = reader.finish();
        Ok(Some(
            VersionRecord::content(version_id, created_at, fingerprint, size).with_latest(true),
        ))
    }
}

impl StorageBackend for DirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.base_path.exists() {
            return Ok(keys);
        }
        for entry in WalkDir::new(&self.base_path).follow_links(false) {
            let entry = entry.context("Failed to walk directory")?;
            if !entry.file_type().is_file() || is_temp_file(entry.path()) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.base_path) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn list_versions(&self, key: &str) -> anyhow::Result<VersionChain> {
        Ok(VersionChain::new(self.current(key)?.into_iter().collect()))
    }

    fn head(&self, key: &str) -> anyhow::Result<Option<VersionRecord>> {
        self.current(key)
    }

    /// There is only ever one version, so `version_id` is not consulted.
    fn read(&self, key: &str, _version_id: Option<&str>) -> anyhow::Result<ContentSource> {
        let path = self.full_path(key)?;
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(ContentSource::Pull(Box::new(file)))
    }

    fn write_version(
        &self,
        key: &str,
        content: &mut dyn Read,
        _is_latest: bool,
    ) -> anyhow::Result<VersionRecord> {
        let dest = self.full_path(key)?;
        let (fingerprint, size) = write_atomically(&dest, content)?;
        let meta = fs::metadata(&dest)?;
        let (version_id, created_at) = Self::version_id(&meta)?;
        debug!(key = %key, size, "Directory write complete");
        Ok(VersionRecord::content(version_id, created_at, fingerprint, size).with_latest(true))
    }

    fn write_delete_marker(&self, key: &str) -> anyhow::Result<VersionRecord> {
        self.delete_file(key)?;
        Ok(VersionRecord::delete_marker(Uuid::new_v4().to_string(), Utc::now()).with_latest(true))
    }

    fn delete_version(&self, key: &str, _version_id: &str) -> anyhow::Result<()> {
        self.delete_file(key)
    }
}

impl DirectoryBackend {
    fn delete_file(&self, key: &str) -> anyhow::Result<()> {
        let path = self.full_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to delete file"),
        }
        self.prune_empty_dirs(&path);
        debug!(key = %key, "Directory delete complete");
        Ok(())
    }

    /// Remove now-empty parent directories up to (not including) the base.
    fn prune_empty_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.base_path || !d.starts_with(&self.base_path) {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(backend: &DirectoryBackend, key: &str) -> Vec<u8> {
        match backend.read(key, None).unwrap() {
            ContentSource::Pull(mut r) => {
                let mut out = Vec::new();
                r.read_to_end(&mut out).unwrap();
                out
            }
            ContentSource::Push(_) => panic!("directory reads are pull-style"),
        }
    }

    #[test]
    fn test_directory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path());

        let record = backend
            .write_version("test/subdir/file.txt", &mut &b"hello world"[..], true)
            .unwrap();
        assert_eq!(record.size, 11);
        assert!(record.is_live_latest());
        assert_eq!(read_all(&backend, "test/subdir/file.txt"), b"hello world");

        let head = backend.head("test/subdir/file.txt").unwrap().unwrap();
        assert_eq!(head.fingerprint, record.fingerprint);
        assert_eq!(backend.list_keys().unwrap(), vec!["test/subdir/file.txt".to_string()]);
        assert_eq!(backend.list_versions("test/subdir/file.txt").unwrap().len(), 1);

        backend.write_delete_marker("test/subdir/file.txt").unwrap();
        assert!(backend.head("test/subdir/file.txt").unwrap().is_none());
        assert!(backend.list_versions("test/subdir/file.txt").unwrap().is_empty());
        assert!(!dir.path().join("test").exists());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path());
        backend.write_version("a", &mut &b"one"[..], true).unwrap();
        backend.write_version("a", &mut &b"two"[..], true).unwrap();
        assert_eq!(read_all(&backend, "a"), b"two");
        assert!(!backend.supports_versions());
    }

    #[test]
    fn test_path_traversal_stays_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let backend = DirectoryBackend::new(&base);
        backend
            .write_version("../../../etc/passwd", &mut &b"malicious"[..], true)
            .unwrap();
        assert!(base.join("etc/passwd").exists());
        assert!(backend.full_path("..").is_err());
    }

    #[test]
    fn test_missing_base_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(dir.path().join("nope"));
        assert!(backend.list_keys().unwrap().is_empty());
        assert!(backend.head("k").unwrap().is_none());
        backend.delete_version("k", "any").unwrap();
    }
}
