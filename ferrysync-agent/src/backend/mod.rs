pub mod cas;
pub mod directory;

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use uuid::Uuid;

use ferrysync_common::backend::HashingReader;
use ferrysync_common::memory::MemoryBackend;
use ferrysync_common::StorageBackend;

use crate::config::{BackendConfig, BackendKind};

use self::cas::CasBackend;
use self::directory::DirectoryBackend;

/// Suffix of in-flight temp files; listings skip them.
pub const TMP_SUFFIX: &str = ".ferrysync-tmp";

/// Construct a backend from its `[source]` / `[target]` table.
pub fn from_config(config: &BackendConfig, role: &str) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let path = || {
        config
            .path
            .as_deref()
            .ok_or_else(|| anyhow!("{} backend requires a path", role))
    };
    match config.kind {
        BackendKind::Directory => Ok(Arc::new(DirectoryBackend::new(path()?))),
        BackendKind::Cas => Ok(Arc::new(CasBackend::open(path()?)?)),
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new(role, true))),
    }
}

/// Stream `content` into `dest` atomically (temp file, fsync, rename).
/// Returns the SHA-256 fingerprint and size of what was written.
pub(crate) fn write_atomically(dest: &Path, content: &mut dyn Read) -> anyhow::Result<(String, u64)> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {}", dest.display()))?;
    fs::create_dir_all(parent).context("Failed to create parent directory")?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}{}", file_name, Uuid::new_v4().simple(), TMP_SUFFIX));

    let result = (|| -> anyhow::Result<(String, u64)> {
        let mut file = fs::File::create(&tmp_path).context("Failed to create temp file")?;
        let mut reader = HashingReader::new(content);
        io::copy(&mut reader, &mut file).context("Failed to write temp file")?;
        file.sync_all().context("fsync failed")?;
        drop(file);
        fs::rename(&tmp_path, dest).context("Atomic rename failed")?;
        Ok(reader.finish())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Whether a listed file name belongs to an unfinished write.
pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_write_atomically_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/file.txt");
        let (fp, size) = write_atomically(&dest, &mut &b"hello world"[..]).unwrap();
        assert_eq!(size, 11);
        assert_eq!(fp, ferrysync_common::backend::content_fingerprint(b"hello world"));
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
        let leftovers: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_write_cleans_up() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "source dropped"))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        assert!(write_atomically(&dest, &mut Broken).is_err());
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig { kind: BackendKind::Cas, path: Some(dir.path().to_path_buf()) };
        let backend = from_config(&config, "target").unwrap();
        assert!(backend.supports_versions());

        let missing = BackendConfig { kind: BackendKind::Directory, path: None::<PathBuf> };
        assert!(from_config(&missing, "source").is_err());

        let memory = BackendConfig { kind: BackendKind::Memory, path: None };
        assert_eq!(from_config(&memory, "source").unwrap().name(), "source");
    }
}
