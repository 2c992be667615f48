use std::fmt;
use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use crate::versions::{VersionChain, VersionRecord};

/// A push-style content producer: handed a sink, it blocks until the whole
/// payload has been written into it.
pub type PushFn = Box<dyn FnOnce(&mut dyn Write) -> anyhow::Result<()> + Send>;

/// How a backend hands out object content.
///
/// Most backends can return a reader. Some native SDKs can only push data
/// into a caller-supplied sink; those return `Push` and the engine adapts
/// them through a stream bridge.
pub enum ContentSource {
    Pull(Box<dyn Read + Send>),
    Push(PushFn),
}

impl ContentSource {
    pub fn is_push(&self) -> bool {
        matches!(self, ContentSource::Push(_))
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Pull(_) => f.write_str("ContentSource::Pull"),
            ContentSource::Push(_) => f.write_str("ContentSource::Push"),
        }
    }
}

/// Trait implemented by all storage backend adapters.
///
/// Adapters run on pool worker threads and may block. The engine is
/// responsible for scheduling, version reconciliation and stream adaptation;
/// the adapter only lists, reads, writes and deletes.
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether the backend keeps more than one version per key.
    fn supports_versions(&self) -> bool {
        false
    }

    /// List every object key in the backend.
    fn list_keys(&self) -> anyhow::Result<Vec<String>>;

    /// Read the full version chain of a key. Unversioned backends report the
    /// current object as a single latest record.
    fn list_versions(&self, key: &str) -> anyhow::Result<VersionChain>;

    /// The current version of a key, or `None` if it does not exist.
    fn head(&self, key: &str) -> anyhow::Result<Option<VersionRecord>>;

    /// Open the content of a version (`None` = current version).
    fn read(&self, key: &str, version_id: Option<&str>) -> anyhow::Result<ContentSource>;

    /// Store new content under `key`, appending a version on versioned
    /// backends. `is_latest` is false while replaying history.
    fn write_version(
        &self,
        key: &str,
        content: &mut dyn Read,
        is_latest: bool,
    ) -> anyhow::Result<VersionRecord>;

    /// Record a deletion. Versioned backends append a delete marker;
    /// unversioned backends remove the object.
    fn write_delete_marker(&self, key: &str) -> anyhow::Result<VersionRecord>;

    /// Permanently remove one version of a key.
    fn delete_version(&self, key: &str, version_id: &str) -> anyhow::Result<()>;
}

/// Normalize an object key: forward slashes, no leading slash, no empty,
/// `.` or `..` segments.
pub fn normalize_key(key: &str) -> String {
    key.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Hex SHA-256 of a byte slice, the fingerprint format used by every
/// bundled backend.
pub fn content_fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Reader wrapper that fingerprints and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, hasher: Sha256::new(), bytes: 0 }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Consume the wrapper, returning `(hex digest, byte count)`.
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("/photos/2024/img.jpg"), "photos/2024/img.jpg");
        assert_eq!(normalize_key("a//b/./c"), "a/b/c");
        assert_eq!(normalize_key("../../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_key("dir\\file.txt"), "dir/file.txt");
        assert_eq!(normalize_key(""), "");
    }

    #[test]
    fn test_hashing_reader_matches_fingerprint() {
        let data = b"hello world".to_vec();
        let mut reader = HashingReader::new(&data[..]);
        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();
        let (digest, bytes) = reader.finish();
        assert_eq!(bytes, 11);
        assert_eq!(digest, content_fingerprint(&data));
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
