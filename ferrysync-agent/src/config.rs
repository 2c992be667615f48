use std::path::{Path, PathBuf};

use serde::Deserialize;

use ferrysync_engine::bridge::DEFAULT_BUFFER_SIZE;
use ferrysync_engine::pool::{PoolConfig, DEFAULT_THREADS, QUEUE_SLOTS_PER_THREAD};
use ferrysync_engine::SyncOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Directory,
    Cas,
    Memory,
}

impl BackendKind {
    fn needs_path(self) -> bool {
        !matches!(self, BackendKind::Memory)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Defaults to `threads * 20`.
    #[serde(default)]
    pub queue_size: Option<usize>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_true")]
    pub include_versions: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub verify_only: bool,
    #[serde(default)]
    pub delete_source: bool,
    /// Bytes per second read from the source.
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    /// Objects per second.
    #[serde(default)]
    pub throughput_limit: Option<u64>,
    #[serde(default = "default_timing_window")]
    pub timing_window: u64,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    pub source: BackendConfig,
    pub target: BackendConfig,
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

fn default_timing_window() -> u64 {
    1000
}

impl SyncConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: SyncConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        if self.queue_size == Some(0) {
            anyhow::bail!("queue_size must be at least 1");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be at least 1");
        }
        if self.bandwidth_limit == Some(0) || self.throughput_limit == Some(0) {
            anyhow::bail!("bandwidth_limit and throughput_limit must be at least 1 when set");
        }
        for (role, backend) in [("source", &self.source), ("target", &self.target)] {
            match (&backend.path, backend.kind.needs_path()) {
                (None, true) => anyhow::bail!("{} backend requires a path", role),
                (Some(p), true) if !p.is_absolute() => {
                    anyhow::bail!("{} path must be absolute: {}", role, p.display())
                }
                _ => {}
            }
        }
        if self.source.kind.needs_path()
            && self.source.kind == self.target.kind
            && self.source.path == self.target.path
        {
            anyhow::bail!("source and target must be different locations");
        }
        if let Some(p) = &self.ledger_path {
            if !p.is_absolute() {
                anyhow::bail!("ledger_path must be absolute: {}", p.display());
            }
        }
        Ok(())
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_size
            .unwrap_or_else(|| self.threads.saturating_mul(QUEUE_SLOTS_PER_THREAD))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.threads).with_queue_capacity(self.queue_capacity())
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            buffer_size: self.buffer_size,
            include_versions: self.include_versions,
            force: self.force,
            verify: self.verify,
            verify_only: self.verify_only,
            delete_source: self.delete_source,
            bandwidth_limit: self.bandwidth_limit,
            throughput_limit: self.throughput_limit,
            timing_window: self.timing_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> SyncConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse(
            r#"
[source]
type = "directory"
path = "/data/in"

[target]
type = "cas"
path = "/data/out"
"#,
        );
        config.validate().unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.queue_capacity(), 160);
        assert_eq!(config.buffer_size, 262144);
        assert!(config.include_versions);
        assert!(!config.force);
        assert_eq!(config.target.kind, BackendKind::Cas);
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(
            r#"
threads = 4
queue_size = 10
buffer_size = 1024
include_versions = false
force = true
verify = true
timing_window = 0
ledger_path = "/var/lib/ferrysync/status.db"

[source]
type = "memory"

[target]
type = "directory"
path = "/data/out"
"#,
        );
        config.validate().unwrap();
        let pool = config.pool_config();
        assert_eq!((pool.threads, pool.queue_capacity), (4, 10));
        let options = config.sync_options();
        assert!(options.force && options.verify && !options.include_versions);
        assert_eq!(options.buffer_size, 1024);
        assert!(!options.verify_only && !options.delete_source);
        assert_eq!(options.bandwidth_limit, None);
    }

    #[test]
    fn test_parse_limits_and_source_options() {
        let config = parse(
            r#"
verify_only = true
delete_source = true
bandwidth_limit = 1048576
throughput_limit = 50

[source]
type = "memory"

[target]
type = "memory"
"#,
        );
        config.validate().unwrap();
        let options = config.sync_options();
        assert!(options.verify_only && options.delete_source);
        assert_eq!(options.bandwidth_limit, Some(1_048_576));
        assert_eq!(options.throughput_limit, Some(50));

        let zero = parse(
            r#"
bandwidth_limit = 0
[source]
type = "memory"
[target]
type = "memory"
"#,
        );
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let zero_threads = parse(
            r#"
threads = 0
[source]
type = "memory"
[target]
type = "memory"
"#,
        );
        assert!(zero_threads.validate().is_err());

        let relative = parse(
            r#"
[source]
type = "directory"
path = "relative/in"
[target]
type = "memory"
"#,
        );
        assert!(relative.validate().is_err());

        let missing_path = parse(
            r#"
[source]
type = "cas"
[target]
type = "memory"
"#,
        );
        assert!(missing_path.validate().is_err());

        let same = parse(
            r#"
[source]
type = "directory"
path = "/data"
[target]
type = "directory"
path = "/data"
"#,
        );
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_type() {
        let result: Result<SyncConfig, _> = toml::from_str(
            r#"
[source]
type = "s3"
[target]
type = "memory"
"#,
        );
        assert!(result.is_err());
    }
}
