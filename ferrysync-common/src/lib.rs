pub mod backend;
pub mod memory;
pub mod versions;

pub use backend::{ContentSource, StorageBackend};
pub use versions::{VersionChain, VersionRecord};
