pub mod bridge;
pub mod context;
pub mod pool;
pub mod queue;
pub mod reconcile;
pub mod throttle;
pub mod timing;
pub mod transfer;

pub use bridge::{BridgeError, BridgeReader, BridgeWriter, StreamBridge};
pub use context::{RunContext, StatsSnapshot, SyncOptions, TransferStats};
pub use pool::{PoolConfig, PoolError, TaskError, TaskHandle, WorkerPool};
pub use reconcile::{decide, Decision, ReconcileError, VersionReconciler};
pub use throttle::TokenBucket;
pub use transfer::{transfer_object, uses_versions, TransferAction, TransferReport};
