// # Coordination Plane
//
// Instance registry with heartbeat and leader election, distributed locks
// with preemption, lock-protected consistent caching, and cross-instance
// state synchronization. All coordination records live in the L2 KV store
// behind the cache service; L1 copies are derived and never authoritative.

pub mod consistent;
pub mod coordinator;
pub mod state_sync;

pub use consistent::ConsistentCache;
pub use coordinator::{InstanceCoordinator, InstanceRecord, InstanceStatus, LockRecord};
pub use state_sync::{StateSynchronizer, SyncEvent};
