//! kvstore - key-value store contract for studiod
//!
//! Abstracts the remote store the daemon keeps job state in: string keys
//! with TTLs, atomic counters, sorted sets used as priority queues, and
//! fire-and-forget pub/sub. Three implementations share the contract:
//!
//! - [`RedisKv`] - the remote store, one Redis command per operation
//! - [`MemoryKv`] - in-process shim with identical semantics but no
//!   cross-restart durability
//! - [`FailoverKv`] - prefers the remote store and degrades to the shim,
//!   reconciling fallback writes when the remote comes back

mod error;
mod failover;
mod kv;
mod memory;
mod remote;

pub use error::KvError;
pub use failover::FailoverKv;
pub use kv::{Kv, Subscription, ZEntry};
pub use memory::MemoryKv;
pub use remote::RedisKv;
