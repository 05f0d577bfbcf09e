//! Redis backends for the counter store and the distributed locker.
//!
//! Both adapters share a [`ConnectionManager`](redis::aio::ConnectionManager),
//! which reconnects internally, so transient broker hiccups surface as
//! per-command errors rather than a dead client.

mod counter;
mod lock;

pub use counter::RedisCounterStore;
pub use lock::{RedisLocker, RedisLockerConfig};
