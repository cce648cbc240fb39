//! Broker backends living outside `drawq-messaging` because they need IO crates.

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::{Frame, RedisChannel, RedisConnector};
