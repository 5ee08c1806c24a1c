//! memolock - Distributed memoization lock backed by Redis
//!
//! This library coordinates concurrent requests across many processes so
//! that for any cache key, at most one fetch of the underlying expensive
//! resource is in progress at a time. Every other concurrent caller, local
//! or on another node, waits on a pub/sub notification and receives the
//! computed value without fetching.
//!
//! The cache supports:
//! - Atomic lock acquisition via `SET NX PX` with a TTL'd lock sentinel
//! - In-process deduplication of lock attempts for locally raced keys
//! - One upstream subscription per done channel, fanned out to all waiters
//! - Timeout-driven retry with a bounded attempt count
//! - Pluggable value codecs (JSON by default) and per-value TTLs
//! - A typed client surface binding key derivation and a fetch function
//!
//! This is not a strongly consistent distributed lock: under partitions or
//! an expired lock sentinel more than one fetch may run. The guarantee is
//! progress (every caller eventually gets a value or an error) and no
//! duplicate work in normal operation.

mod client;
mod config;
mod error;
mod memolock;
mod multiplexer;
mod store;
#[cfg(test)]
pub(crate) mod testutil;

pub use client::{Fetcher, KeyMapper, MemolockClient};
pub use config::{DecodeFn, EncodeFn, ErrorHandler, GetOptions, MemolockConfig, TtlSpec};
pub use error::{BoxError, MemolockError};
pub use memolock::{Cacheable, Memolock};
pub use multiplexer::{Multiplexer, WaitError};
pub use store::{
    CommandStore, MessageHandler, PipelineOp, RedisCommandStore, RedisSubscriber, SubscriberStore,
};

// Re-export async_trait for implementing Fetcher and the store traits.
pub use async_trait::async_trait;
