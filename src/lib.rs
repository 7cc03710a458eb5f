//! kv-radix-cache: prefix-indexed KV-state cache for LLM inference.
//!
//! Token paths are indexed by a radix tree; each cached token's per-layer KV
//! state lives in a slot of a fixed-capacity block. Mutations go through a
//! [`CacheBuilder`](cache::CacheBuilder) revision that is sealed into an
//! immutable [`Cache`](cache::Cache) for lock-free concurrent readers.

pub mod cache;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;

pub use error::{CacheError, Result};
