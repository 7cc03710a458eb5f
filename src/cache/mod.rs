//! Prefix-indexed KV cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`layout`]: KvLayout, KvState
//! - [`block`]: fixed-capacity slot blocks and their persisted image
//! - [`arena`]: block lineage, allocation, Split, pending deletion
//! - [`tree`]: radix tree over token paths
//! - [`builder`]: mutable revision (Query, Update, Split, Delete, Merge, Seal)
//! - [`sealed`]: immutable published snapshot and Resolve
//! - [`version`]: published-version authority
//! - [`evictor`]: leaf eviction policy
//! - [`validate`]: invariant checks shared by Build and Resolve

pub mod arena;
pub mod block;
pub mod builder;
pub mod evictor;
pub mod layout;
pub mod sealed;
pub mod tree;
pub mod validate;
pub mod version;

pub use builder::{BuilderState, BuilderStats, CacheBuilder, MergeReport};
pub use evictor::Evictor;
pub use layout::{KvLayout, KvState};
pub use sealed::{Cache, CacheMeta};
pub use tree::{NodeHandle, Token};
pub use version::VersionAuthority;
