//! Clinic Cache - Tagged TTL/LRU Cache
//!
//! A two-tier cache for repository reads:
//!
//! - **Memory tier**: authoritative `HashMap` bounded by an LRU entry cap
//! - **Persistent mirror**: best-effort copy of every entry in a
//!   [`PersistentMirror`] ([`MemoryMirror`] or LMDB-backed [`LmdbMirror`])
//! - **Tags**: `tag:<name>` index entries listing the keys carrying a tag,
//!   so whole groups can be invalidated at once
//!
//! All operations are serialized through an [`OperationQueue`] so tag index
//! updates never lose writes under concurrency.
//!
//! # Example
//!
//! ```ignore
//! use clinic_cache::CacheStore;
//! use clinic_core::CacheConfig;
//! use serde_json::json;
//!
//! let store = CacheStore::in_memory(CacheConfig::default())?;
//! store.set_with_tags("patients:findAll:{}", json!([]), &["patients"], None).await?;
//! store.invalidate_by_tag("patients").await?;
//! ```

mod entry;
mod lmdb_mirror;
mod mirror;
mod queue;
mod stats;
mod store;
mod sweeper;

pub use entry::CacheEntry;
pub use lmdb_mirror::LmdbMirror;
pub use mirror::{MemoryMirror, PersistentMirror};
pub use queue::OperationQueue;
pub use stats::CacheStoreStats;
pub use store::{tag_key, CacheStore, TAG_PREFIX};
