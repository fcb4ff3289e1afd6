//! Two-tier binary object cache
//!
//! A bounded in-memory LRU cache backed by a bounded, persistent, journaled
//! on-disk LRU cache. Callers fetch a value by key; on a total miss they fetch
//! from an origin and the result is written through to both tiers. Origin
//! fetches and value encoding/decoding are supplied by the caller (see
//! [`Codec`] and [`TieredCache::get_or_fetch`]).

mod coordinator;
mod disk;
mod error;
mod format;
mod key;
mod lru;
mod memory;

pub use coordinator::{CacheStats, Codec, TieredCache};
pub use disk::{DiskCache, Editor};
pub use error::{CacheError, Result};
pub use format::format_size;
pub use key::cache_key;
pub use memory::MemoryCache;
