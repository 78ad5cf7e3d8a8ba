//! The per-item cache engine: content-signature computation, entry
//! persistence, and two-tier (timestamp → hash) validation.

pub mod entry;
pub mod store;

pub use entry::{CacheEntry, UpstreamSignature, sanitize_segment};
pub use store::{FsCacheStore, UpstreamSignatureLookup};
