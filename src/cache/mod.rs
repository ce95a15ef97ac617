//! Response caching with TTL and canonical keys over a shared store.

pub mod response_cache;

pub use response_cache::{CacheLookup, ResponseCache};
