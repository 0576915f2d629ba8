pub mod error;
pub mod kv;
pub mod layer;

pub use error::{CacheError, Result};
pub use kv::{CacheConfig, KvStore, MemoryStore, RedisStore};
pub use layer::{CacheLayer, RequestCache};
