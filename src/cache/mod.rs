//! Page cache building blocks.
//!
//! - **Key policy**: decides which requests are cached and under which key
//! - **Store**: async key-value contract plus memory and tiered backends
//! - **Codec**: render result <-> stored bytes
//! - **Version gate**: drops the store when the application version changes
//!
//! ## Configuration
//!
//! ```toml
//! version = "1.4.0"
//!
//! [cache]
//! pages = ["/about", "/posts/"]
//! patterns = ['^/tags/[a-z-]+$']
//! use_host_prefix = false
//! entry_ttl_seconds = 3600
//!
//! [cache.store]
//! backend = "memory"
//! capacity = 1000
//! ```

mod codec;
mod config;
mod keys;
pub(crate) mod lock;
mod store;
mod version;

pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{CacheConfig, build_store};
pub use keys::{KeyPolicy, RouteKeyPolicy, RoutePattern};
pub use store::{CacheStore, MemoryStore, StoreError, TieredStore};
pub use version::{ReconcileOutcome, VERSION_KEY, VersionGate};
