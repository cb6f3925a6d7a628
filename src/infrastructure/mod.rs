//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod bounded_cache;
pub mod rate_limiter;
pub mod shutdown;

pub use bounded_cache::{BoundedCache, ByteSize, LookupCache, DEFAULT_CACHE_CAPACITY};
pub use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use shutdown::{shutdown_signal, RequestGuard, ShutdownController};
