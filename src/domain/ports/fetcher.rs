//! Upstream Fetcher Port
//!
//! Defines the interface for resolving a batch of lookups against the
//! upstream geolocation service.

use crate::domain::entities::{LookupKey, LookupResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// Failure of a whole upstream call.
///
/// Per-key failures are not errors; they come back as
/// [`LookupResult::Failure`] entries in the result map.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream rate limit exceeded")]
    RateLimited,

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Resolver for batches of lookup keys.
///
/// This is an outbound port. Implementations own rate limiting, retries and
/// connection handling; the batcher only ever sees the outcome.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolve up to [`Fetcher::max_batch_size`] keys in one upstream call.
    ///
    /// Keys absent from the returned map are treated as unresolved by the
    /// caller.
    async fn fetch_batch(
        &self,
        keys: &[LookupKey],
    ) -> Result<HashMap<LookupKey, LookupResult>, FetchError>;

    /// Largest number of keys a single call accepts.
    fn max_batch_size(&self) -> usize;
}
