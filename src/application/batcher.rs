//! Batcher - Lookup coalescing and batching
//!
//! Turns many independent lookups into a few upstream calls: cached keys are
//! answered immediately, concurrent lookups of the same key share one
//! pending query, and pending queries are drained into bounded batches by a
//! single background worker.

use crate::domain::entities::{FailureKind, LookupKey, LookupResult};
use crate::domain::ports::Fetcher;
use crate::infrastructure::LookupCache;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Batch assembly limits.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum keys per upstream call
    pub max_batch_size: usize,
    /// Longest time a queued key waits for peers before its batch is sent
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    /// 100 keys is the ip-api batch endpoint maximum.
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

/// Lifecycle of a pending query before it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Waiting in the queue
    Queued,
    /// Part of a batch sent upstream
    Batched,
}

/// A key waiting for resolution and everyone waiting on it.
struct PendingQuery {
    created_at: Instant,
    state: QueryState,
    waiters: Vec<oneshot::Sender<LookupResult>>,
}

impl PendingQuery {
    fn new(waiter: oneshot::Sender<LookupResult>) -> Self {
        Self {
            created_at: Instant::now(),
            state: QueryState::Queued,
            waiters: vec![waiter],
        }
    }

    /// Deliver the result to every waiter. Consumes the query so delivery
    /// happens exactly once.
    fn resolve(self, result: LookupResult) -> usize {
        let mut delivered = 0;
        for waiter in self.waiters {
            // A waiter that timed out has dropped its receiver.
            if waiter.send(result.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// State shared by submitters and the worker.
struct Shared {
    cache: Arc<LookupCache>,
    pending: DashMap<LookupKey, PendingQuery>,
}

impl Shared {
    fn resolve(&self, key: &LookupKey, result: LookupResult) {
        if let Some((_, query)) = self.pending.remove(key) {
            let waited = query.created_at.elapsed();
            let delivered = query.resolve(result);
            tracing::trace!(
                "resolved {} for {} waiters after {:?}",
                key,
                delivered,
                waited
            );
        }
    }
}

enum Submission {
    Ready(LookupResult),
    Waiting(oneshot::Receiver<LookupResult>),
}

/// Handle used by callers to submit lookups.
///
/// Cheap to clone; all clones feed the same worker. The worker stops once
/// every handle has been dropped.
#[derive(Clone)]
pub struct Batcher {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<LookupKey>,
}

impl Batcher {
    /// Create a batcher and the worker that must be run for it to make
    /// progress.
    pub fn new(
        cache: Arc<LookupCache>,
        fetcher: Arc<dyn Fetcher>,
        mut config: BatchConfig,
    ) -> (Self, BatchWorker) {
        let upstream_max = fetcher.max_batch_size().max(1);
        if config.max_batch_size == 0 || config.max_batch_size > upstream_max {
            tracing::warn!(
                "batch size {} outside 1..={}, clamping",
                config.max_batch_size,
                upstream_max
            );
            config.max_batch_size = config.max_batch_size.clamp(1, upstream_max);
        }

        let shared = Arc::new(Shared {
            cache,
            pending: DashMap::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let batcher = Self {
            shared: shared.clone(),
            queue: tx,
        };
        let worker = BatchWorker {
            shared,
            queue: rx,
            fetcher,
            config,
        };
        (batcher, worker)
    }

    /// Create a batcher and spawn its worker on the current runtime.
    pub fn spawn(
        cache: Arc<LookupCache>,
        fetcher: Arc<dyn Fetcher>,
        config: BatchConfig,
    ) -> (Self, JoinHandle<()>) {
        let (batcher, worker) = Self::new(cache, fetcher, config);
        let handle = tokio::spawn(worker.run());
        (batcher, handle)
    }

    /// Resolve a key, waiting for as long as the upstream takes.
    pub async fn submit(&self, key: LookupKey) -> LookupResult {
        match self.enqueue(key) {
            Submission::Ready(result) => result,
            Submission::Waiting(rx) => rx.await.unwrap_or_else(|_| worker_gone()),
        }
    }

    /// Resolve a key, giving up after `timeout`.
    ///
    /// Giving up only affects this caller: the pending query keeps running
    /// and its result is still cached and delivered to other waiters.
    pub async fn submit_with_timeout(&self, key: LookupKey, timeout: Duration) -> LookupResult {
        match self.enqueue(key) {
            Submission::Ready(result) => result,
            Submission::Waiting(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received.unwrap_or_else(|_| worker_gone()),
                Err(_) => LookupResult::failure(
                    FailureKind::Timeout,
                    format!("no upstream answer within {:?}", timeout),
                ),
            },
        }
    }

    /// Resolve several keys concurrently, returning results in input order.
    pub async fn submit_many(
        &self,
        keys: Vec<LookupKey>,
        timeout: Option<Duration>,
    ) -> Vec<LookupResult> {
        let lookups = keys.into_iter().map(|key| async move {
            match timeout {
                Some(t) => self.submit_with_timeout(key, t).await,
                None => self.submit(key).await,
            }
        });
        futures::future::join_all(lookups).await
    }

    /// Number of keys currently waiting for resolution.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.shared.cache
    }

    fn enqueue(&self, key: LookupKey) -> Submission {
        if let Some(result) = self.shared.cache.get(&key) {
            return Submission::Ready(result);
        }

        let (tx, rx) = oneshot::channel();
        let created = match self.shared.pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().waiters.push(tx);
                false
            }
            Entry::Vacant(entry) => {
                // The worker caches before it removes a pending query, so a
                // query resolved since the first check is visible here.
                if let Some(result) = self.shared.cache.get(&key) {
                    return Submission::Ready(result);
                }
                entry.insert(PendingQuery::new(tx));
                true
            }
        };

        if created && self.queue.send(key.clone()).is_err() {
            self.shared.resolve(&key, worker_gone());
        }

        Submission::Waiting(rx)
    }
}

fn worker_gone() -> LookupResult {
    LookupResult::failure(FailureKind::Unavailable, "batch worker is not running")
}

/// Background task that drains the queue into batches and resolves them.
pub struct BatchWorker {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedReceiver<LookupKey>,
    fetcher: Arc<dyn Fetcher>,
    config: BatchConfig,
}

impl BatchWorker {
    /// Process batches until every [`Batcher`] handle is dropped.
    ///
    /// Fetch errors never stop the loop; they only fail the affected batch.
    pub async fn run(mut self) {
        tracing::info!(
            "batch worker started (max_batch_size={}, max_batch_delay={:?})",
            self.config.max_batch_size,
            self.config.max_batch_delay
        );

        while let Some(keys) = self.next_batch().await {
            self.process(keys).await;
        }

        tracing::info!("batch worker stopped");
    }

    /// Wait for the next batch of keys.
    ///
    /// Blocks until a key is queued, then keeps collecting until the batch is
    /// full or the oldest key has waited `max_batch_delay`. Returns `None`
    /// once the queue is closed and empty.
    async fn next_batch(&mut self) -> Option<Vec<LookupKey>> {
        let first = self.queue.recv().await?;

        let queued_at = self
            .shared
            .pending
            .get(&first)
            .map(|q| q.created_at)
            .unwrap_or_else(Instant::now);
        let deadline = tokio::time::Instant::from_std(queued_at + self.config.max_batch_delay);

        let mut keys = vec![first];
        while keys.len() < self.config.max_batch_size {
            match tokio::time::timeout_at(deadline, self.queue.recv()).await {
                Ok(Some(key)) => keys.push(key),
                Ok(None) | Err(_) => break,
            }
        }

        for key in &keys {
            if let Some(mut query) = self.shared.pending.get_mut(key) {
                query.state = QueryState::Batched;
            }
        }

        Some(keys)
    }

    /// Fetch one batch and resolve every key in it.
    async fn process(&self, keys: Vec<LookupKey>) {
        let started = Instant::now();
        tracing::debug!("fetching batch of {} keys", keys.len());

        match self.fetcher.fetch_batch(&keys).await {
            Ok(mut results) => {
                let mut resolved = Vec::with_capacity(keys.len());
                let mut failed = 0;

                // Everything cacheable goes into the cache before the first
                // waiter wakes up.
                for key in keys {
                    let result = results.remove(&key).unwrap_or_else(|| {
                        LookupResult::failure(FailureKind::Missing, "no result returned by upstream")
                    });
                    if result.is_success() {
                        self.shared.cache.set(key.clone(), result.clone());
                    } else {
                        failed += 1;
                    }
                    resolved.push((key, result));
                }

                tracing::debug!(
                    "batch of {} keys resolved in {:?} ({} failed)",
                    resolved.len(),
                    started.elapsed(),
                    failed
                );

                for (key, result) in resolved {
                    self.shared.resolve(&key, result);
                }
            }
            Err(e) => {
                tracing::warn!("batch of {} keys failed: {}", keys.len(), e);
                let failure = LookupResult::failure(FailureKind::Unavailable, e.to_string());
                for key in &keys {
                    self.shared.resolve(key, failure.clone());
                }
            }
        }
    }

    #[cfg(test)]
    fn state_of(&self, key: &LookupKey) -> Option<QueryState> {
        self.shared.pending.get(key).map(|q| q.state)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::ports::FetchError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    type Behavior =
        Box<dyn Fn(&[LookupKey]) -> Result<HashMap<LookupKey, LookupResult>, FetchError> + Send + Sync>;

    struct MockFetcher {
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<LookupKey>>>,
        delay: Duration,
        max_batch_size: usize,
        behavior: Behavior,
    }

    impl MockFetcher {
        fn new(behavior: Behavior) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                max_batch_size: 100,
                behavior,
            }
        }

        fn succeeding() -> Self {
            Self::new(Box::new(|keys| {
                Ok(keys.iter().map(|k| (k.clone(), success(k))).collect())
            }))
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn batches(&self) -> Vec<Vec<LookupKey>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch_batch(
            &self,
            keys: &[LookupKey],
        ) -> Result<HashMap<LookupKey, LookupResult>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(keys.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.behavior)(keys)
        }

        fn max_batch_size(&self) -> usize {
            self.max_batch_size
        }
    }

    fn key(n: u8) -> LookupKey {
        LookupKey::for_ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, n)))
    }

    fn success(key: &LookupKey) -> LookupResult {
        LookupResult::Success(Bytes::from(format!(
            r#"{{"status":"success","query":"{}"}}"#,
            key.ip
        )))
    }

    fn config() -> BatchConfig {
        BatchConfig {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(10),
        }
    }

    fn setup(fetcher: Arc<MockFetcher>, config: BatchConfig) -> (Batcher, Arc<LookupCache>) {
        let cache = Arc::new(LookupCache::new(1024 * 1024));
        let (batcher, _handle) = Batcher::spawn(cache.clone(), fetcher, config);
        (batcher, cache)
    }

    #[test]
    fn test_batch_config_default() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_batch_delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_submit_fetches_and_caches() {
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, cache) = setup(fetcher.clone(), config());

        let result = batcher.submit(key(1)).await;

        assert_eq!(result, success(&key(1)));
        assert_eq!(cache.get(&key(1)), Some(success(&key(1))));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, cache) = setup(fetcher.clone(), config());

        let cached = LookupResult::Success(Bytes::from_static(b"{\"cached\":true}"));
        cache.set(key(1), cached.clone());

        assert_eq!(batcher.submit(key(1)).await, cached);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submits_coalesce() {
        let fetcher = Arc::new(MockFetcher::succeeding().with_delay(Duration::from_millis(20)));
        let (batcher, _cache) = setup(fetcher.clone(), config());

        let results = batcher.submit_many(vec![key(7); 10], None).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| *r == success(&key(7))));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(fetcher.batches()[0], vec![key(7)]);
    }

    #[tokio::test]
    async fn test_waiter_attaches_to_batched_query() {
        let fetcher = Arc::new(MockFetcher::succeeding().with_delay(Duration::from_millis(100)));
        let (batcher, _cache) = setup(fetcher.clone(), config());

        let first = {
            let b = batcher.clone();
            tokio::spawn(async move { b.submit(key(1)).await })
        };
        // Let the batch form and go upstream
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fetcher.calls(), 1);

        let second = batcher.submit(key(1)).await;
        let first = first.await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let fetcher = Arc::new(MockFetcher::new(Box::new(|keys| {
            Ok(keys
                .iter()
                .map(|k| {
                    let result = if *k == key(2) {
                        LookupResult::failure(FailureKind::Rejected, "private range")
                    } else {
                        success(k)
                    };
                    (k.clone(), result)
                })
                .collect())
        })));
        let (batcher, cache) = setup(fetcher.clone(), config());

        let results = batcher.submit_many(vec![key(1), key(2)], None).await;

        assert_eq!(results[0], success(&key(1)));
        assert_eq!(results[1].failure_kind(), Some(FailureKind::Rejected));
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_key_missing_from_response_fails() {
        let fetcher = Arc::new(MockFetcher::new(Box::new(|_| {
            Ok(HashMap::from([(key(1), success(&key(1)))]))
        })));
        let (batcher, cache) = setup(fetcher.clone(), config());

        let results = batcher.submit_many(vec![key(1), key(2)], None).await;

        assert!(results[0].is_success());
        assert_eq!(results[1].failure_kind(), Some(FailureKind::Missing));
        assert!(!cache.contains(&key(2)));
    }

    #[tokio::test]
    async fn test_total_failure() {
        let fetcher = Arc::new(MockFetcher::new(Box::new(|_| Err(FetchError::RateLimited))));
        let (batcher, cache) = setup(fetcher.clone(), config());

        let results = batcher.submit_many(vec![key(1), key(2), key(3)], None).await;

        for result in &results {
            assert_eq!(result.failure_kind(), Some(FailureKind::Unavailable));
        }
        assert!(cache.is_empty());
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_survives_fetch_error() {
        let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = failing.clone();
        let fetcher = Arc::new(MockFetcher::new(Box::new(move |keys| {
            if flag.load(Ordering::SeqCst) {
                Err(FetchError::Status(503))
            } else {
                Ok(keys.iter().map(|k| (k.clone(), success(k))).collect())
            }
        })));
        let (batcher, _cache) = setup(fetcher.clone(), config());

        assert!(!batcher.submit(key(1)).await.is_success());

        // A failed key is a fresh miss on the next submit
        failing.store(false, Ordering::SeqCst);
        assert!(batcher.submit(key(1)).await.is_success());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_repeated_submit_after_cache_is_idempotent() {
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, _cache) = setup(fetcher.clone(), config());

        for _ in 0..5 {
            assert!(batcher.submit(key(9)).await.is_success());
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_batches_respect_max_size() {
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, _cache) = setup(
            fetcher.clone(),
            BatchConfig {
                max_batch_size: 3,
                max_batch_delay: Duration::from_millis(10),
            },
        );

        let keys: Vec<_> = (1..=7).map(key).collect();
        let results = batcher.submit_many(keys, None).await;

        assert!(results.iter().all(LookupResult::is_success));
        let batches = fetcher.batches();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= 3));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 7);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_batch_size_clamped_to_fetcher_max() {
        let mut mock = MockFetcher::succeeding();
        mock.max_batch_size = 2;
        let fetcher = Arc::new(mock);
        let (batcher, _cache) = setup(
            fetcher.clone(),
            BatchConfig {
                max_batch_size: 500,
                max_batch_delay: Duration::from_millis(10),
            },
        );

        batcher.submit_many((1..=5).map(key).collect(), None).await;

        assert!(fetcher.batches().iter().all(|b| b.len() <= 2));
        assert!(logs_contain("batch size 500 outside 1..=2"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_fetch_alive() {
        let fetcher = Arc::new(MockFetcher::succeeding().with_delay(Duration::from_millis(100)));
        let (batcher, cache) = setup(fetcher.clone(), config());

        let result = batcher
            .submit_with_timeout(key(4), Duration::from_millis(20))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.contains(&key(4)));
        assert_eq!(batcher.pending_count(), 0);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_does_not_affect_other_waiters() {
        let fetcher = Arc::new(MockFetcher::succeeding().with_delay(Duration::from_millis(80)));
        let (batcher, _cache) = setup(fetcher.clone(), config());

        let (impatient, patient) = tokio::join!(
            batcher.submit_with_timeout(key(5), Duration::from_millis(10)),
            batcher.submit_with_timeout(key(5), Duration::from_secs(5)),
        );

        assert_eq!(impatient.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(patient, success(&key(5)));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_submit_without_worker_fails() {
        let cache = Arc::new(LookupCache::new(1024));
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, worker) = Batcher::new(cache, fetcher, config());
        drop(worker);

        let result = batcher.submit(key(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Unavailable));
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_queries_move_from_queued_to_batched() {
        let cache = Arc::new(LookupCache::new(1024));
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, mut worker) = Batcher::new(cache, fetcher, config());

        let waiter = match batcher.enqueue(key(1)) {
            Submission::Waiting(rx) => rx,
            Submission::Ready(_) => panic!("expected a pending query"),
        };
        assert_eq!(worker.state_of(&key(1)), Some(QueryState::Queued));

        let keys = worker.next_batch().await.unwrap();
        assert_eq!(keys, vec![key(1)]);
        assert_eq!(worker.state_of(&key(1)), Some(QueryState::Batched));

        worker.process(keys).await;
        assert_eq!(worker.state_of(&key(1)), None);
        assert_eq!(waiter.await.unwrap(), success(&key(1)));
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_dropped() {
        let cache = Arc::new(LookupCache::new(1024));
        let fetcher = Arc::new(MockFetcher::succeeding());
        let (batcher, handle) = Batcher::spawn(cache, fetcher, config());

        drop(batcher);
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
    }
}
