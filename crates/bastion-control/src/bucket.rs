//! Token buckets.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. Each admitted request consumes one
//! token:
//!
//! ```text
//! tokens      = min(capacity, tokens + elapsed * refill_rate)
//! last_refill = now
//! admit iff tokens >= 1, then tokens -= 1
//! ```
//!
//! Over any interval of length `t` a bucket admits at most
//! `capacity + refill_rate * t` requests.
//!
//! # Memory
//!
//! [`BucketRegistry`] creates one bucket per distinct key and never drops
//! them on its own, so memory grows with the number of keys seen (for the
//! default client-address key, with the number of distinct clients). Call
//! [`BucketRegistry::evict_idle`] periodically, or start
//! [`BucketRegistry::spawn_evictor`], to bound it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum number of tokens (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    /// Derives a bucket from a request budget.
    ///
    /// The refill rate is `requests / window` seconds; the burst defaults
    /// to `requests`.
    #[must_use]
    pub fn from_rate(requests: u32, burst: Option<u32>, window: Duration) -> Self {
        let window_secs = window.as_secs_f64();
        let refill_rate = if window_secs > 0.0 {
            f64::from(requests) / window_secs
        } else {
            f64::from(requests)
        };
        Self {
            capacity: f64::from(burst.unwrap_or(requests)),
            refill_rate,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::from_rate(100, None, Duration::from_secs(1))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Time until one token is available; zero when tokens remain.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(config: BucketConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Creates a full bucket whose clock starts at `now`.
    #[must_use]
    pub fn new_at(config: BucketConfig, now: Instant) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: now,
            }),
        }
    }

    /// Returns the bucket configuration.
    #[must_use]
    pub const fn config(&self) -> BucketConfig {
        self.config
    }

    /// Tries to take one token now.
    pub fn allow(&self) -> Admission {
        self.allow_at(Instant::now())
    }

    /// Tries to take one token at `now`.
    pub fn allow_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.config.refill_rate, state.tokens)
            .min(self.config.capacity);
        if now > state.last_refill {
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Admission {
                allowed: true,
                remaining: state.tokens.floor() as u32,
                retry_after: Duration::ZERO,
            }
        } else {
            Admission {
                allowed: false,
                remaining: 0,
                retry_after: self.time_until_token(state.tokens),
            }
        }
    }

    /// Returns the tokens currently held, without refilling.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    /// Returns when the bucket was last touched.
    #[must_use]
    pub fn last_refill(&self) -> Instant {
        self.state.lock().last_refill
    }

    fn time_until_token(&self, tokens: f64) -> Duration {
        if self.config.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(((1.0 - tokens) / self.config.refill_rate).max(0.0))
    }
}

/// Lazily created buckets, one per key.
///
/// Lookups use double-checked locking: a read lock to find an existing
/// bucket and a write lock to insert only if the key is still absent.
#[derive(Debug)]
pub struct BucketRegistry {
    config: BucketConfig,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl BucketRegistry {
    /// Creates an empty registry whose buckets use `config`.
    #[must_use]
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the bucket configuration.
    #[must_use]
    pub const fn config(&self) -> BucketConfig {
        self.config
    }

    /// Returns the bucket for `key`, creating it on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.config))),
        )
    }

    /// Checks admission for `key` now.
    pub fn allow(&self, key: &str) -> Admission {
        self.get_or_create(key).allow()
    }

    /// Checks admission for `key` at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> Admission {
        self.get_or_create(key).allow_at(now)
    }

    /// Drops the bucket for `key`. Returns `true` if one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.buckets.write().remove(key).is_some()
    }

    /// Drops buckets untouched for at least `max_idle`.
    ///
    /// Returns the number of evicted buckets.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    /// Drops buckets untouched for at least `max_idle` as of `now`.
    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill()) < max_idle);
        before - buckets.len()
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Returns `true` if no bucket exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Starts a background task that evicts idle buckets every `interval`.
    ///
    /// Must be called from within a Tokio runtime. Abort the returned handle
    /// to stop the task.
    pub fn spawn_evictor(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.evict_idle(max_idle);
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = registry.len(), "evicted idle rate-limit buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(rps: u32, burst: u32) -> BucketConfig {
        BucketConfig::from_rate(rps, Some(burst), Duration::from_secs(1))
    }

    #[test]
    fn test_default_config() {
        let config = BucketConfig::default();
        assert!((config.capacity - 100.0).abs() < f64::EPSILON);
        assert!((config.refill_rate - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refill_rate_uses_window() {
        let config = BucketConfig::from_rate(60, None, Duration::from_secs(60));
        assert!((config.refill_rate - 1.0).abs() < f64::EPSILON);
        assert!((config.capacity - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_burst_then_reject() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(config(2, 2), start);

        let at = start + Duration::from_millis(10);
        assert!(bucket.allow_at(at).allowed);
        assert!(bucket.allow_at(at).allowed);

        let rejected = bucket.allow_at(at);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after > Duration::ZERO);
        assert!(rejected.retry_after <= Duration::from_millis(500));
    }

    #[test]
    fn test_refills_over_time() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(config(10, 1), start);

        assert!(bucket.allow_at(start).allowed);
        assert!(!bucket.allow_at(start + Duration::from_millis(50)).allowed);
        assert!(bucket.allow_at(start + Duration::from_millis(110)).allowed);
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(config(5, 3), start);
        let admission = bucket.allow_at(start + Duration::from_secs(3600));
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 2);
        assert!(bucket.tokens() <= 3.0);
    }

    #[test]
    fn test_stale_timestamp_does_not_rewind() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(config(1, 1), start + Duration::from_secs(1));
        assert!(bucket.allow_at(start).allowed);
        assert_eq!(bucket.last_refill(), start + Duration::from_secs(1));
    }

    #[test]
    fn test_registry_isolates_keys() {
        let registry = BucketRegistry::new(config(1, 1));
        let now = Instant::now();
        assert!(registry.allow_at("a", now).allowed);
        assert!(!registry.allow_at("a", now).allowed);
        assert!(registry.allow_at("b", now).allowed);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_reuses_bucket() {
        let registry = BucketRegistry::new(config(1, 1));
        let first = registry.get_or_create("k");
        let second = registry.get_or_create("k");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_evict_idle() {
        let registry = BucketRegistry::new(config(1, 1));
        registry.get_or_create("old");
        let later = Instant::now() + Duration::from_secs(120);
        registry.allow_at("fresh", later);

        let evicted = registry.evict_idle_at(Duration::from_secs(60), later);
        assert_eq!(evicted, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("fresh"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_admissions_respect_capacity() {
        let registry = Arc::new(BucketRegistry::new(BucketConfig {
            capacity: 50.0,
            refill_rate: 0.0,
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..20).filter(|_| registry.allow("shared").allowed).count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_task_runs() {
        let registry = Arc::new(BucketRegistry::new(config(1, 1)));
        registry.get_or_create("idle");
        let handle = registry.spawn_evictor(Duration::from_millis(10), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(registry.is_empty());
        handle.abort();
    }

    proptest! {
        #[test]
        fn admissions_in_any_second_are_bounded(
            rps in 1u32..20,
            burst in 1u32..20,
            mut offsets in proptest::collection::vec(0u64..3000, 1..200),
        ) {
            offsets.sort_unstable();
            let start = Instant::now();
            let bucket = TokenBucket::new_at(config(rps, burst), start);

            let admitted: Vec<u64> = offsets
                .iter()
                .copied()
                .filter(|ms| bucket.allow_at(start + Duration::from_millis(*ms)).allowed)
                .collect();

            for (i, first) in admitted.iter().enumerate() {
                let in_window = admitted[i..].iter().take_while(|t| **t < first + 1000).count();
                prop_assert!(in_window as u32 <= burst + rps);
            }
        }
    }
}
