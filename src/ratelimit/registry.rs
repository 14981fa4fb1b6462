//! Concurrent registry of per-key token buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::maintenance::{MaintenanceHandle, MaintenanceSchedule};
use super::policy::Policy;
use super::result::AdmissionResult;

/// Default number of buckets included in a stats sample.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Owns every token bucket and makes the admission decision.
///
/// Buckets are created lazily on the first check for a key and removed by
/// idle eviction or an explicit reset. State is process-local: several
/// gateway instances each keep their own budget per key.
#[derive(Debug)]
pub struct BucketRegistry {
    /// Buckets indexed by rate limit key
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// Time source for refill and eviction
    clock: Arc<dyn Clock>,
    /// Checks performed since start or the last full reset
    total_requests: AtomicU64,
    /// Checks that were denied
    total_blocked: AtomicU64,
    /// Epoch millis of the last eviction sweep, zero if none ran yet
    last_cleanup_ms: AtomicU64,
    /// Upper bound on buckets reported by `stats`
    sample_size: usize,
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSnapshot {
    pub key: String,
    pub tokens: u32,
    pub capacity: u32,
    pub refill_rate: u32,
    pub last_refill_at_millis: u64,
}

/// Aggregate usage report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_buckets: usize,
    pub total_requests: u64,
    pub total_blocked: u64,
    pub block_rate_percent: f64,
    pub last_cleanup_at_millis: Option<u64>,
    pub bucket_sample: Vec<BucketSnapshot>,
}

impl BucketRegistry {
    /// Create an empty registry on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty registry on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            total_requests: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
            last_cleanup_ms: AtomicU64::new(0),
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    /// Set how many buckets `stats` reports at most.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Decide whether one request for `key` is admitted under `policy`.
    ///
    /// The bucket for a key is sized by the policy of the first request that
    /// created it.
    pub fn check_limit(&self, key: &str, policy: &Policy) -> AdmissionResult {
        let now = self.clock.now_millis();
        let bucket = self.bucket_or_insert(key, policy, now);

        self.total_requests.fetch_add(1, Ordering::SeqCst);

        match bucket.consume(policy.cost(), now) {
            Ok(remaining) => {
                trace!(
                    key = %key,
                    remaining,
                    capacity = policy.capacity(),
                    "Request admitted"
                );
                AdmissionResult::admitted(remaining, policy.capacity())
            }
            Err(available) => {
                self.total_blocked.fetch_add(1, Ordering::SeqCst);
                let retry_after = bucket.estimate_retry_after_secs(policy.cost());
                debug!(
                    key = %key,
                    available,
                    cost = policy.cost(),
                    retry_after,
                    "Request denied"
                );
                AdmissionResult::denied(policy.capacity(), retry_after)
            }
        }
    }

    /// Get the bucket for `key`, creating it at most once.
    fn bucket_or_insert(&self, key: &str, policy: &Policy, now: u64) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = policy.capacity(),
                refill_rate = policy.refill_rate(),
                "Creating bucket for new key"
            );
            Arc::new(TokenBucket::from_policy(policy, now))
        });
        Arc::clone(entry.value())
    }

    /// Top up every bucket by the time elapsed since its last refill.
    ///
    /// Returns the number of buckets that gained tokens.
    pub fn refill_all(&self) -> usize {
        if self.buckets.is_empty() {
            return 0;
        }

        let now = self.clock.now_millis();
        let refilled = self
            .buckets
            .iter()
            .filter(|entry| entry.value().refill(now))
            .count();

        debug!(
            buckets = self.buckets.len(),
            refilled,
            total_requests = self.total_requests.load(Ordering::Relaxed),
            "Refill sweep complete"
        );
        refilled
    }

    /// Drop buckets whose last refill is older than `max_idle`.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub(max_idle_ms);

        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = bucket.last_refill_millis() >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.last_cleanup_ms.store(now, Ordering::SeqCst);

        debug!(
            removed,
            remaining = self.buckets.len(),
            "Idle bucket eviction complete"
        );
        removed
    }

    /// Forget the bucket for one key. Returns whether it existed.
    pub fn reset_key(&self, key: &str) -> bool {
        if self.buckets.remove(key).is_some() {
            info!(key = %key, "Rate limit reset");
            true
        } else {
            warn!(key = %key, "Rate limit reset requested for unknown key");
            false
        }
    }

    /// Forget every bucket and zero the counters.
    pub fn reset_all(&self) {
        let count = self.buckets.len();
        self.buckets.clear();
        self.total_blocked.store(0, Ordering::SeqCst);
        self.total_requests.store(0, Ordering::SeqCst);
        info!(buckets = count, "All rate limits reset");
    }

    /// Snapshot of the counters and a bounded sample of buckets.
    pub fn stats(&self) -> RegistryStats {
        // Blocked is read first so it can never run ahead of requests.
        let total_blocked = self.total_blocked.load(Ordering::SeqCst);
        let total_requests = self.total_requests.load(Ordering::SeqCst);
        let total_blocked = total_blocked.min(total_requests);

        let last_cleanup = self.last_cleanup_ms.load(Ordering::SeqCst);

        let bucket_sample = self
            .buckets
            .iter()
            .take(self.sample_size)
            .map(|entry| {
                let bucket = entry.value();
                BucketSnapshot {
                    key: entry.key().clone(),
                    tokens: bucket.tokens(),
                    capacity: bucket.capacity(),
                    refill_rate: bucket.refill_rate(),
                    last_refill_at_millis: bucket.last_refill_millis(),
                }
            })
            .collect();

        RegistryStats {
            active_buckets: self.buckets.len(),
            total_requests,
            total_blocked,
            block_rate_percent: block_rate(total_blocked, total_requests),
            last_cleanup_at_millis: (last_cleanup > 0).then_some(last_cleanup),
            bucket_sample,
        }
    }

    /// Number of keys currently tracked.
    pub fn active_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Percentage of checks that were denied.
    pub fn block_rate(&self) -> f64 {
        let blocked = self.total_blocked.load(Ordering::SeqCst);
        let requests = self.total_requests.load(Ordering::SeqCst);
        block_rate(blocked.min(requests), requests)
    }

    /// Look up the bucket for a key without creating it.
    pub fn bucket(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Start the periodic refill and eviction tasks for this registry.
    pub fn start_maintenance(self: &Arc<Self>, schedule: MaintenanceSchedule) -> MaintenanceHandle {
        MaintenanceHandle::start(Arc::clone(self), schedule)
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn block_rate(blocked: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        blocked as f64 * 100.0 / requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    const T0: u64 = 1_700_000_000_000;

    fn manual_registry() -> (Arc<ManualClock>, BucketRegistry) {
        let clock = Arc::new(ManualClock::new(T0));
        let registry = BucketRegistry::with_clock(clock.clone());
        (clock, registry)
    }

    #[test]
    fn test_registry_creation() {
        let registry = BucketRegistry::new();
        assert_eq!(registry.active_buckets(), 0);
        assert_eq!(registry.block_rate(), 0.0);
    }

    #[test]
    fn test_first_request_is_admitted() {
        let registry = BucketRegistry::new();

        let result = registry.check_limit("user:123", &Policy::GENERAL);

        assert!(result.allowed());
        assert_eq!(result.remaining_tokens(), 99);
        assert_eq!(result.capacity(), 100);
        assert_eq!(registry.active_buckets(), 1);
    }

    #[test]
    fn test_request_blocked_when_exhausted() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(1, 2, 1).unwrap();

        assert!(registry.check_limit("user-blocked", &policy).allowed());
        assert!(registry.check_limit("user-blocked", &policy).allowed());

        let result = registry.check_limit("user-blocked", &policy);
        assert!(!result.allowed());
        assert_eq!(result.remaining_tokens(), 0);
        assert_eq!(result.capacity(), 2);
        assert_eq!(result.retry_after_seconds(), 1);
    }

    #[test]
    fn test_retry_after_uses_deficit_and_rate() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(2, 6, 5).unwrap();

        assert!(registry.check_limit("k", &policy).allowed());
        // One token left, four more needed at 2/s.
        let result = registry.check_limit("k", &policy);
        assert!(!result.allowed());
        assert_eq!(result.retry_after_seconds(), 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = BucketRegistry::new();
        let policy = Policy::new(1, 1, 1).unwrap();

        assert!(registry.check_limit("user-1", &policy).allowed());
        assert!(registry.check_limit("user-2", &policy).allowed());
        assert!(!registry.check_limit("user-1", &policy).allowed());
        assert_eq!(registry.active_buckets(), 2);
    }

    #[test]
    fn test_burst_then_throttle() {
        let (clock, registry) = manual_registry();
        let policy = Policy::AUTH;

        for i in 0..10 {
            assert!(registry.check_limit("ip:10.0.0.1", &policy).allowed(), "request {}", i);
        }
        assert!(!registry.check_limit("ip:10.0.0.1", &policy).allowed());

        clock.advance(Duration::from_secs(5));

        for i in 0..10 {
            assert!(registry.check_limit("ip:10.0.0.1", &policy).allowed(), "request {}", i);
        }
        assert!(!registry.check_limit("ip:10.0.0.1", &policy).allowed());
    }

    #[test]
    fn test_reset_key_behaves_like_first_request() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(1, 1, 1).unwrap();

        registry.check_limit("user-reset", &policy);
        assert!(!registry.check_limit("user-reset", &policy).allowed());

        assert!(registry.reset_key("user-reset"));
        assert!(!registry.reset_key("user-reset"));

        let result = registry.check_limit("user-reset", &policy);
        assert!(result.allowed());
        assert_eq!(result.remaining_tokens(), 0);
    }

    #[test]
    fn test_reset_all_clears_buckets_and_counters() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(1, 1, 1).unwrap();

        for key in ["a", "b", "a"] {
            registry.check_limit(key, &policy);
        }
        registry.reset_all();

        let stats = registry.stats();
        assert_eq!(stats.active_buckets, 0);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.total_blocked, 0);
    }

    #[test]
    fn test_refill_all_tops_up_drained_buckets() {
        let (clock, registry) = manual_registry();
        let policy = Policy::new(2, 10, 1).unwrap();

        for _ in 0..10 {
            registry.check_limit("drained", &policy);
        }
        registry.check_limit("light", &policy);

        clock.advance(Duration::from_secs(2));
        assert_eq!(registry.refill_all(), 2);
        assert_eq!(registry.bucket("drained").unwrap().tokens(), 4);
        assert_eq!(registry.bucket("light").unwrap().tokens(), 10);

        // Same second: nothing more to add.
        assert_eq!(registry.refill_all(), 0);
    }

    #[test]
    fn test_idle_buckets_are_evicted() {
        let (clock, registry) = manual_registry();
        let policy = Policy::new(2, 10, 1).unwrap();

        registry.check_limit("idle", &policy);
        clock.advance(Duration::from_secs(50 * 60));
        for _ in 0..10 {
            registry.check_limit("busy", &policy);
        }
        clock.advance(Duration::from_secs(20 * 60));

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)), 1);
        assert!(registry.bucket("idle").is_none());
        assert!(registry.bucket("busy").is_some());
        assert_eq!(
            registry.stats().last_cleanup_at_millis,
            Some(T0 + 70 * 60 * 1000)
        );

        // Recreated at full capacity.
        let result = registry.check_limit("idle", &policy);
        assert_eq!(result.remaining_tokens(), 9);
    }

    #[test]
    fn test_stats_consistency() {
        let (_clock, registry) = manual_registry();
        let empty = registry.stats();
        assert_eq!(empty.block_rate_percent, 0.0);
        assert_eq!(empty.last_cleanup_at_millis, None);

        let policy = Policy::new(1, 3, 1).unwrap();
        for _ in 0..4 {
            registry.check_limit("k", &policy);
        }

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_blocked, 1);
        assert!((stats.block_rate_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(stats.bucket_sample.len(), 1);
        assert_eq!(stats.bucket_sample[0].key, "k");
        assert_eq!(stats.bucket_sample[0].tokens, 0);
        assert_eq!(stats.bucket_sample[0].last_refill_at_millis, T0);
    }

    #[test]
    fn test_stats_sample_is_bounded() {
        let registry = BucketRegistry::new().with_sample_size(3);
        for i in 0..50 {
            registry.check_limit(&format!("ip:10.0.0.{}", i), &Policy::GENERAL);
        }

        let stats = registry.stats();
        assert_eq!(stats.active_buckets, 50);
        assert_eq!(stats.bucket_sample.len(), 3);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["activeBuckets"], 50);
        assert!(json["bucketSample"].is_array());
    }

    #[test]
    fn test_concurrent_first_access_creates_one_bucket() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(1, 25, 1).unwrap();
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..100 {
                s.spawn(|| {
                    if registry.check_limit("shared", &policy).allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(registry.active_buckets(), 1);
        assert_eq!(admitted.load(Ordering::SeqCst), 25);

        let stats = registry.stats();
        assert_eq!(stats.total_requests, 100);
        assert_eq!(stats.total_blocked, 75);
    }

    #[test]
    fn test_stats_never_report_more_blocked_than_requests() {
        let (_clock, registry) = manual_registry();
        let policy = Policy::new(1, 1, 1).unwrap();

        std::thread::scope(|s| {
            for t in 0..4 {
                let registry = &registry;
                s.spawn(move || {
                    for i in 0..500 {
                        registry.check_limit(&format!("{}-{}", t, i % 7), &policy);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..500 {
                    let stats = registry.stats();
                    assert!(stats.total_blocked <= stats.total_requests);
                }
            });
        });
    }
}
