//! Lazy per-key metric cache with single-flight builds.
//!
//! A key's entry is always in one of three states: absent, fully valid, or a
//! recorded error. Concurrent requests for the same key coalesce onto one
//! computation; distinct keys never serialize against each other.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::errors::HarnessError;
use crate::functions::MetricReturn;
use crate::types::{MetricName, ModelName, SliceName};

/// Cache key: one metric applied to one slice of one model's outputs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    /// Slice the metric is evaluated over.
    pub slice: SliceName,
    /// Model whose outputs feed the metric.
    pub model: ModelName,
    /// Metric-function name.
    pub metric: MetricName,
}

/// Terminal state of one computation.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricOutcome {
    /// The metric computed successfully.
    Ready(MetricReturn),
    /// User-function failure recorded for this key; siblings keep computing.
    Failed(String),
}

/// Stored entry plus telemetry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Settled result for the key.
    pub outcome: MetricOutcome,
    /// When the entry was published.
    pub computed_at: DateTime<Utc>,
}

enum EntryState {
    /// A builder owns this key; waiters block on the condvar.
    InFlight,
    Done(CacheEntry),
}

/// Thread-safe metric result cache keyed by `(slice, model, metric)`.
#[derive(Clone, Default)]
pub struct MetricCache {
    inner: Arc<(Mutex<HashMap<MetricKey, EntryState>>, Condvar)>,
}

impl MetricCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached outcome for `key`, computing it at most once.
    ///
    /// On a miss the calling thread becomes the builder and runs `compute`
    /// outside the lock; other callers for the same key wait until the
    /// builder publishes. A panicking builder is recorded as `Failed` so the
    /// key never stays wedged in flight.
    pub fn get_or_compute<F>(&self, key: &MetricKey, compute: F) -> MetricOutcome
    where
        F: FnOnce() -> Result<MetricReturn, HarnessError>,
    {
        let (lock, cvar) = &*self.inner;
        let mut map = lock.lock().expect("metric cache poisoned");
        loop {
            match map.get(key) {
                None => {
                    map.insert(key.clone(), EntryState::InFlight);
                    break;
                }
                Some(EntryState::InFlight) => {
                    map = cvar.wait(map).expect("metric cache poisoned");
                }
                Some(EntryState::Done(entry)) => return entry.outcome.clone(),
            }
        }
        drop(map);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(compute)) {
            Ok(Ok(result)) => MetricOutcome::Ready(result),
            Ok(Err(err)) => {
                warn!(slice = %key.slice, model = %key.model, metric = %key.metric,
                    error = %err, "metric computation failed");
                MetricOutcome::Failed(err.to_string())
            }
            Err(_) => {
                warn!(slice = %key.slice, model = %key.model, metric = %key.metric,
                    "metric computation panicked");
                MetricOutcome::Failed("metric function panicked".to_string())
            }
        };

        let mut map = lock.lock().expect("metric cache poisoned");
        map.insert(
            key.clone(),
            EntryState::Done(CacheEntry {
                outcome: outcome.clone(),
                computed_at: Utc::now(),
            }),
        );
        cvar.notify_all();
        debug!(slice = %key.slice, model = %key.model, metric = %key.metric,
            "metric cache entry published");
        outcome
    }

    /// Peek at a settled entry without triggering computation.
    pub fn entry(&self, key: &MetricKey) -> Option<CacheEntry> {
        let (lock, _) = &*self.inner;
        let map = lock.lock().expect("metric cache poisoned");
        match map.get(key) {
            Some(EntryState::Done(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Drop every settled entry referencing `slice`. In-flight builds finish
    /// and publish; the cache is best-effort and rebuildable from source.
    pub fn invalidate_slice(&self, slice: &str) {
        self.invalidate_where(|key| key.slice == slice);
    }

    /// Drop every settled entry referencing `model`.
    pub fn invalidate_model(&self, model: &str) {
        self.invalidate_where(|key| key.model == model);
    }

    /// Drop every settled entry referencing `metric`.
    pub fn invalidate_metric(&self, metric: &str) {
        self.invalidate_where(|key| key.metric == metric);
    }

    fn invalidate_where(&self, matches: impl Fn(&MetricKey) -> bool) {
        let (lock, _) = &*self.inner;
        let mut map = lock.lock().expect("metric cache poisoned");
        map.retain(|key, state| !(matches(key) && matches!(state, EntryState::Done(_))));
    }

    /// Number of settled entries.
    pub fn len(&self) -> usize {
        let (lock, _) = &*self.inner;
        let map = lock.lock().expect("metric cache poisoned");
        map.values()
            .filter(|state| matches!(state, EntryState::Done(_)))
            .count()
    }

    /// True when no entry has settled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn key(slice: &str, model: &str, metric: &str) -> MetricKey {
        MetricKey {
            slice: slice.to_string(),
            model: model.to_string(),
            metric: metric.to_string(),
        }
    }

    fn ready(metric: f64) -> Result<MetricReturn, HarnessError> {
        Ok(MetricReturn {
            metric,
            error_rate: None,
        })
    }

    #[test]
    fn second_lookup_hits_without_recomputing() {
        let cache = MetricCache::new();
        let calls = AtomicUsize::new(0);
        let key = key("overall", "m", "accuracy");

        let first = cache.get_or_compute(&key, || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(0.75)
        });
        let second = cache.get_or_compute(&key, || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(0.0)
        });
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.entry(&key).is_some());
    }

    #[test]
    fn concurrent_same_key_requests_share_one_build() {
        let cache = MetricCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = key("overall", "m", "accuracy");

        thread::scope(|scope| {
            for _ in 0..8 {
                let cache = cache.clone();
                let calls = calls.clone();
                let key = key.clone();
                scope.spawn(move || {
                    let outcome = cache.get_or_compute(&key, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        ready(0.5)
                    });
                    assert!(matches!(outcome, MetricOutcome::Ready(_)));
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_compute_independently() {
        let cache = MetricCache::new();
        let calls = AtomicUsize::new(0);
        for model in ["a", "b", "c"] {
            cache.get_or_compute(&key("overall", model, "accuracy"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                ready(1.0)
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn failures_are_recorded_per_key() {
        let cache = MetricCache::new();
        let key = key("overall", "m", "broken");
        let outcome = cache.get_or_compute(&key, || {
            Err(HarnessError::UserFunction {
                function: "broken".into(),
                reason: "division by zero".into(),
            })
        });
        assert!(matches!(outcome, MetricOutcome::Failed(_)));
        // The recorded error is itself a settled entry.
        let calls = AtomicUsize::new(0);
        cache.get_or_compute(&key, || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(1.0)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_builder_settles_as_failed() {
        let cache = MetricCache::new();
        let key = key("overall", "m", "panics");
        let outcome = cache.get_or_compute(&key, || panic!("user code exploded"));
        assert!(matches!(outcome, MetricOutcome::Failed(_)));
        // Waiters must not be wedged afterwards.
        let again = cache.get_or_compute(&key, || ready(1.0));
        assert!(matches!(again, MetricOutcome::Failed(_)));
    }

    #[test]
    fn invalidation_removes_only_affected_keys() {
        let cache = MetricCache::new();
        cache.get_or_compute(&key("s1", "m1", "acc"), || ready(0.1));
        cache.get_or_compute(&key("s1", "m2", "acc"), || ready(0.2));
        cache.get_or_compute(&key("s2", "m1", "acc"), || ready(0.3));
        assert_eq!(cache.len(), 3);

        cache.invalidate_slice("s1");
        assert_eq!(cache.len(), 1);
        assert!(cache.entry(&key("s2", "m1", "acc")).is_some());

        cache.invalidate_model("m1");
        assert!(cache.is_empty());
    }
}
