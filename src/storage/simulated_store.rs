//! Simulated Object Store with Fault Injection
//!
//! Wraps another store and injects failures, timeouts and latency so the
//! reconciliation and write-through paths can be exercised against tiers
//! that misbehave. Faults are drawn from a seeded ChaCha RNG: the same seed
//! and the same operation sequence produce the same faults.
//!
//! `set_offline(true)` models a tier that is entirely unreachable (volume
//! not attached, database down) independently of the probabilities.

use crate::storage::object_store::{ObjectMeta, ObjectStore, StoreFuture};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of GET operation failure
    pub get_fail_prob: f64,
    /// Probability of LIST failure
    pub list_fail_prob: f64,
    /// Probability of RENAME failure
    pub rename_fail_prob: f64,
    /// Probability that an operation hangs for `hang_duration`
    pub hang_prob: f64,
    /// How long a hung operation sleeps before completing
    pub hang_duration: Duration,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            list_fail_prob: 0.01,
            rename_fail_prob: 0.01,
            hang_prob: 0.0,
            hang_duration: Duration::from_secs(30),
            latency_range_us: (100, 2_000),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.3,
            get_fail_prob: 0.3,
            list_fail_prob: 0.2,
            rename_fail_prob: 0.2,
            hang_prob: 0.0,
            hang_duration: Duration::from_secs(30),
            latency_range_us: (0, 500),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            list_fail_prob: 0.0,
            rename_fail_prob: 0.0,
            hang_prob: 0.0,
            hang_duration: Duration::from_secs(30),
            latency_range_us: (0, 0),
        }
    }

    /// Every operation hangs (timeout testing)
    pub fn always_hang(hang_duration: Duration) -> Self {
        SimulatedStoreConfig {
            hang_prob: 1.0,
            hang_duration,
            ..Self::no_faults()
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub list_failures: u64,
    pub rename_failures: u64,
    pub hangs: u64,
    pub offline_rejections: u64,
}

#[derive(Clone, Copy)]
enum Op {
    Put,
    Get,
    Exists,
    Delete,
    List,
    Rename,
    Head,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
}

/// Simulated object store that wraps another store and injects faults
#[derive(Clone)]
pub struct SimulatedObjectStore<S: ObjectStore + Clone> {
    inner_store: S,
    config: SimulatedStoreConfig,
    offline: Arc<AtomicBool>,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore + Clone> SimulatedObjectStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            offline: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    /// Take the whole store offline (every operation fails) or bring it back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// The wrapped store (bypasses fault injection)
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    fn roll(&self, prob: f64) -> bool {
        if prob <= 0.0 {
            return false;
        }
        self.state.lock().rng.gen_bool(prob.min(1.0))
    }

    fn latency(&self) -> Option<Duration> {
        let (min, max) = self.config.latency_range_us;
        let us = if max > min {
            self.state.lock().rng.gen_range(min..max)
        } else {
            min
        };
        (us > 0).then(|| Duration::from_micros(us))
    }

    /// Decide the fate of one operation before delegating to the inner store
    async fn gate(&self, op: Op) -> std::io::Result<()> {
        {
            let mut s = self.state.lock();
            match op {
                Op::Put => s.stats.put_attempts += 1,
                Op::Get => s.stats.get_attempts += 1,
                _ => {}
            }
        }

        if self.is_offline() {
            self.state.lock().stats.offline_rejections += 1;
            return Err(IoError::new(ErrorKind::ConnectionRefused, "simulated store offline"));
        }

        if self.roll(self.config.hang_prob) {
            self.state.lock().stats.hangs += 1;
            tokio::time::sleep(self.config.hang_duration).await;
        }

        let fail_prob = match op {
            Op::Put => self.config.put_fail_prob,
            Op::Get => self.config.get_fail_prob,
            Op::List => self.config.list_fail_prob,
            Op::Rename => self.config.rename_fail_prob,
            Op::Exists | Op::Delete | Op::Head => 0.0,
        };
        if self.roll(fail_prob) {
            let mut s = self.state.lock();
            let msg = match op {
                Op::Put => {
                    s.stats.put_failures += 1;
                    "simulated put failure"
                }
                Op::Get => {
                    s.stats.get_failures += 1;
                    "simulated get failure"
                }
                Op::List => {
                    s.stats.list_failures += 1;
                    "simulated list failure"
                }
                _ => {
                    s.stats.rename_failures += 1;
                    "simulated rename failure"
                }
            };
            return Err(IoError::new(ErrorKind::Other, msg));
        }

        if let Some(delay) = self.latency() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl<S: ObjectStore + Clone> ObjectStore for SimulatedObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.gate(Op::Put).await?;
            self.inner_store.put(key, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.gate(Op::Get).await?;
            self.inner_store.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.gate(Op::Exists).await?;
            self.inner_store.exists(key).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.gate(Op::Delete).await?;
            self.inner_store.delete(key).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            self.gate(Op::List).await?;
            self.inner_store.list(prefix).await
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.gate(Op::Rename).await?;
            self.inner_store.rename(from, to).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            self.gate(Op::Head).await?;
            self.inner_store.head(key).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    #[tokio::test]
    async fn test_simulated_store_no_faults() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            42,
            SimulatedStoreConfig::no_faults(),
        );

        store.put("key1", b"value1").await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), b"value1");

        let stats = store.stats();
        assert_eq!(stats.put_attempts, 1);
        assert_eq!(stats.put_failures, 0);
        assert_eq!(stats.get_attempts, 1);
    }

    #[tokio::test]
    async fn test_simulated_store_deterministic() {
        let config = SimulatedStoreConfig {
            put_fail_prob: 0.5,
            ..SimulatedStoreConfig::no_faults()
        };
        let store1 = SimulatedObjectStore::new(InMemoryObjectStore::new(), 12345, config.clone());
        let store2 = SimulatedObjectStore::new(InMemoryObjectStore::new(), 12345, config);

        let mut results1 = Vec::new();
        let mut results2 = Vec::new();
        for i in 0..20 {
            results1.push(store1.put(&format!("key{}", i), b"data").await.is_ok());
            results2.push(store2.put(&format!("key{}", i), b"data").await.is_ok());
        }

        assert_eq!(results1, results2, "same seed must inject the same faults");
    }

    #[tokio::test]
    async fn test_simulated_store_always_fails_put() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            999,
            SimulatedStoreConfig {
                put_fail_prob: 1.0,
                ..SimulatedStoreConfig::no_faults()
            },
        );

        assert!(store.put("key", b"value").await.is_err());
        assert!(store.inner().is_empty());
        assert_eq!(store.stats().put_failures, 1);
    }

    #[tokio::test]
    async fn test_simulated_store_offline_switch() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            7,
            SimulatedStoreConfig::no_faults(),
        );

        store.set_offline(true);
        let err = store.get("key").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert!(store.put("key", b"v").await.is_err());

        store.set_offline(false);
        store.put("key", b"v").await.unwrap();
        assert_eq!(store.stats().offline_rejections, 2);
    }

    #[tokio::test]
    async fn test_simulated_store_high_chaos_mixes_outcomes() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            42,
            SimulatedStoreConfig::high_chaos(),
        );

        let mut successes = 0;
        let mut failures = 0;
        for i in 0..100 {
            match store.put(&format!("key{}", i), b"data").await {
                Ok(_) => successes += 1,
                Err(_) => failures += 1,
            }
        }

        assert!(failures > 0, "Expected some failures with high chaos config");
        assert!(successes > 0, "Expected some successes even with high chaos");
    }
}
