//! Shared bucket state.
//!
//! [`BucketStore`] is the narrow interface the enforcer consumes. The
//! provided implementation, [`CasBucketStore`], runs the pure bucket
//! algorithm against any [`CasBackend`] offering atomic compare-and-swap on
//! opaque bytes, so concurrent consumers on different nodes observe a
//! linearizable sequence of states per key.

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::{RedisBackend, RedisBackendConfig};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{try_consume, BucketConfiguration, BucketState, ConsumptionResult, TokenInheritance};

/// Errors raised by the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Gave up on key '{key}' after {attempts} contended compare-and-swap attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt bucket record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Atomic consumption against shared bucket state.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Withdraw `tokens` from the bucket at `key`.
    ///
    /// A bucket that does not exist yet is created full under
    /// `configuration`. An existing bucket keeps the configuration it was
    /// stored with until [`replace_configuration`](Self::replace_configuration)
    /// is called.
    async fn consume(
        &self,
        key: &str,
        configuration: &BucketConfiguration,
        tokens: u64,
    ) -> Result<ConsumptionResult, StoreError>;

    /// The configuration the bucket at `key` is stored with, if it exists.
    async fn get_current_configuration(&self, key: &str) -> Result<Option<BucketConfiguration>, StoreError>;

    /// Swap the bucket's configuration, carrying tokens over per `policy`.
    async fn replace_configuration(
        &self,
        key: &str,
        configuration: &BucketConfiguration,
        policy: TokenInheritance,
    ) -> Result<(), StoreError>;
}

/// Key-value store with an atomic compare-and-swap primitive.
#[async_trait]
pub trait CasBackend: Send + Sync {
    /// Read the raw record at `key`.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `new` only if the record still equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    ///
    /// A backend that expires records must keep this one for at least
    /// `retain_for` after the write.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        retain_for: Duration,
    ) -> Result<bool, StoreError>;
}

/// Retry and timeout settings for [`CasBucketStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Compare-and-swap attempts before failing with `Contention`
    pub max_cas_retries: u32,
    /// Bound on each individual backend call
    pub timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_cas_retries: 16,
            timeout: Duration::from_millis(500),
        }
    }
}

/// What is persisted per bucket key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredBucket {
    configuration: BucketConfiguration,
    state: BucketState,
}

impl StoredBucket {
    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// [`BucketStore`] built on optimistic compare-and-swap.
pub struct CasBucketStore<B> {
    backend: B,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
}

impl<B: CasBackend> CasBucketStore<B> {
    /// Create a store using the system clock and default settings.
    pub fn new(backend: B) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock::new()), StoreSettings::default())
    }

    /// Create a store with an explicit clock and settings.
    pub fn with_clock(backend: B, clock: Arc<dyn Clock>, settings: StoreSettings) -> Self {
        Self {
            backend,
            clock,
            settings,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> StoreSettings {
        self.settings
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.settings.timeout))?
    }

    /// Read-modify-write `key` until the CAS lands or retries run out.
    ///
    /// `apply` returns the value to hand back and, if the record should
    /// change, the new record to write.
    async fn update<T, F>(&self, key: &str, mut apply: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnMut(Option<StoredBucket>, u64) -> (T, Option<StoredBucket>) + Send,
    {
        let attempts = self.settings.max_cas_retries.max(1);

        for attempt in 1..=attempts {
            let raw = self.bounded(self.backend.load(key)).await?;
            let current = raw.as_deref().map(StoredBucket::decode).transpose()?;
            let now = self.clock.now_nanos();

            let (value, next) = apply(current, now);
            let Some(next) = next else {
                return Ok(value);
            };

            // a drained record must not expire before it would have refilled
            let retain_for = next.configuration.refill_horizon();
            let encoded = next.encode()?;
            if self
                .bounded(self.backend.compare_and_swap(key, raw.as_deref(), encoded, retain_for))
                .await?
            {
                if attempt > 1 {
                    debug!(key = %key, attempt, "Compare-and-swap succeeded after contention");
                }
                return Ok(value);
            }

            trace!(key = %key, attempt, "Compare-and-swap lost, retrying");
            let backoff = {
                let mut rng = rand::thread_rng();
                Duration::from_micros(rng.gen_range(0..=50 * u64::from(attempt)))
            };
            tokio::time::sleep(backoff).await;
        }

        warn!(key = %key, attempts, "Compare-and-swap retries exhausted");
        Err(StoreError::Contention {
            key: key.to_string(),
            attempts,
        })
    }
}

#[async_trait]
impl<B: CasBackend> BucketStore for CasBucketStore<B> {
    async fn consume(
        &self,
        key: &str,
        configuration: &BucketConfiguration,
        tokens: u64,
    ) -> Result<ConsumptionResult, StoreError> {
        self.update(key, |current, now| {
            let stored = current.unwrap_or_else(|| StoredBucket {
                configuration: configuration.clone(),
                state: BucketState::full(configuration, now),
            });
            let (state, result) = try_consume(&stored.state, &stored.configuration, tokens, now);

            // a denial changes nothing that a later refill would not recompute
            let next = result.allowed.then(|| StoredBucket {
                configuration: stored.configuration,
                state,
            });
            (result, next)
        })
        .await
    }

    async fn get_current_configuration(&self, key: &str) -> Result<Option<BucketConfiguration>, StoreError> {
        let raw = self.bounded(self.backend.load(key)).await?;
        Ok(raw
            .as_deref()
            .map(StoredBucket::decode)
            .transpose()?
            .map(|stored| stored.configuration))
    }

    async fn replace_configuration(
        &self,
        key: &str,
        configuration: &BucketConfiguration,
        policy: TokenInheritance,
    ) -> Result<(), StoreError> {
        self.update(key, |current, now| {
            let next = match current {
                Some(stored) if stored.configuration == *configuration => None,
                Some(stored) => Some(StoredBucket {
                    state: stored
                        .state
                        .inherit(&stored.configuration, configuration, policy, now),
                    configuration: configuration.clone(),
                }),
                None => Some(StoredBucket {
                    configuration: configuration.clone(),
                    state: BucketState::full(configuration, now),
                }),
            };
            ((), next)
        })
        .await
    }
}
