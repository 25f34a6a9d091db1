//! Token bucket configuration, state and the pure consume algorithm.
//!
//! A bucket is one or more overlapping [`Bandwidth`]s combined with AND
//! semantics. Refill is greedy: tokens trickle back continuously at
//! `refill_tokens / period` instead of all at once at a period boundary.
//!
//! Token counts are kept as integers scaled by the bandwidth's period in
//! nanoseconds. One elapsed nanosecond then adds exactly `refill_tokens`
//! scaled units, so refill and wait times involve no rounding.
//!
//! Nothing here touches shared state. [`try_consume`] maps an old
//! [`BucketState`] to a new one, which is what lets a store apply it with
//! compare-and-swap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};

/// A single capacity / refill-rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    /// Identifier of this bandwidth within its profile
    id: String,
    /// Maximum number of tokens the bandwidth can hold
    capacity: u64,
    /// Tokens regained over one `period`
    refill_tokens: u64,
    /// Refill period
    period: Duration,
}

impl Bandwidth {
    /// Create a bandwidth, rejecting zero refill amounts and zero periods.
    ///
    /// The period must also fit in `u64` nanoseconds (about 584 years).
    pub fn new(id: impl Into<String>, capacity: u64, refill_tokens: u64, period: Duration) -> Result<Self> {
        let id = id.into();
        if capacity == 0 {
            return Err(QuotaError::InvalidBandwidth(format!("{}: capacity must be > 0", id)));
        }
        if refill_tokens == 0 {
            return Err(QuotaError::InvalidBandwidth(format!("{}: refill tokens must be > 0", id)));
        }
        if period.is_zero() {
            return Err(QuotaError::InvalidBandwidth(format!("{}: period must be > 0", id)));
        }
        if period.as_nanos() > u64::MAX as u128 {
            return Err(QuotaError::InvalidBandwidth(format!("{}: period is too long", id)));
        }
        Ok(Self {
            id,
            capacity,
            refill_tokens,
            period,
        })
    }

    /// Shorthand for the common case where the refill amount equals the capacity.
    pub fn simple(id: impl Into<String>, capacity: u64, period: Duration) -> Result<Self> {
        Self::new(id, capacity, capacity, period)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_tokens(&self) -> u64 {
        self.refill_tokens
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Scaled units per whole token.
    fn scale(&self) -> u128 {
        self.period.as_nanos()
    }

    fn scaled_capacity(&self) -> u128 {
        self.capacity as u128 * self.scale()
    }

    /// Whole tokens held by `scaled` units, rounded down.
    fn whole_tokens(&self, scaled: u128) -> u64 {
        u64::try_from(scaled / self.scale()).unwrap_or(u64::MAX)
    }

    /// Scaled tokens available after `elapsed_nanos` of refill.
    fn refill(&self, scaled: u128, elapsed_nanos: u64) -> u128 {
        let regained = elapsed_nanos as u128 * self.refill_tokens as u128;
        scaled.saturating_add(regained).min(self.scaled_capacity())
    }

    /// Nanoseconds until `available` scaled units reach `wanted` tokens.
    fn nanos_until(&self, available: u128, wanted: u64) -> u64 {
        if wanted > self.capacity {
            return u64::MAX;
        }
        let deficit = (wanted as u128 * self.scale()).saturating_sub(available);
        u64::try_from(deficit.div_ceil(self.refill_tokens as u128)).unwrap_or(u64::MAX)
    }

    /// Time an empty bandwidth takes to refill to capacity.
    fn nanos_to_full(&self) -> u64 {
        u64::try_from(self.scaled_capacity().div_ceil(self.refill_tokens as u128)).unwrap_or(u64::MAX)
    }
}

/// An immutable, non-empty set of bandwidths applied together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfiguration {
    bandwidths: Vec<Bandwidth>,
}

impl BucketConfiguration {
    /// Build a configuration from at least one bandwidth.
    ///
    /// Bandwidth ids must be unique; token inheritance matches on them.
    pub fn new(bandwidths: Vec<Bandwidth>) -> Result<Self> {
        if bandwidths.is_empty() {
            return Err(QuotaError::InvalidBandwidth(
                "a bucket configuration needs at least one bandwidth".to_string(),
            ));
        }
        for (i, bandwidth) in bandwidths.iter().enumerate() {
            if bandwidths[..i].iter().any(|b| b.id == bandwidth.id) {
                return Err(QuotaError::InvalidBandwidth(format!(
                    "duplicate bandwidth id '{}'",
                    bandwidth.id
                )));
            }
        }
        Ok(Self { bandwidths })
    }

    pub fn bandwidths(&self) -> &[Bandwidth] {
        &self.bandwidths
    }

    /// The smallest capacity across all bandwidths.
    pub fn min_capacity(&self) -> u64 {
        self.bandwidths.iter().map(|b| b.capacity).min().unwrap_or(0)
    }

    /// How long a fully drained bucket takes to become full again.
    ///
    /// Past this, a stored state is indistinguishable from a fresh bucket.
    pub fn refill_horizon(&self) -> Duration {
        let nanos = self.bandwidths.iter().map(Bandwidth::nanos_to_full).max().unwrap_or(0);
        Duration::from_nanos(nanos)
    }
}

/// Token count for one bandwidth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthState {
    pub id: String,
    /// Tokens multiplied by the bandwidth's period in nanoseconds
    pub scaled_tokens: u128,
}

/// Token counts plus the time they were last brought up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub bandwidths: Vec<BandwidthState>,
    /// Nanoseconds since the UNIX epoch
    pub last_refill_nanos: u64,
}

impl BucketState {
    /// A bucket whose every bandwidth is at full capacity.
    pub fn full(configuration: &BucketConfiguration, now_nanos: u64) -> Self {
        Self {
            bandwidths: configuration
                .bandwidths
                .iter()
                .map(|b| BandwidthState {
                    id: b.id.clone(),
                    scaled_tokens: b.scaled_capacity(),
                })
                .collect(),
            last_refill_nanos: now_nanos,
        }
    }

    /// Whole tokens held per bandwidth of `configuration`, without refill.
    pub fn tokens(&self, configuration: &BucketConfiguration) -> Vec<u64> {
        configuration
            .bandwidths
            .iter()
            .zip(&self.bandwidths)
            .map(|(bandwidth, state)| bandwidth.whole_tokens(state.scaled_tokens))
            .collect()
    }

    /// Scaled tokens per bandwidth refilled up to `now_nanos`.
    ///
    /// Bandwidths missing from the state count as full. Time never runs
    /// backwards: a `now` earlier than the last refill (clock skew between
    /// nodes) refills nothing.
    fn refilled(&self, configuration: &BucketConfiguration, now_nanos: u64) -> Vec<u128> {
        let elapsed = now_nanos.saturating_sub(self.last_refill_nanos);
        configuration
            .bandwidths
            .iter()
            .enumerate()
            .map(|(i, bandwidth)| match self.bandwidths.get(i) {
                Some(state) => bandwidth.refill(state.scaled_tokens, elapsed),
                None => bandwidth.scaled_capacity(),
            })
            .collect()
    }

    fn with_tokens(configuration: &BucketConfiguration, scaled: Vec<u128>, at_nanos: u64) -> Self {
        Self {
            bandwidths: configuration
                .bandwidths
                .iter()
                .zip(scaled)
                .map(|(b, scaled_tokens)| BandwidthState {
                    id: b.id.clone(),
                    scaled_tokens,
                })
                .collect(),
            last_refill_nanos: at_nanos,
        }
    }

    /// Carry this state over from `old` to `new` configuration.
    pub fn inherit(
        &self,
        old: &BucketConfiguration,
        new: &BucketConfiguration,
        policy: TokenInheritance,
        now_nanos: u64,
    ) -> Self {
        let at = now_nanos.max(self.last_refill_nanos);
        let current = self.refilled(old, now_nanos);

        let scaled = new
            .bandwidths
            .iter()
            .map(|bandwidth| {
                let previous = old
                    .bandwidths
                    .iter()
                    .position(|b| b.id == bandwidth.id)
                    .map(|i| (&old.bandwidths[i], current[i]));

                match (policy, previous) {
                    (TokenInheritance::Reset, _) | (_, None) => bandwidth.scaled_capacity(),
                    (TokenInheritance::AsIs, Some((old_bandwidth, scaled))) => {
                        mul_div(scaled, bandwidth.scale(), old_bandwidth.scale()).min(bandwidth.scaled_capacity())
                    }
                    (TokenInheritance::Proportionally, Some((old_bandwidth, scaled))) => mul_div(
                        scaled,
                        bandwidth.scaled_capacity(),
                        old_bandwidth.scaled_capacity(),
                    )
                    .min(bandwidth.scaled_capacity()),
                }
            })
            .collect();

        Self::with_tokens(new, scaled, at)
    }
}

/// `value * numerator / denominator`, rounded down, degrading precision
/// rather than overflowing.
fn mul_div(value: u128, numerator: u128, denominator: u128) -> u128 {
    match value.checked_mul(numerator) {
        Some(product) => product / denominator,
        None => (value / denominator).saturating_mul(numerator),
    }
}

/// How existing tokens are reconciled when a bucket's configuration is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenInheritance {
    /// Keep raw token counts, capped at the new capacity.
    ///
    /// A larger new capacity is not filled up, but the old count may already
    /// exceed what a client would have under the new refill rate.
    #[default]
    AsIs,
    /// Keep the fill ratio of each bandwidth.
    Proportionally,
    /// Start over with full bandwidths.
    Reset,
}

/// Outcome of one attempted token withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionResult {
    pub allowed: bool,
    /// Smallest token count across bandwidths after the withdrawal
    pub remaining_tokens: u64,
    /// Zero when allowed
    pub wait_for_refill: Duration,
}

impl ConsumptionResult {
    fn allowed(remaining_tokens: u64) -> Self {
        Self {
            allowed: true,
            remaining_tokens,
            wait_for_refill: Duration::ZERO,
        }
    }

    fn denied(wait_for_refill: Duration) -> Self {
        Self {
            allowed: false,
            remaining_tokens: 0,
            wait_for_refill,
        }
    }
}

/// Try to withdraw `tokens` from every bandwidth at `now_nanos`.
///
/// Either all bandwidths are decremented or none are. The returned state
/// is refilled up to `now_nanos` in both cases.
pub fn try_consume(
    state: &BucketState,
    configuration: &BucketConfiguration,
    tokens: u64,
    now_nanos: u64,
) -> (BucketState, ConsumptionResult) {
    let at = now_nanos.max(state.last_refill_nanos);
    let mut available = state.refilled(configuration, now_nanos);
    let wanted: Vec<u128> = configuration
        .bandwidths
        .iter()
        .map(|b| tokens as u128 * b.scale())
        .collect();

    if available.iter().zip(&wanted).all(|(a, w)| a >= w) {
        for (a, w) in available.iter_mut().zip(&wanted) {
            *a -= w;
        }
        let remaining = configuration
            .bandwidths
            .iter()
            .zip(&available)
            .map(|(bandwidth, &a)| bandwidth.whole_tokens(a))
            .min()
            .unwrap_or(0);
        let next = BucketState::with_tokens(configuration, available, at);
        return (next, ConsumptionResult::allowed(remaining));
    }

    let wait = configuration
        .bandwidths
        .iter()
        .zip(&available)
        .map(|(bandwidth, &a)| bandwidth.nanos_until(a, tokens))
        .max()
        .unwrap_or(0);
    let next = BucketState::with_tokens(configuration, available, at);
    (next, ConsumptionResult::denied(Duration::from_nanos(wait)))
}
