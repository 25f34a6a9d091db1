//! Token buckets, quota profiles and their enforcement.
//!
//! - [`try_consume`] is the pure greedy token-bucket algorithm.
//! - Profiles are parsed into [`BucketProfile`]s and compiled by the
//!   [`ProfileRegistry`] into shared [`BucketConfiguration`]s.
//! - The [`Enforcer`] ties a request to a bucket through the key resolver
//!   and the shared store.

mod bucket;
mod enforcer;
mod profile;
mod registry;

pub use bucket::{
    try_consume, Bandwidth, BandwidthState, BucketConfiguration, BucketState, ConsumptionResult, TokenInheritance,
};
pub use enforcer::{
    Decision, Enforcer, FailureMode, FailurePolicy, RateLimitSpec, REMAINING_HEADER, RETRY_AFTER_HEADER,
};
pub use profile::{profiles_from_file, profiles_from_yaml, BandwidthSpec, BucketProfile, ProfileSet, TimeUnit};
pub use registry::{BucketPack, ProfileRegistry, UpdateReport};
