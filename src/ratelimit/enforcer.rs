//! Per-request enforcement.
//!
//! One call walks resolving the key, then the configuration, then consuming
//! from the shared bucket, and ends in an allow, a deny or an error.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::bucket::TokenInheritance;
use super::registry::ProfileRegistry;
use crate::error::{QuotaError, Result};
use crate::keys::{KeyResolutionSpec, KeyResolver, RequestFact};
use crate::store::BucketStore;

/// Header carrying the remaining allowance on an allowed request.
pub const REMAINING_HEADER: &str = "X-Rate-Limit-Remaining";
/// Header carrying the wait, in whole seconds, on a denied request.
pub const RETRY_AFTER_HEADER: &str = "X-Rate-Limit-Retry-After-Seconds";

/// Which quota protects a route and how its clients are identified.
///
/// Built by the route-binding layer once per route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub quota_name: String,
    #[serde(default)]
    pub key_resolution: KeyResolutionSpec,
    /// Named rule engine; overrides `key_resolution` when set
    #[serde(default)]
    pub rule_engine: Option<String>,
}

impl RateLimitSpec {
    pub fn new(quota_name: impl Into<String>, key_resolution: KeyResolutionSpec) -> Self {
        Self {
            quota_name: quota_name.into(),
            key_resolution,
            rule_engine: None,
        }
    }

    pub fn with_rule_engine(mut self, name: impl Into<String>) -> Self {
        self.rule_engine = Some(name.into());
        self
    }
}

/// Outcome of a successful enforcement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        remaining_tokens: u64,
    },
    Denied {
        /// `wait_for_refill` rounded up to whole seconds
        retry_after_secs: u64,
        wait_for_refill: Duration,
    },
    /// Enforcement is switched off; nothing was consumed
    Bypassed,
}

impl Decision {
    fn denied(wait_for_refill: Duration) -> Self {
        let rounded_up = wait_for_refill.as_secs() + u64::from(wait_for_refill.subsec_nanos() > 0);
        Decision::Denied {
            retry_after_secs: rounded_up.max(1),
            wait_for_refill,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. } | Decision::Bypassed)
    }

    /// Response headers a protocol layer should attach.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Decision::Allowed { remaining_tokens } => vec![(REMAINING_HEADER, remaining_tokens.to_string())],
            Decision::Denied { retry_after_secs, .. } => {
                vec![(RETRY_AFTER_HEADER, retry_after_secs.to_string())]
            }
            Decision::Bypassed => Vec::new(),
        }
    }
}

/// What to do with a request whose enforcement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    FailOpen,
    FailClosed,
}

/// Explicit admission policy for failed enforcement calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Unknown quotas and unresolvable keys
    #[serde(default = "default_misconfiguration")]
    pub misconfiguration: FailureMode,
    /// Unreachable, contended or slow store
    #[serde(default = "default_store_unavailable")]
    pub store_unavailable: FailureMode,
}

fn default_misconfiguration() -> FailureMode {
    FailureMode::FailClosed
}

fn default_store_unavailable() -> FailureMode {
    FailureMode::FailOpen
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            misconfiguration: default_misconfiguration(),
            store_unavailable: default_store_unavailable(),
        }
    }
}

impl FailurePolicy {
    /// Whether a request whose enforcement failed with `error` goes through.
    pub fn admits(&self, error: &QuotaError) -> bool {
        let mode = if error.is_store_failure() {
            self.store_unavailable
        } else {
            self.misconfiguration
        };
        mode == FailureMode::FailOpen
    }

    /// Collapse an enforcement result into an admit/reject answer.
    pub fn admit(&self, outcome: &Result<Decision>) -> bool {
        match outcome {
            Ok(decision) => decision.is_allowed(),
            Err(e) => {
                let admitted = self.admits(e);
                warn!(error = %e, admitted, "Enforcement failed");
                admitted
            }
        }
    }
}

/// Stateless per-call orchestrator over the registry, resolver and store.
#[derive(Clone)]
pub struct Enforcer {
    registry: Arc<ProfileRegistry>,
    store: Arc<dyn BucketStore>,
    resolver: KeyResolver,
    inheritance: TokenInheritance,
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcer")
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .field("inheritance", &self.inheritance)
            .finish_non_exhaustive()
    }
}

impl Enforcer {
    pub fn new(registry: Arc<ProfileRegistry>, store: Arc<dyn BucketStore>, resolver: KeyResolver) -> Self {
        Self {
            registry,
            store,
            resolver,
            inheritance: TokenInheritance::default(),
        }
    }

    /// Policy applied when a live bucket's configuration is replaced.
    pub fn with_inheritance(mut self, inheritance: TokenInheritance) -> Self {
        self.inheritance = inheritance;
        self
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    /// Consume one token for the client `fact` identifies under `spec`.
    ///
    /// A bucket created under an older version of the profile is migrated
    /// to the current configuration before the token is taken. Dropping
    /// the returned future abandons any in-flight store or rule call; a
    /// consumption already committed by the store is not refunded.
    #[instrument(skip(self, fact, spec), fields(quota = %spec.quota_name))]
    pub async fn enforce(&self, fact: &dyn RequestFact, spec: &RateLimitSpec) -> Result<Decision> {
        let key = self.resolver.resolve(fact, spec).await?;
        let configuration = self.registry.resolve(&spec.quota_name)?;

        let current = self.store.get_current_configuration(&key).await?;
        if let Some(current) = current {
            if current != *configuration {
                debug!(key = %key, policy = ?self.inheritance, "Replacing bucket configuration");
                self.store
                    .replace_configuration(&key, &configuration, self.inheritance)
                    .await?;
            }
        }

        let result = self.store.consume(&key, &configuration, 1).await?;
        let decision = if result.allowed {
            Decision::Allowed {
                remaining_tokens: result.remaining_tokens,
            }
        } else {
            Decision::denied(result.wait_for_refill)
        };

        trace!(key = %key, decision = ?decision, "Enforced quota");
        Ok(decision)
    }
}
