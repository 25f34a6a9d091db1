//! Client key derivation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::expression::{ExpressionEvaluator, TemplateExpression};
use super::fact::RequestFact;
use super::rules::RuleEngineRegistry;
use crate::error::{QuotaError, Result};
use crate::ratelimit::RateLimitSpec;

/// Prefix of every client key.
pub const KEY_PREFIX: &str = "rl";

/// Header used by the `Header` strategy when none is configured.
pub const DEFAULT_KEY_HEADER: &str = "X-API-KEY";

/// How a client is identified when no rule engine is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Client network address
    #[default]
    #[serde(alias = "IP")]
    Ip,
    /// Value of a header, falling back to the address
    #[serde(alias = "HEADER")]
    Header,
    /// Evaluated key expression, falling back to the address
    #[serde(alias = "EXPRESSION")]
    Expression,
}

/// Static key resolution settings of a protected route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResolutionSpec {
    #[serde(default)]
    pub strategy: KeyStrategy,
    #[serde(default = "default_header_name")]
    pub header_name: String,
    #[serde(default)]
    pub expression: String,
}

fn default_header_name() -> String {
    DEFAULT_KEY_HEADER.to_string()
}

impl Default for KeyResolutionSpec {
    fn default() -> Self {
        Self::ip()
    }
}

impl KeyResolutionSpec {
    pub fn ip() -> Self {
        Self {
            strategy: KeyStrategy::Ip,
            header_name: default_header_name(),
            expression: String::new(),
        }
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self {
            strategy: KeyStrategy::Header,
            header_name: name.into(),
            ..Self::ip()
        }
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self {
            strategy: KeyStrategy::Expression,
            expression: expression.into(),
            ..Self::ip()
        }
    }
}

/// Derives `rl:{route length}:{route}:{identity}` keys from request facts.
///
/// The route scope keeps two protected routes from sharing a bucket for
/// the same client. Its byte length is part of the key because both routes
/// and identities may contain `:`.
#[derive(Clone)]
pub struct KeyResolver {
    engines: RuleEngineRegistry,
    evaluator: Arc<dyn ExpressionEvaluator>,
    rule_timeout: Duration,
}

impl std::fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResolver")
            .field("engines", &self.engines)
            .field("rule_timeout", &self.rule_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(RuleEngineRegistry::new())
    }
}

impl KeyResolver {
    /// Resolver with the template expression evaluator and a 200ms rule timeout.
    pub fn new(engines: RuleEngineRegistry) -> Self {
        Self {
            engines,
            evaluator: Arc::new(TemplateExpression::new()),
            rule_timeout: Duration::from_millis(200),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout = timeout;
        self
    }

    /// Compute the client key for `fact` under `spec`.
    ///
    /// A named rule engine takes precedence over the static strategy, and
    /// any failure on that path is an error rather than an address fallback.
    pub async fn resolve(&self, fact: &dyn RequestFact, spec: &RateLimitSpec) -> Result<String> {
        let route = fact.route_scope();
        if route.is_empty() {
            return Err(QuotaError::KeyResolution("request has no route scope".to_string()));
        }

        let identity = match spec.rule_engine.as_deref() {
            Some(engine) => self.identity_from_rules(engine, fact).await?,
            None => self.identity_from_strategy(fact, &spec.key_resolution)?,
        };

        let key = format!("{}:{}:{}:{}", KEY_PREFIX, route.len(), route, identity);
        trace!(key = %key, "Resolved client key");
        Ok(key)
    }

    async fn identity_from_rules(&self, name: &str, fact: &dyn RequestFact) -> Result<String> {
        let engine = self
            .engines
            .get(name)
            .ok_or_else(|| QuotaError::KeyResolution(format!("no rule engine named '{}'", name)))?;

        let outcome = tokio::time::timeout(self.rule_timeout, engine.fire_rules(fact))
            .await
            .map_err(|_| {
                warn!(engine = %name, timeout = ?self.rule_timeout, "Rule engine timed out");
                QuotaError::KeyResolution(format!(
                    "rule engine '{}' timed out after {:?}",
                    name, self.rule_timeout
                ))
            })?
            .map_err(|e| {
                warn!(engine = %name, error = %e, "Error firing rules");
                QuotaError::KeyResolution(format!("rule engine '{}': {}", name, e))
            })?;

        match outcome.get_result() {
            Some(identity) if !identity.is_empty() => Ok(identity.to_string()),
            _ => Err(QuotaError::KeyResolution(format!(
                "rule engine '{}' produced no identity",
                name
            ))),
        }
    }

    fn identity_from_strategy(&self, fact: &dyn RequestFact, spec: &KeyResolutionSpec) -> Result<String> {
        let identity = match spec.strategy {
            KeyStrategy::Ip => None,
            KeyStrategy::Header => fact
                .header(&spec.header_name)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            KeyStrategy::Expression if spec.expression.is_empty() => None,
            KeyStrategy::Expression => self.evaluator.evaluate(&spec.expression, fact)?,
        };

        match identity {
            Some(identity) => Ok(identity),
            None => {
                if spec.strategy != KeyStrategy::Ip {
                    debug!(strategy = ?spec.strategy, "Falling back to client address");
                }
                client_address(fact)
            }
        }
    }
}

fn client_address(fact: &dyn RequestFact) -> Result<String> {
    fact.client_ip()
        .map(str::to_string)
        .ok_or_else(|| QuotaError::KeyResolution("client address unavailable".to_string()))
}
