//! Pluggable rule engines that derive a client identity.
//!
//! Engines are constructed at startup, loaded once through
//! [`RuleEngineRegistry::register`], and looked up by name per request.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::fact::RequestFact;

/// Errors raised by rule engines.
#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("Rules have not been loaded")]
    NotLoaded,

    #[error("Failed to load rules: {0}")]
    Load(String),

    #[error("Rule evaluation failed: {0}")]
    Evaluation(String),
}

/// Where an engine's rules come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum RuleSource {
    /// Rules given as text
    Inline(String),
    /// Rules read from a file
    File(PathBuf),
    /// Engines that need no rules
    Empty,
}

impl RuleSource {
    /// The rule text.
    pub async fn read(&self) -> Result<String, RuleEngineError> {
        match self {
            RuleSource::Inline(text) => Ok(text.clone()),
            RuleSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RuleEngineError::Load(format!("{}: {}", path.display(), e))),
            RuleSource::Empty => Ok(String::new()),
        }
    }
}

/// Result of firing rules for one fact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    identity: Option<String>,
}

impl RuleOutcome {
    pub fn identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
        }
    }

    /// No rule matched.
    pub fn none() -> Self {
        Self::default()
    }

    /// The identity the rules produced, if any.
    pub fn get_result(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}

/// A rule engine deriving client identities from request facts.
///
/// Each call to `fire_rules` returns its own outcome, so one engine can
/// serve concurrent requests.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn load_rules(&self, source: &RuleSource) -> Result<(), RuleEngineError>;

    async fn fire_rules(&self, fact: &dyn RequestFact) -> Result<RuleOutcome, RuleEngineError>;
}

/// Name to engine mapping built during initialization.
///
/// Names are case-insensitive. Configuration layers may fold the case of map
/// keys, so `Tenants` and `tenants` name the same engine.
#[derive(Default, Clone)]
pub struct RuleEngineRegistry {
    engines: HashMap<String, Arc<dyn RuleEngine>>,
}

impl fmt::Debug for RuleEngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.engines.keys().collect();
        names.sort();
        f.debug_struct("RuleEngineRegistry").field("engines", &names).finish()
    }
}

impl RuleEngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `engine`'s rules from `source` and make it available as `name`.
    pub async fn register(
        &mut self,
        name: impl Into<String>,
        engine: Arc<dyn RuleEngine>,
        source: &RuleSource,
    ) -> Result<(), RuleEngineError> {
        let name = name.into();
        engine.load_rules(source).await?;
        info!(engine = %name, "Registered rule engine");
        self.engines.insert(name.to_lowercase(), engine);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuleEngine>> {
        self.engines.get(&name.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// One rule of a [`HeaderRuleEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub header: String,
    #[serde(default)]
    pub prefix: String,
}

/// Engine picking the first present header from an ordered rule list.
///
/// ```yaml
/// - header: X-Tenant-Id
///   prefix: "tenant:"
/// - header: X-API-KEY
///   prefix: "key:"
/// ```
#[derive(Debug, Default)]
pub struct HeaderRuleEngine {
    rules: RwLock<Option<Arc<Vec<HeaderRule>>>>,
}

impl HeaderRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleEngine for HeaderRuleEngine {
    async fn load_rules(&self, source: &RuleSource) -> Result<(), RuleEngineError> {
        let text = source.read().await?;
        let rules: Vec<HeaderRule> =
            serde_yaml::from_str(&text).map_err(|e| RuleEngineError::Load(e.to_string()))?;
        if rules.is_empty() {
            return Err(RuleEngineError::Load("no header rules defined".to_string()));
        }
        debug!(rules = rules.len(), "Loaded header rules");
        *self.rules.write() = Some(Arc::new(rules));
        Ok(())
    }

    async fn fire_rules(&self, fact: &dyn RequestFact) -> Result<RuleOutcome, RuleEngineError> {
        let rules = self.rules.read().clone().ok_or(RuleEngineError::NotLoaded)?;

        let outcome = rules
            .iter()
            .find_map(|rule| {
                fact.header(&rule.header)
                    .filter(|value| !value.is_empty())
                    .map(|value| format!("{}{}", rule.prefix, value))
            })
            .map(RuleOutcome::identity)
            .unwrap_or_default();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::HttpFact;
    use tokio_test::{assert_err, assert_ok};

    const RULES: &str = r#"
- header: X-Tenant-Id
  prefix: "tenant:"
- header: X-API-KEY
  prefix: "key:"
"#;

    #[tokio::test]
    async fn test_header_rules_first_match_wins() {
        let engine = HeaderRuleEngine::new();
        engine.load_rules(&RuleSource::Inline(RULES.to_string())).await.unwrap();

        let both = HttpFact::new("/a")
            .with_header("X-API-KEY", "k1")
            .with_header("X-Tenant-Id", "acme");
        let outcome = engine.fire_rules(&both).await.unwrap();
        assert_eq!(outcome.get_result(), Some("tenant:acme"));

        let key_only = HttpFact::new("/a").with_header("X-API-KEY", "k1");
        let outcome = engine.fire_rules(&key_only).await.unwrap();
        assert_eq!(outcome.get_result(), Some("key:k1"));

        let neither = HttpFact::new("/a");
        assert_eq!(engine.fire_rules(&neither).await.unwrap(), RuleOutcome::none());
    }

    #[tokio::test]
    async fn test_fire_before_load_fails() {
        let engine = HeaderRuleEngine::new();
        let err = assert_err!(engine.fire_rules(&HttpFact::new("/a")).await);
        assert!(matches!(err, RuleEngineError::NotLoaded));
    }

    #[tokio::test]
    async fn test_load_rejects_bad_rules() {
        let engine = HeaderRuleEngine::new();
        assert_err!(engine.load_rules(&RuleSource::Inline("not: [a, list".to_string())).await);
        assert_err!(engine.load_rules(&RuleSource::Empty).await);
        assert_err!(
            engine
                .load_rules(&RuleSource::File(PathBuf::from("/nonexistent/rules.yaml")))
                .await
        );
    }

    #[tokio::test]
    async fn test_registry_loads_on_register() {
        let mut registry = RuleEngineRegistry::new();
        registry
            .register(
                "tenants",
                Arc::new(HeaderRuleEngine::new()),
                &RuleSource::Inline(RULES.to_string()),
            )
            .await
            .unwrap();

        let engine = registry.get("tenants").unwrap();
        let fact = HttpFact::new("/a").with_header("X-Tenant-Id", "acme");
        assert_eq!(
            engine.fire_rules(&fact).await.unwrap().get_result(),
            Some("tenant:acme")
        );
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn test_registry_rejects_engine_that_fails_to_load() {
        let mut registry = RuleEngineRegistry::new();
        assert_err!(
            registry
                .register("broken", Arc::new(HeaderRuleEngine::new()), &RuleSource::Empty)
                .await
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_names_ignore_case() {
        let mut registry = RuleEngineRegistry::new();
        assert_ok!(
            registry
                .register(
                    "Tenants",
                    Arc::new(HeaderRuleEngine::new()),
                    &RuleSource::Inline(RULES.to_string()),
                )
                .await
        );

        assert!(registry.get("Tenants").is_some());
        assert!(registry.get("tenants").is_some());
        assert!(registry.get("TENANTS").is_some());
        assert_eq!(registry.len(), 1);
    }
}
