//! Administrative and per-request entry point.

use std::sync::Arc;

use tracing::{info, trace, warn};

use crate::config::{ServiceConfig, StoreBackend};
use crate::error::{QuotaError, Result};
use crate::events::{ConfigEventBus, PublishReport};
use crate::keys::{HeaderRuleEngine, KeyResolver, RequestFact, RuleEngineRegistry};
use crate::ratelimit::{Decision, Enforcer, FailurePolicy, ProfileRegistry, ProfileSet, RateLimitSpec};
use crate::store::{BucketStore, CasBucketStore, MemoryBackend};

/// The registry, its event bus, and the enforcer reading from both.
///
/// Profile updates flow through the bus so that any other subscriber
/// registered on it sees the same batches as the registry.
#[derive(Debug, Clone)]
pub struct QuotaEngine {
    registry: Arc<ProfileRegistry>,
    bus: Arc<ConfigEventBus>,
    enforcer: Enforcer,
    failure_policy: FailurePolicy,
    enabled: bool,
}

impl QuotaEngine {
    /// Wire an engine around `store` with no profiles loaded.
    pub fn new(store: Arc<dyn BucketStore>, resolver: KeyResolver) -> Self {
        let registry = Arc::new(ProfileRegistry::new());
        let bus = Arc::new(ConfigEventBus::new());
        bus.register(registry.clone());

        Self {
            enforcer: Enforcer::new(registry.clone(), store, resolver),
            registry,
            bus,
            failure_policy: FailurePolicy::default(),
            enabled: true,
        }
    }

    /// Build an engine from service configuration, connecting the store and
    /// loading every configured rule engine.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let settings = config.store.settings();
        let store: Arc<dyn BucketStore> = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory bucket store");
                Arc::new(CasBucketStore::with_clock(
                    MemoryBackend::new(),
                    Arc::new(crate::clock::SystemClock::new()),
                    settings,
                ))
            }
            #[cfg(feature = "redis")]
            StoreBackend::Redis => {
                use crate::store::{RedisBackend, RedisBackendConfig};

                let backend = RedisBackend::connect_with_config(
                    &config.store.redis_url,
                    RedisBackendConfig {
                        key_prefix: config.store.key_prefix.clone(),
                        ttl: std::time::Duration::from_secs(config.store.ttl_secs),
                    },
                )
                .await?;
                Arc::new(CasBucketStore::with_clock(
                    backend,
                    Arc::new(crate::clock::SystemClock::new()),
                    settings,
                ))
            }
            #[cfg(not(feature = "redis"))]
            StoreBackend::Redis => {
                return Err(QuotaError::Config(
                    "the redis store backend requires the 'redis' feature".to_string(),
                ));
            }
        };

        let mut engines = RuleEngineRegistry::new();
        for (name, source) in &config.rule_engines {
            engines
                .register(name.as_str(), Arc::new(HeaderRuleEngine::new()), source)
                .await
                .map_err(|e| QuotaError::Config(format!("rule engine '{}': {}", name, e)))?;
        }

        let resolver = KeyResolver::new(engines).with_rule_timeout(config.enforcement.rule_engine_timeout());
        let mut engine = Self::new(store, resolver)
            .with_failure_policy(config.enforcement.failure_policy)
            .with_enabled(config.enforcement.enabled);
        engine.enforcer = engine.enforcer.with_inheritance(config.enforcement.token_inheritance);
        if !engine.enabled {
            warn!("Quota enforcement is disabled; every request will be let through");
        }
        Ok(engine)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Switch enforcement on or off as a whole.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enforce the quota `spec` names for the client `fact` identifies.
    ///
    /// With enforcement switched off this is [`Decision::Bypassed`] without
    /// resolving a key or touching the store.
    pub async fn enforce(&self, fact: &dyn RequestFact, spec: &RateLimitSpec) -> Result<Decision> {
        if !self.enabled {
            trace!(quota = %spec.quota_name, "Enforcement disabled, bypassing");
            return Ok(Decision::Bypassed);
        }
        self.enforcer.enforce(fact, spec).await
    }

    /// Enforce and apply the failure policy, answering whether the request
    /// may proceed.
    pub async fn admit(&self, fact: &dyn RequestFact, spec: &RateLimitSpec) -> bool {
        let outcome = self.enforce(fact, spec).await;
        self.failure_policy.admit(&outcome)
    }

    /// Publish a profile batch to every subscriber.
    ///
    /// Re-publishing unchanged versions is a no-op for the registry. Entries
    /// the registry rejects show up as its failure in the report, while the
    /// rest of the batch is still applied.
    pub fn update_profiles(&self, profiles: &ProfileSet) -> PublishReport {
        let report = self.bus.publish(profiles);
        if !report.is_complete() {
            for failure in &report.failures {
                warn!(
                    subscriber = %failure.subscriber,
                    reason = %failure.reason,
                    "Profile update not fully applied"
                );
            }
        }
        report
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<ConfigEventBus> {
        &self.bus
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Subscriber;
    use crate::keys::{HttpFact, KeyResolutionSpec};
    use crate::ratelimit::profiles_from_yaml;

    const PROFILES: &str = r#"
checkout:
  enable: true
  version: 1
  bandwidths:
    main:
      limit: 2
      duration: 1
      time_unit: seconds
"#;

    fn engine() -> QuotaEngine {
        QuotaEngine::new(Arc::new(CasBucketStore::new(MemoryBackend::new())), KeyResolver::default())
    }

    fn spec() -> RateLimitSpec {
        RateLimitSpec::new("checkout", KeyResolutionSpec::ip())
    }

    fn request() -> HttpFact {
        HttpFact::new("/checkout").with_peer_str("1.2.3.4")
    }

    #[tokio::test]
    async fn test_update_then_enforce() {
        let engine = engine();
        assert!(matches!(
            engine.enforce(&request(), &spec()).await,
            Err(QuotaError::UnknownQuota(_))
        ));
        assert!(!engine.admit(&request(), &spec()).await);

        let report = engine.update_profiles(&profiles_from_yaml(PROFILES).unwrap());
        assert!(report.is_complete());
        assert_eq!(report.delivered, 1);
        assert_eq!(engine.registry().quota_names(), vec!["checkout".to_string()]);

        assert!(engine.admit(&request(), &spec()).await);
        assert!(engine.admit(&request(), &spec()).await);
        assert!(!engine.admit(&request(), &spec()).await);
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let engine = engine();
        let profiles = profiles_from_yaml(PROFILES).unwrap();
        engine.update_profiles(&profiles);
        let before = engine.registry().pack("checkout").unwrap();

        engine.update_profiles(&profiles);
        let after = engine.registry().pack("checkout").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    struct Audit;

    impl Subscriber<ProfileSet> for Audit {
        fn name(&self) -> &str {
            "audit"
        }

        fn on_event(&self, _event: &ProfileSet) -> Result<()> {
            Err(QuotaError::Config("audit log unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_registry() {
        let engine = engine();
        engine.bus().register(Arc::new(Audit));

        let report = engine.update_profiles(&profiles_from_yaml(PROFILES).unwrap());
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber, "audit");
        assert!(engine.registry().resolve("checkout").is_ok());
    }

    #[tokio::test]
    async fn test_from_config_registers_rule_engines() {
        let config = ServiceConfig::from_yaml(
            r#"
rule_engines:
  tenants:
    kind: inline
    content: |
      - header: X-Tenant-Id
        prefix: "tenant:"
"#,
        )
        .unwrap();
        let engine = QuotaEngine::from_config(&config).await.unwrap();
        engine.update_profiles(&profiles_from_yaml(PROFILES).unwrap());

        let with_rules = spec().with_rule_engine("tenants");
        let tenant = request().with_header("X-Tenant-Id", "acme");
        assert!(engine.enforce(&tenant, &with_rules).await.unwrap().is_allowed());
        assert!(matches!(
            engine.enforce(&request(), &with_rules).await,
            Err(QuotaError::KeyResolution(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_profiles_are_acknowledged() {
        let engine = engine();
        let profiles = profiles_from_yaml(
            r#"
checkout:
  enable: true
  version: 1
  bandwidths:
    main:
      limit: 0
"#,
        )
        .unwrap();

        let report = engine.update_profiles(&profiles);
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber, "profile-registry");
        assert!(report.failures[0].reason.contains("checkout"));
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_rule_engine_names_ignore_case() {
        let config = ServiceConfig::from_yaml(
            r#"
rule_engines:
  Tenants:
    kind: inline
    content: |
      - header: X-Tenant-Id
        prefix: "tenant:"
"#,
        )
        .unwrap();
        let engine = QuotaEngine::from_config(&config).await.unwrap();
        engine.update_profiles(&profiles_from_yaml(PROFILES).unwrap());

        let tenant = request().with_header("X-Tenant-Id", "acme");
        for name in ["Tenants", "tenants"] {
            let decision = engine.enforce(&tenant, &spec().with_rule_engine(name)).await;
            assert!(decision.unwrap().is_allowed(), "engine name {}", name);
        }
    }

    #[tokio::test]
    async fn test_disabled_enforcement_lets_everything_through() {
        let config = ServiceConfig::from_yaml("enforcement:\n  enabled: false\n").unwrap();
        let engine = QuotaEngine::from_config(&config).await.unwrap();
        assert!(!engine.is_enabled());

        // no profiles are loaded, yet nothing is rejected
        let decision = engine.enforce(&request(), &spec()).await.unwrap();
        assert_eq!(decision, Decision::Bypassed);
        assert!(decision.headers().is_empty());
        assert!(engine.admit(&request(), &spec()).await);

        engine.update_profiles(&profiles_from_yaml(PROFILES).unwrap());
        for _ in 0..5 {
            assert!(engine.admit(&request(), &spec()).await);
        }
    }

    #[tokio::test]
    async fn test_from_config_rejects_broken_rule_engine() {
        let config = ServiceConfig::from_yaml("rule_engines:\n  broken:\n    kind: empty\n").unwrap();
        assert!(QuotaEngine::from_config(&config).await.is_err());
    }
}
