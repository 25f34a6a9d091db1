//! Versioned, hot-swappable table of compiled quota profiles.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::bucket::BucketConfiguration;
use super::profile::{BucketProfile, ProfileSet};
use crate::error::{QuotaError, Result};
use crate::events::Subscriber;

/// Compiled projection of an enabled profile.
///
/// Packs are never mutated; an update swaps in a new `Arc<BucketPack>`.
#[derive(Debug, Clone)]
pub struct BucketPack {
    pub name: String,
    pub version: String,
    pub configuration: Arc<BucketConfiguration>,
    pub compiled_at: DateTime<Utc>,
}

impl BucketPack {
    fn compile(name: &str, profile: &BucketProfile) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            version: profile.version.clone(),
            configuration: Arc::new(profile.compile(name)?),
            compiled_at: Utc::now(),
        })
    }
}

/// What a load or update batch did, per profile name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Profiles that failed to compile, with the reason
    pub skipped: Vec<(String, String)>,
    /// Disabled profiles passed over by an initial load
    pub disabled: Vec<String>,
}

/// Registry of compiled quota profiles.
///
/// Reads go straight to the table and never wait for a batch to finish;
/// writers are serialized among themselves.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    packs: DashMap<String, Arc<BucketPack>>,
    write_lock: Mutex<()>,
}

impl ProfileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-loaded with `profiles`.
    pub fn with_profiles(profiles: &ProfileSet) -> Self {
        let registry = Self::new();
        registry.load(profiles);
        registry
    }

    /// Bulk initial load. Every enabled, well-formed profile is compiled and
    /// inserted regardless of version; disabled or malformed ones are skipped.
    pub fn load(&self, profiles: &ProfileSet) -> UpdateReport {
        let _guard = self.write_lock.lock();
        let mut report = UpdateReport::default();

        for (name, profile) in profiles {
            if !profile.enable {
                warn!(quota = %name, "Skipping disabled profile");
                report.disabled.push(name.clone());
                continue;
            }
            match BucketPack::compile(name, profile) {
                Ok(pack) => {
                    info!(quota = %name, version = %pack.version, "Loaded quota profile");
                    self.packs.insert(name.clone(), Arc::new(pack));
                    report.added.push(name.clone());
                }
                Err(e) => {
                    warn!(quota = %name, error = %e, "Skipping malformed profile");
                    report.skipped.push((name.clone(), e.to_string()));
                }
            }
        }

        report
    }

    /// Reconcile the table with an update batch.
    ///
    /// The version string is the only change signal: a profile whose
    /// bandwidths changed under the same version is left untouched. A
    /// malformed entry keeps whatever was there before and does not stop the
    /// rest of the batch.
    pub fn apply_update(&self, profiles: &ProfileSet) -> UpdateReport {
        let _guard = self.write_lock.lock();
        let mut report = UpdateReport::default();

        for (name, profile) in profiles {
            let current = self.packs.get(name).map(|entry| Arc::clone(entry.value()));

            match (current, profile.enable) {
                (None, false) => {
                    debug!(quota = %name, "Ignoring disabled profile that is not loaded");
                    report.unchanged.push(name.clone());
                }
                (Some(_), false) => {
                    self.packs.remove(name);
                    info!(quota = %name, "Removed disabled quota profile");
                    report.removed.push(name.clone());
                }
                (Some(pack), true) if pack.version == profile.version => {
                    debug!(quota = %name, version = %pack.version, "Profile version unchanged");
                    report.unchanged.push(name.clone());
                }
                (current, true) => match BucketPack::compile(name, profile) {
                    Ok(pack) => {
                        let new_version = pack.version.clone();
                        self.packs.insert(name.clone(), Arc::new(pack));
                        match current {
                            Some(old) => {
                                info!(
                                    quota = %name,
                                    from = %old.version,
                                    to = %new_version,
                                    "Updated quota profile"
                                );
                                report.updated.push(name.clone());
                            }
                            None => {
                                info!(quota = %name, version = %new_version, "Added new quota profile");
                                report.added.push(name.clone());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(quota = %name, error = %e, "Skipping malformed profile update");
                        report.skipped.push((name.clone(), e.to_string()));
                    }
                },
            }
        }

        report
    }

    /// The configuration currently in force for `quota_name`.
    pub fn resolve(&self, quota_name: &str) -> Result<Arc<BucketConfiguration>> {
        self.packs
            .get(quota_name)
            .map(|entry| Arc::clone(&entry.value().configuration))
            .ok_or_else(|| QuotaError::UnknownQuota(quota_name.to_string()))
    }

    /// The full pack for `quota_name`, if enabled.
    pub fn pack(&self, quota_name: &str) -> Option<Arc<BucketPack>> {
        self.packs.get(quota_name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all enabled profiles, sorted.
    pub fn quota_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl Subscriber<ProfileSet> for ProfileRegistry {
    fn name(&self) -> &str {
        "profile-registry"
    }

    /// Apply the batch. Valid entries take effect even when others are
    /// rejected; the rejections are returned so the publisher learns of them.
    fn on_event(&self, event: &ProfileSet) -> Result<()> {
        let report = self.apply_update(event);
        debug!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "Applied profile update"
        );
        if report.skipped.is_empty() {
            Ok(())
        } else {
            Err(QuotaError::ProfilesRejected(report.skipped))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BandwidthSpec, TimeUnit};

    fn profile(version: &str, limit: u64) -> BucketProfile {
        BucketProfile::new(version).with_bandwidth("main", BandwidthSpec::new(limit, 1, TimeUnit::Seconds))
    }

    fn set(entries: Vec<(&str, BucketProfile)>) -> ProfileSet {
        entries.into_iter().map(|(n, p)| (n.to_string(), p)).collect()
    }

    #[test]
    fn test_load_skips_disabled_and_malformed() {
        let registry = ProfileRegistry::new();
        let report = registry.load(&set(vec![
            ("good", profile("1", 5)),
            ("off", profile("1", 5).disabled()),
            ("broken", BucketProfile::new("1")),
        ]));

        assert_eq!(report.added, vec!["good".to_string()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.disabled, vec!["off".to_string()]);
        assert_eq!(registry.quota_names(), vec!["good".to_string()]);
        assert!(matches!(registry.resolve("off"), Err(QuotaError::UnknownQuota(_))));
    }

    #[test]
    fn test_resolve_unknown_quota() {
        let registry = ProfileRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, QuotaError::UnknownQuota(ref name) if name == "missing"));
    }

    #[test]
    fn test_update_same_version_is_idempotent() {
        let registry = ProfileRegistry::with_profiles(&set(vec![("api", profile("1", 5))]));
        let before = registry.resolve("api").unwrap();

        let report = registry.apply_update(&set(vec![("api", profile("1", 5))]));
        assert_eq!(report.unchanged, vec!["api".to_string()]);

        let after = registry.resolve("api").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_update_same_version_different_bandwidths_is_ignored() {
        let registry = ProfileRegistry::with_profiles(&set(vec![("api", profile("1", 5))]));

        registry.apply_update(&set(vec![("api", profile("1", 50))]));

        let config = registry.resolve("api").unwrap();
        assert_eq!(config.bandwidths()[0].capacity(), 5);
    }

    #[test]
    fn test_update_new_version_recompiles() {
        let registry = ProfileRegistry::with_profiles(&set(vec![("api", profile("1", 5))]));
        let before = registry.resolve("api").unwrap();

        let report = registry.apply_update(&set(vec![("api", profile("2", 50))]));
        assert_eq!(report.updated, vec!["api".to_string()]);

        let after = registry.resolve("api").unwrap();
        assert_eq!(after.bandwidths()[0].capacity(), 50);
        assert_eq!(registry.pack("api").unwrap().version, "2");
        // readers holding the old configuration still see it intact
        assert_eq!(before.bandwidths()[0].capacity(), 5);
    }

    #[test]
    fn test_update_adds_and_removes() {
        let registry = ProfileRegistry::with_profiles(&set(vec![("checkout", profile("1", 2))]));

        let report = registry.apply_update(&set(vec![
            ("checkout", profile("1", 2).disabled()),
            ("search", profile("1", 10)),
            ("ghost", profile("1", 1).disabled()),
        ]));

        assert_eq!(report.removed, vec!["checkout".to_string()]);
        assert_eq!(report.added, vec!["search".to_string()]);
        assert_eq!(report.unchanged, vec!["ghost".to_string()]);
        assert!(matches!(
            registry.resolve("checkout"),
            Err(QuotaError::UnknownQuota(_))
        ));
        assert!(registry.resolve("search").is_ok());
    }

    #[test]
    fn test_malformed_entry_does_not_abort_batch() {
        let registry = ProfileRegistry::with_profiles(&set(vec![("api", profile("1", 5))]));

        let broken = BucketProfile::new("2").with_bandwidth("main", BandwidthSpec::new(0, 1, TimeUnit::Seconds));
        let report = registry.apply_update(&set(vec![
            ("api", broken),
            ("zeta", profile("1", 3)),
        ]));

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.added, vec!["zeta".to_string()]);
        // the previous pack stays in force
        assert_eq!(registry.pack("api").unwrap().version, "1");
    }

    #[test]
    fn test_registry_as_subscriber() {
        let registry = Arc::new(ProfileRegistry::new());
        let bus = crate::events::ConfigEventBus::new();
        bus.register(registry.clone());

        let report = bus.publish(&set(vec![("api", profile("1", 5))]));
        assert!(report.is_complete());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscriber_reports_rejected_entries() {
        let registry = Arc::new(ProfileRegistry::new());
        let bus = crate::events::ConfigEventBus::new();
        bus.register(registry.clone());

        let zero = BucketProfile::new("1").with_bandwidth("main", BandwidthSpec::new(0, 1, TimeUnit::Seconds));
        let report = bus.publish(&set(vec![("checkout", zero), ("search", profile("1", 3))]));

        assert!(!report.is_complete());
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber, "profile-registry");
        assert!(report.failures[0].reason.contains("checkout"));
        // the valid entry was still applied
        assert_eq!(registry.quota_names(), vec!["search".to_string()]);
    }
}
