//! Quota profile definitions and their compilation into bucket configurations.
//!
//! Profiles come from a YAML file at startup or from administrative updates:
//!
//! ```yaml
//! checkout:
//!   enable: true
//!   version: "3"
//!   bandwidths:
//!     burst:
//!       limit: 10
//!       duration: 1
//!       time_unit: seconds
//!     hourly:
//!       limit: 500
//!       duration: 1
//!       time_unit: hours
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::bucket::{Bandwidth, BucketConfiguration};
use crate::error::{QuotaError, Result};

/// A batch of profiles keyed by quota name.
pub type ProfileSet = BTreeMap<String, BucketProfile>;

/// Time unit of a bandwidth's refill period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "SECONDS", alias = "second")]
    Seconds,
    #[serde(alias = "MINUTES", alias = "minute")]
    Minutes,
    #[serde(alias = "HOURS", alias = "hour")]
    Hours,
    #[serde(alias = "DAYS", alias = "day")]
    Days,
}

impl TimeUnit {
    /// Length of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Seconds => Duration::from_secs(1),
            TimeUnit::Minutes => Duration::from_secs(60),
            TimeUnit::Hours => Duration::from_secs(3600),
            TimeUnit::Days => Duration::from_secs(86400),
        }
    }
}

/// One bandwidth entry of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSpec {
    /// Tokens per window; also the bucket capacity
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Window length, in `time_unit`s
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default = "default_time_unit", alias = "timeUnit")]
    pub time_unit: TimeUnit,
}

fn default_limit() -> u64 {
    10
}

fn default_duration() -> u64 {
    1
}

fn default_time_unit() -> TimeUnit {
    TimeUnit::Minutes
}

impl BandwidthSpec {
    pub fn new(limit: u64, duration: u64, time_unit: TimeUnit) -> Self {
        Self {
            limit,
            duration,
            time_unit,
        }
    }

    /// The refill period this entry describes.
    pub fn period(&self) -> Option<Duration> {
        let seconds = self.time_unit.duration().as_secs().checked_mul(self.duration)?;
        Some(Duration::from_secs(seconds))
    }
}

/// A named, versioned set of bandwidths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProfile {
    #[serde(default, alias = "enabled")]
    pub enable: bool,
    /// Change-detection token; an edit without a new version is ignored
    #[serde(default, deserialize_with = "deserialize_version")]
    pub version: String,
    #[serde(default)]
    pub bandwidths: BTreeMap<String, BandwidthSpec>,
}

/// Accept `version: 3` as well as `version: "3"`.
fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Version::deserialize(deserializer)? {
        Version::Text(s) => s,
        Version::Integer(n) => n.to_string(),
        Version::Float(f) => f.to_string(),
    })
}

impl BucketProfile {
    /// An enabled profile with no bandwidths yet.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            enable: true,
            version: version.into(),
            bandwidths: BTreeMap::new(),
        }
    }

    /// Add a bandwidth entry.
    pub fn with_bandwidth(mut self, id: impl Into<String>, spec: BandwidthSpec) -> Self {
        self.bandwidths.insert(id.into(), spec);
        self
    }

    /// Mark the profile disabled.
    pub fn disabled(mut self) -> Self {
        self.enable = false;
        self
    }

    /// Compile the bandwidth entries into a bucket configuration.
    ///
    /// Entries are compiled in id order so the same profile always yields the
    /// same configuration.
    pub fn compile(&self, name: &str) -> Result<BucketConfiguration> {
        let malformed = |reason: String| QuotaError::MalformedProfile {
            name: name.to_string(),
            reason,
        };

        if self.bandwidths.is_empty() {
            return Err(malformed("no bandwidths defined".to_string()));
        }

        let mut bandwidths = Vec::with_capacity(self.bandwidths.len());
        for (id, spec) in &self.bandwidths {
            let period = spec
                .period()
                .ok_or_else(|| malformed(format!("{}: period overflows", id)))?;
            let bandwidth =
                Bandwidth::simple(id.as_str(), spec.limit, period).map_err(|e| malformed(e.to_string()))?;
            bandwidths.push(bandwidth);
        }

        BucketConfiguration::new(bandwidths).map_err(|e| malformed(e.to_string()))
    }
}

/// Parse a profile set from YAML (JSON is accepted as a YAML subset).
pub fn profiles_from_yaml(yaml: &str) -> Result<ProfileSet> {
    serde_yaml::from_str(yaml)
        .map_err(|e| QuotaError::Config(format!("Failed to parse profiles: {}", e)))
}

/// Load a profile set from a YAML file.
pub fn profiles_from_file<P: AsRef<Path>>(path: P) -> Result<ProfileSet> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading quota profiles");

    let contents = std::fs::read_to_string(path)?;
    profiles_from_yaml(&contents)
}
