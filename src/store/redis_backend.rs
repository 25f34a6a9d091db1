//! Redis-backed compare-and-swap backend.
//!
//! Compare-and-swap runs as a Lua script so the comparison and the write
//! happen atomically on the Redis server. Each write sets an expiry long
//! enough for the bucket to refill completely plus a configured margin, so
//! an idle bucket is dropped only once it could no longer be told apart
//! from a fresh one.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::info;

use super::{CasBackend, StoreError};

/// Upper bound on a record expiry, about a century.
const MAX_EXPIRY_MS: u64 = 100 * 365 * 86_400_000;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Prefix prepended to every bucket key
    pub key_prefix: String,
    /// How long an idle record outlives its refill horizon; zero disables expiry
    pub ttl: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            key_prefix: "quotamesh:".to_string(),
            ttl: Duration::from_secs(3600),
        }
    }
}

impl RedisBackendConfig {
    /// Expiry in milliseconds for a record that must be kept `retain_for`,
    /// or 0 for no expiry.
    pub fn expiry_millis(&self, retain_for: Duration) -> u64 {
        if self.ttl.is_zero() {
            return 0;
        }
        let millis = retain_for.saturating_add(self.ttl).as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX).min(MAX_EXPIRY_MS)
    }
}

/// Compare-and-swap backend shared by every node pointing at the same Redis.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    script: Script,
    config: RedisBackendConfig,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisBackendConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisBackendConfig) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let connection = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!(prefix = %config.key_prefix, "Connected to Redis bucket store");

        Ok(Self {
            connection,
            script: Script::new(CAS_SCRIPT),
            config,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl CasBackend for RedisBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        connection.get(self.key(key)).await.map_err(unavailable)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        retain_for: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let (has_expected, expected) = match expected {
            Some(bytes) => ("1", bytes.to_vec()),
            None => ("0", Vec::new()),
        };

        let swapped: i64 = self
            .script
            .key(self.key(key))
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .arg(self.config.expiry_millis(retain_for))
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(swapped == 1)
    }
}
