//! Periodic reload of the profile file.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{ConfigEventBus, PublishReport};
use crate::ratelimit::profiles_from_yaml;

/// Re-reads a profile file on an interval and publishes it on the bus.
///
/// Unchanged file contents are not republished. Changed contents still only
/// affect profiles whose version moved.
#[derive(Debug)]
pub struct ProfileWatcher {
    path: PathBuf,
    interval: Duration,
    bus: Arc<ConfigEventBus>,
    last_contents: Mutex<Option<String>>,
}

impl ProfileWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, bus: Arc<ConfigEventBus>) -> Self {
        Self {
            path: path.into(),
            interval,
            bus,
            last_contents: Mutex::new(None),
        }
    }

    /// Read the file and publish it if its contents changed.
    ///
    /// Returns `None` when nothing was published.
    pub async fn reload(&self) -> Result<Option<PublishReport>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        if self.last_contents.lock().as_deref() == Some(contents.as_str()) {
            debug!(path = %self.path.display(), "Profile file unchanged");
            return Ok(None);
        }

        let profiles = profiles_from_yaml(&contents)?;
        info!(path = %self.path.display(), profiles = profiles.len(), "Publishing reloaded profiles");
        let report = self.bus.publish(&profiles);
        *self.last_contents.lock() = Some(contents);
        Ok(Some(report))
    }

    /// Reload every interval until `shutdown` completes.
    ///
    /// The first reload happens one interval after the call; read and parse
    /// errors are logged and the previous profiles stay in effect.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(ticker);
        tokio::pin!(shutdown);

        info!(path = %self.path.display(), interval = ?self.interval, "Watching profile file");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = ticks.next() => {
                    if let Err(e) = self.reload().await {
                        warn!(path = %self.path.display(), error = %e, "Failed to reload profiles");
                    }
                }
            }
        }
        info!("Profile watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ProfileRegistry;

    fn profiles(version: u32, limit: u32) -> String {
        format!(
            "checkout:\n  enable: true\n  version: {}\n  bandwidths:\n    main:\n      limit: {}\n",
            version, limit
        )
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("quotamesh-{}-{}.yaml", name, uuid::Uuid::new_v4()))
    }

    fn setup() -> (Arc<ProfileRegistry>, Arc<ConfigEventBus>) {
        let registry = Arc::new(ProfileRegistry::new());
        let bus = Arc::new(ConfigEventBus::new());
        bus.register(registry.clone());
        (registry, bus)
    }

    #[tokio::test]
    async fn test_reload_publishes_changes_only() {
        let (registry, bus) = setup();
        let path = temp_path("reload");
        std::fs::write(&path, profiles(1, 5)).unwrap();
        let watcher = ProfileWatcher::new(&path, Duration::from_secs(60), bus);

        assert!(watcher.reload().await.unwrap().is_some());
        assert_eq!(registry.pack("checkout").unwrap().version, "1");
        assert!(watcher.reload().await.unwrap().is_none());

        std::fs::write(&path, profiles(2, 7)).unwrap();
        let report = watcher.reload().await.unwrap().unwrap();
        assert!(report.is_complete());
        assert_eq!(registry.pack("checkout").unwrap().version, "2");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_bad_file_keeps_previous_profiles() {
        let (registry, bus) = setup();
        let path = temp_path("bad");
        std::fs::write(&path, profiles(1, 5)).unwrap();
        let watcher = ProfileWatcher::new(&path, Duration::from_secs(60), bus);
        watcher.reload().await.unwrap();

        std::fs::write(&path, "checkout: [not, a, profile").unwrap();
        assert!(watcher.reload().await.is_err());
        assert!(registry.resolve("checkout").is_ok());

        std::fs::remove_file(&path).unwrap();
        assert!(watcher.reload().await.is_err());
        assert!(registry.resolve("checkout").is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (registry, bus) = setup();
        let path = temp_path("run");
        std::fs::write(&path, profiles(1, 5)).unwrap();
        let watcher = ProfileWatcher::new(&path, Duration::from_millis(10), bus);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(watcher.run(async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.resolve("checkout").is_ok());

        tx.send(()).unwrap();
        handle.await.unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
