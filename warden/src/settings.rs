//! Live-refreshed trigger intervals.
//!
//! Intervals start from [`IntervalSettings`] in the static configuration and
//! are replaced whenever the metadata service reports different values.
//! Readers hold a `watch::Receiver` and always see the latest snapshot.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::IntervalSettings;
use crate::runtime::ShutdownToken;

/// Where refreshed intervals come from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Current values; `None` fields keep the previous setting.
    async fn fetch(&self) -> anyhow::Result<IntervalOverrides>;
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct IntervalOverrides {
    #[serde(default)]
    pub describe_interval_hours: Option<i64>,
    #[serde(default)]
    pub cost_discovery_interval_hours: Option<i64>,
    #[serde(default)]
    pub compliance_interval_hours: Option<i64>,
}

impl IntervalOverrides {
    /// Apply positive overrides; zero or negative values are ignored.
    pub fn apply(&self, base: IntervalSettings) -> IntervalSettings {
        let pick = |value: Option<i64>, current: i64| {
            value.filter(|hours| *hours > 0).unwrap_or(current)
        };
        IntervalSettings {
            describe_interval_hours: pick(
                self.describe_interval_hours,
                base.describe_interval_hours,
            ),
            cost_discovery_interval_hours: pick(
                self.cost_discovery_interval_hours,
                base.cost_discovery_interval_hours,
            ),
            compliance_interval_hours: pick(
                self.compliance_interval_hours,
                base.compliance_interval_hours,
            ),
        }
    }
}

/// Metadata service reached over HTTP; expects a JSON object with the
/// override fields at `{base_url}/settings/scheduler`.
#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataSource {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self) -> anyhow::Result<IntervalOverrides> {
        let overrides = self
            .client
            .get(format!("{}/settings/scheduler", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(overrides)
    }
}

/// Polls a [`MetadataSource`] and publishes changed intervals.
pub struct MetadataRefresher {
    source: Box<dyn MetadataSource>,
    sender: watch::Sender<IntervalSettings>,
}

impl std::fmt::Debug for MetadataRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRefresher")
            .field("current", &*self.sender.borrow())
            .finish_non_exhaustive()
    }
}

impl MetadataRefresher {
    pub fn new(
        source: Box<dyn MetadataSource>,
        initial: IntervalSettings,
    ) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { source, sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<IntervalSettings> {
        self.sender.subscribe()
    }

    /// Fetch once; returns whether the settings changed.
    pub async fn refresh(&self) -> anyhow::Result<bool> {
        let overrides = self.source.fetch().await?;
        let changed = self.sender.send_if_modified(|current| {
            let next = overrides.apply(*current);
            if next == *current {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(settings = ?*self.sender.borrow(), "trigger intervals updated");
        }
        Ok(changed)
    }

    /// Refresh every `period` until shutdown. Fetch errors keep the last
    /// known settings.
    pub async fn run(self, period: Duration, shutdown: ShutdownToken) {
        loop {
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "metadata refresh failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

/// Interval receiver that never changes, for deployments without a
/// metadata service.
pub fn fixed_intervals(
    settings: IntervalSettings,
) -> watch::Receiver<IntervalSettings> {
    let (sender, receiver) = watch::channel(settings);
    // Receivers keep returning the last value after the sender is gone.
    drop(sender);
    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct ScriptedSource(Arc<Mutex<IntervalOverrides>>);

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch(&self) -> anyhow::Result<IntervalOverrides> {
            Ok(self.0.lock().clone())
        }
    }

    #[test]
    fn test_overrides_ignore_non_positive() {
        let base = IntervalSettings::default();
        let next = IntervalOverrides {
            describe_interval_hours: Some(2),
            cost_discovery_interval_hours: Some(0),
            compliance_interval_hours: None,
        }
        .apply(base);

        assert_eq!(next.describe_interval_hours, 2);
        assert_eq!(
            next.cost_discovery_interval_hours,
            base.cost_discovery_interval_hours
        );
        assert_eq!(next.compliance_interval_hours, base.compliance_interval_hours);
    }

    #[tokio::test]
    async fn test_refresh_publishes_only_changes() {
        let script = Arc::new(Mutex::new(IntervalOverrides::default()));
        let refresher = MetadataRefresher::new(
            Box::new(ScriptedSource(script.clone())),
            IntervalSettings::default(),
        );
        let rx = refresher.subscribe();

        assert!(!refresher.refresh().await.unwrap());

        script.lock().compliance_interval_hours = Some(6);
        assert!(refresher.refresh().await.unwrap());
        assert_eq!(rx.borrow().compliance_interval_hours, 6);

        assert!(!refresher.refresh().await.unwrap());
    }

    #[test]
    fn test_fixed_intervals_keep_value() {
        let rx = fixed_intervals(IntervalSettings::default());
        assert_eq!(*rx.borrow(), IntervalSettings::default());
    }
}
