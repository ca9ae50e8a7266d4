use std::fmt;

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle on one delivery of a queued message. Acks and naks must present
/// the lease they were fetched under, so a consumer whose lease expired
/// cannot settle a message that was redelivered to someone else.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How result messages that could not be applied come back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// A message delivered this many times is acked and dropped.
    pub max_deliveries: u32,
    pub base_delay_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction of the delay added at random, spreading out consumers that
    /// failed on the same outage. `0.0` disables it.
    pub jitter: f64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 10,
            base_delay_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter: 0.2,
        }
    }
}

fn backoff_ms(deliveries: u32, config: &RedeliveryConfig) -> u64 {
    if deliveries == 0 {
        return 0;
    }
    let shift = deliveries.saturating_sub(1).min(32);
    config
        .base_delay_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_backoff_ms)
}

/// Delay before a nak'ed message becomes visible again: doubling from
/// `base_delay_ms` per delivery, capped, plus up to `jitter` of itself.
pub fn compute_redelivery_delay(deliveries: u32, config: &RedeliveryConfig) -> Duration {
    let delay = backoff_ms(deliveries, config);
    let spread = (delay as f64 * config.jitter.clamp(0.0, 1.0)) as u64;
    let extra = if spread == 0 {
        0
    } else {
        rand::rng().random_range(0..=spread)
    };
    Duration::milliseconds(delay.saturating_add(extra).min(i64::MAX as u64) as i64)
}

pub fn exhausted_deliveries(deliveries: u32, config: &RedeliveryConfig) -> bool {
    deliveries >= config.max_deliveries
}
