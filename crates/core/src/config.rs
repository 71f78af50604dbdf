use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FALLBACK_SECS: u64 = 60;
pub const DEFAULT_GRACE_SECS: u64 = 5;
pub const DEFAULT_LIVENESS_SECS: u64 = 5 * 60;
pub const DEFAULT_MAX_MESSAGE_AGE_SECS: u64 = 5 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SNAPSHOT_DEBOUNCE_MS: u64 = 250;

/// Lifetimes and cadences of the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Time a message may stay pending before it is dropped unexecuted.
    #[serde(default = "default_fallback_secs")]
    pub fallback_secs: u64,
    /// Time an executed message stays visible before removal.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Maximum gap between pings before a server record is evicted.
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
    /// Hard ceiling on message age, whatever its status.
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_snapshot_debounce_ms")]
    pub snapshot_debounce_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            fallback_secs: DEFAULT_FALLBACK_SECS,
            grace_secs: DEFAULT_GRACE_SECS,
            liveness_secs: DEFAULT_LIVENESS_SECS,
            max_message_age_secs: DEFAULT_MAX_MESSAGE_AGE_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            snapshot_debounce_ms: DEFAULT_SNAPSHOT_DEBOUNCE_MS,
        }
    }
}

impl BrokerConfig {
    pub fn fallback(&self) -> Duration {
        Duration::from_secs(self.fallback_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }

    /// Sweep cadence; never below one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }
}

pub fn default_fallback_secs() -> u64 {
    DEFAULT_FALLBACK_SECS
}

pub fn default_grace_secs() -> u64 {
    DEFAULT_GRACE_SECS
}

pub fn default_liveness_secs() -> u64 {
    DEFAULT_LIVENESS_SECS
}

pub fn default_max_message_age_secs() -> u64 {
    DEFAULT_MAX_MESSAGE_AGE_SECS
}

pub fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

pub fn default_snapshot_debounce_ms() -> u64 {
    DEFAULT_SNAPSHOT_DEBOUNCE_MS
}
