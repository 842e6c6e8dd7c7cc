use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_batch_size() -> usize {
    64
}

/// Per-destination dispatch worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How many entries one batch takes from the queue
    ///
    /// Default: 64
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Run a pass after this long without any wake-up (in milliseconds)
    ///
    /// Workers otherwise only wake on new entries, connection state
    /// changes, status token changes and rule reloads.
    ///
    /// Default: None (no timer)
    #[serde(default)]
    pub idle_wake_ms: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_wake_ms: None,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn idle_wake(&self) -> Option<Duration> {
        self.idle_wake_ms.map(Duration::from_millis)
    }

    /// Batch size, never zero.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}
