use std::time::Duration;

use derive_ex::Ex;
use serde::{Deserialize, Serialize};

pub mod duration;


/// Configuration of a [`ComputationRegistry`](crate::ComputationRegistry) and the
/// [`LiveState`](crate::LiveState)s driven from it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub live_state: LiveStateConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Ex)]
#[derive_ex(Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// Time an unheld cell survives after invalidation before it is evicted.
    ///
    /// Used for cells whose computation does not specify its own keep-alive.
    #[serde(with = "duration")]
    #[default(Duration::from_secs(1))]
    pub keep_alive: Duration,

    /// Upper bound on the number of cells.
    ///
    /// When exceeded, unheld cells that no other cell depends on are evicted,
    /// invalidated ones first, then least recently used.
    pub max_cells: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Ex)]
#[derive_ex(Default)]
#[serde(default)]
pub struct LiveStateConfig {
    /// Delay between an invalidation and the recomputation it triggers.
    #[serde(with = "duration")]
    #[default(Duration::ZERO)]
    pub update_delay: Duration,

    /// Delay between a failed recomputation and its retry.
    #[serde(with = "duration")]
    #[default(Duration::from_secs(1))]
    pub retry_delay: Duration,

    /// If `true`, disposing a live state drops its running updater immediately.
    /// Otherwise the updater runs to completion and its result is discarded.
    #[default(true)]
    pub is_cancellation_supported: bool,
}

impl LiveStateConfig {
    pub fn with_update_delay(mut self, update_delay: Duration) -> Self {
        self.update_delay = update_delay;
        self
    }
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}
