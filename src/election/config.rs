use std::time::Duration;

use log::warn;
use rand::Rng;

use super::ElectionError;

pub const DEFAULT_MIN_AWAIT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_AWAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Timer settings for one node.
///
/// `heartbeat_interval` must be shorter than `min_await` so that followers
/// hear from a healthy leader before their election timeout fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    pub min_await: Duration,
    pub max_await: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_initial_delay: Duration,
    pub rpc_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            min_await: DEFAULT_MIN_AWAIT,
            max_await: DEFAULT_MAX_AWAIT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_initial_delay: DEFAULT_HEARTBEAT_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ElectionConfig {
    pub fn new(min_await: Duration, max_await: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            min_await,
            max_await,
            heartbeat_interval,
            heartbeat_initial_delay: heartbeat_interval,
            ..Self::default()
        }
    }

    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    pub fn with_heartbeat_initial_delay(mut self, delay: Duration) -> Self {
        self.heartbeat_initial_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ElectionError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.min_await {
            return Err(ElectionError::InvalidConfig(format!(
                "heartbeat interval {:?} must be shorter than min await time {:?}",
                self.heartbeat_interval, self.min_await
            )));
        }
        if self.min_await >= self.max_await {
            return Err(ElectionError::InvalidConfig(format!(
                "min await time {:?} must be shorter than max await time {:?}",
                self.min_await, self.max_await
            )));
        }
        Ok(())
    }

    /// Returns the config unchanged if valid, otherwise with the timing
    /// values reset to their defaults.
    pub fn validated(self) -> Self {
        match self.validate() {
            Ok(()) => self,
            Err(e) => {
                warn!("{e}; resetting leader election timing to defaults");
                Self {
                    min_await: DEFAULT_MIN_AWAIT,
                    max_await: DEFAULT_MAX_AWAIT,
                    heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                    heartbeat_initial_delay: DEFAULT_HEARTBEAT_INTERVAL,
                    rpc_timeout: self.rpc_timeout,
                }
            }
        }
    }

    /// Draws an election timeout uniformly from `[min_await, max_await)`.
    pub fn random_timeout(&self) -> Duration {
        let min = self.min_await.as_millis() as u64;
        let max = self.max_await.as_millis() as u64;
        if max <= min {
            return self.min_await;
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(min..max))
    }
}
