use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::dispatch::{Dispatcher, Strategy};

/// Facade configuration, from code or environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// How the I/O lane runs units.
    pub strategy: Strategy,
    /// Bounded queue size of a sequential lane.
    pub queue_capacity: usize,
    /// Dispatcher name; also the sequential worker's thread name.
    pub lane_name: String,
    /// Default wait used by callers that don't pick their own timeout.
    pub await_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Sequential,
            queue_capacity: 1024,
            lane_name: "relay-io".to_string(),
            await_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            strategy: match env::var("RELAY_DISPATCH_STRATEGY") {
                Ok(raw) => raw
                    .parse()
                    .context("RELAY_DISPATCH_STRATEGY must be immediate, pooled or sequential")?,
                Err(_) => defaults.strategy,
            },
            queue_capacity: match env::var("RELAY_QUEUE_CAPACITY") {
                Ok(raw) => raw
                    .parse()
                    .context("RELAY_QUEUE_CAPACITY must be a valid number")?,
                Err(_) => defaults.queue_capacity,
            },
            lane_name: env::var("RELAY_LANE_NAME").unwrap_or(defaults.lane_name),
            await_timeout: match env::var("RELAY_AWAIT_TIMEOUT_MS") {
                Ok(raw) => Duration::from_millis(
                    raw.parse()
                        .context("RELAY_AWAIT_TIMEOUT_MS must be a valid number")?,
                ),
                Err(_) => defaults.await_timeout,
            },
        })
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_lane_name(mut self, name: impl Into<String>) -> Self {
        self.lane_name = name.into();
        self
    }

    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    /// Build the dispatcher this configuration describes.
    ///
    /// The pooled strategy must be built inside a tokio runtime.
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        Dispatcher::with_strategy(self.lane_name.clone(), self.strategy, self.queue_capacity)
            .with_context(|| format!("failed to build '{}' dispatcher", self.strategy))
    }
}
