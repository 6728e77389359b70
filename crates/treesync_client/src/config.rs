//! Configuration for the client coordinator.

use std::time::Duration;

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Batching window for outbound traffic. Mutations and protocol events
    /// queued inside one window leave in a single envelope.
    pub update_interval: Duration,
}

impl ClientConfig {
    /// Creates a configuration with the default window.
    pub fn new() -> Self {
        Self {
            update_interval: Duration::from_millis(50),
        }
    }

    /// Creates a configuration that sends every mutation and event at once.
    pub fn immediate() -> Self {
        Self {
            update_interval: Duration::ZERO,
        }
    }

    /// Sets the batching window.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
