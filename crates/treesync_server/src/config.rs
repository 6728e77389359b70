//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// Batching window for events sent to each connection.
    pub update_interval: Duration,
    /// Time between keep-alive checks.
    pub keep_alive_interval: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            update_interval: Duration::from_millis(50),
            keep_alive_interval: Duration::from_secs(30),
            max_connections: 1000,
        }
    }

    /// Sets the per-connection batching window.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Sets the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_connections(2)
            .with_update_interval(Duration::ZERO)
            .with_keep_alive_interval(Duration::from_secs(5));

        assert_eq!(config.max_connections, 2);
        assert!(config.update_interval.is_zero());
        assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
    }
}
