//! Typed configuration for the device-facing core.

use std::time::Duration;

/// Device handler tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandlerConfig {
    /// Window for a device response after a request goes out.
    pub response_timeout: Duration,

    /// Silence after the last valid heartbeat that kills the session.
    pub heartbeat_timeout: Duration,
}

impl Default for DeviceHandlerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(4),
        }
    }
}

impl DeviceHandlerConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the heartbeat timeout.
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceHandlerConfig::default();
        assert_eq!(config.response_timeout, Duration::from_secs(1));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_builders() {
        let config = DeviceHandlerConfig::new()
            .with_response_timeout(Duration::from_millis(250))
            .with_heartbeat_timeout(Duration::from_secs(2));
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(2));
    }
}
