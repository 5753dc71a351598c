//! Coalescer configuration.

use std::time::Duration;

/// Default threshold after which a settled computation is logged as slow (5 seconds).
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(5);

/// Default factory timeout (none - computations may run indefinitely).
pub const DEFAULT_FACTORY_TIMEOUT: Option<Duration> = None;

/// Configuration for a [`RequestCoalescer`](crate::coalesce::RequestCoalescer).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stampede::config::CoalescerConfig;
///
/// // Using defaults
/// let config = CoalescerConfig::default();
/// assert_eq!(config.factory_timeout(), None);
/// assert_eq!(config.slow_threshold(), Duration::from_secs(5));
///
/// // Custom configuration
/// let config = CoalescerConfig::new()
///     .with_factory_timeout(Duration::from_secs(30))
///     .with_slow_threshold(Duration::from_millis(500));
/// assert_eq!(config.factory_timeout(), Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerConfig {
    /// Upper bound on a single shared computation
    factory_timeout: Option<Duration>,
    /// Settlements slower than this are logged at warn level
    slow_threshold: Duration,
}

impl CoalescerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every shared computation by `timeout`.
    ///
    /// When the timeout expires, all waiters bound to that computation receive
    /// [`CoalesceError::TimedOut`](crate::error::CoalesceError::TimedOut) and
    /// the key is released. Default: no timeout.
    pub fn with_factory_timeout(mut self, timeout: Duration) -> Self {
        self.factory_timeout = Some(timeout);
        self
    }

    /// Remove the factory timeout.
    pub fn without_factory_timeout(mut self) -> Self {
        self.factory_timeout = None;
        self
    }

    /// Set the slow-computation warning threshold. Default: 5 seconds.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Get the factory timeout, if any.
    pub fn factory_timeout(&self) -> Option<Duration> {
        self.factory_timeout
    }

    /// Get the slow-computation warning threshold.
    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            factory_timeout: DEFAULT_FACTORY_TIMEOUT,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoalescerConfig::default();
        assert_eq!(config.factory_timeout(), DEFAULT_FACTORY_TIMEOUT);
        assert_eq!(config.slow_threshold(), DEFAULT_SLOW_THRESHOLD);
    }

    #[test]
    fn test_new_equals_default() {
        assert_eq!(CoalescerConfig::new(), CoalescerConfig::default());
    }

    #[test]
    fn test_with_factory_timeout() {
        let config = CoalescerConfig::new().with_factory_timeout(Duration::from_secs(10));
        assert_eq!(config.factory_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.slow_threshold(), DEFAULT_SLOW_THRESHOLD); // Unchanged
    }

    #[test]
    fn test_without_factory_timeout() {
        let config = CoalescerConfig::new()
            .with_factory_timeout(Duration::from_secs(10))
            .without_factory_timeout();
        assert_eq!(config.factory_timeout(), None);
    }

    #[test]
    fn test_builder_chain() {
        let config = CoalescerConfig::new()
            .with_slow_threshold(Duration::from_millis(250))
            .with_factory_timeout(Duration::from_secs(2));

        assert_eq!(config.slow_threshold(), Duration::from_millis(250));
        assert_eq!(config.factory_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_copy_semantics() {
        let config1 = CoalescerConfig::new().with_factory_timeout(Duration::from_secs(1));
        let config2 = config1; // Copy, not move
        assert_eq!(config1.factory_timeout(), config2.factory_timeout());
    }
}
