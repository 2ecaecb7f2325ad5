//! Validated circuit breaker configuration
//!
//! Construction goes through [`CircuitBreakerConfigBuilder`], which rejects
//! zero counts and zero durations at `build()` time. A partially configured
//! breaker is never produced: the breaker constructors re-validate whatever
//! config they are handed.

use std::time::Duration;

use thiserror::Error;

/// Error raised when a configuration value is out of range
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result type for configuration construction
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration for circuit breaker behavior
///
/// Immutable once built. `reset_timer` is carried for caller-side retry
/// pacing and is not consumed by the state machine.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip Closed to Open
    pub failure_threshold: u64,
    /// Consecutive successes in HalfOpen required to close the circuit
    pub success_to_close: u64,
    /// Concurrent in-flight probe admissions allowed in HalfOpen
    pub maximum_probes: usize,
    /// Wait after entering Open before HalfOpen is permitted
    pub cooldown: Duration,
    /// Period after which Closed-state counters are zeroed by the janitor
    pub window_size: Duration,
    /// Reserved for caller-side retry pacing
    pub reset_timer: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_to_close: 5,
            maximum_probes: 1,
            cooldown: Duration::from_secs(120),
            window_size: Duration::from_secs(240),
            reset_timer: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder with the default values
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Builder preset where any single failure opens the circuit
    pub fn zero_tolerance() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new().failure_threshold(1)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_to_close == 0 {
            return Err(ConfigError::invalid("success_to_close must be greater than 0"));
        }
        if self.maximum_probes == 0 {
            return Err(ConfigError::invalid("maximum_probes must be greater than 0"));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("cooldown must be greater than 0"));
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::invalid("window_size must be greater than 0"));
        }
        if self.reset_timer.is_zero() {
            return Err(ConfigError::invalid("reset_timer must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Number of failures within the window that trip the circuit
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Successes in HalfOpen required to close the circuit
    pub fn success_to_close(mut self, successes: u64) -> Self {
        self.config.success_to_close = successes;
        self
    }

    /// Concurrent probe admissions allowed in HalfOpen
    pub fn maximum_probes(mut self, probes: usize) -> Self {
        self.config.maximum_probes = probes;
        self
    }

    /// Wait after entering Open before HalfOpen is permitted
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Period between janitor counter resets while Closed
    pub fn window_size(mut self, window: Duration) -> Self {
        self.config.window_size = window;
        self
    }

    /// Caller-side retry pacing hint; not consumed by the state machine
    pub fn reset_timer(mut self, timer: Duration) -> Self {
        self.config.reset_timer = timer;
        self
    }

    /// Validate and produce the configuration
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
