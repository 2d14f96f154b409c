//! Session configuration types.

use crate::error::CoreError;
use std::time::Duration;

/// Default source file name used when a build does not name one.
pub const DEFAULT_FILE_NAME: &str = "Program.sp";

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wall-clock budget for one execution (default: 10s).
    pub execution_timeout: Duration,
    /// Budget for one build round-trip (default: 30s).
    pub build_timeout: Duration,
    /// Budget for one synthetic request round-trip (default: 5s).
    pub request_timeout: Duration,
    /// Upper bound between wake-ups of a blocked checkpoint (default: 50ms).
    pub poll_interval: Duration,
    /// How long teardown waits for the worker task to exit (default: 1s).
    pub teardown_grace: Duration,
    /// File name given to sources built without one.
    pub file_name: String,
    /// References passed to the compiler on every build.
    pub references: Vec<String>,
    /// Capacity of the control-plane → worker channel (default: 64).
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            teardown_grace: Duration::from_secs(1),
            file_name: DEFAULT_FILE_NAME.to_string(),
            references: Vec::new(),
            channel_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Create a new config builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.execution_timeout.is_zero() {
            return Err(CoreError::Config("execution_timeout must be > 0".into()));
        }
        if self.build_timeout.is_zero() {
            return Err(CoreError::Config("build_timeout must be > 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(CoreError::Config("request_timeout must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(CoreError::Config("poll_interval must be > 0".into()));
        }
        if self.file_name.trim().is_empty() {
            return Err(CoreError::Config("file_name is required".into()));
        }
        if self.channel_capacity == 0 {
            return Err(CoreError::Config("channel_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the execution time budget.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = timeout;
        self
    }

    /// Set the build time budget.
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.config.build_timeout = timeout;
        self
    }

    /// Set the synthetic request time budget.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the checkpoint polling interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the teardown grace period.
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    /// Set the default source file name.
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.config.file_name = name.into();
        self
    }

    /// Add a compiler reference.
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.config.references.push(reference.into());
        self
    }

    /// Set the worker channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SessionConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.file_name, DEFAULT_FILE_NAME);
        assert!(config.references.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_validation_zero_timeout() {
        let result = SessionConfig::builder()
            .execution_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validation_empty_file_name() {
        let result = SessionConfig::builder().file_name("  ").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = SessionConfig::builder()
            .execution_timeout(Duration::from_millis(500))
            .poll_interval(Duration::from_millis(5))
            .file_name("main.sp")
            .reference("std")
            .build()
            .expect("should build successfully");

        assert_eq!(config.execution_timeout, Duration::from_millis(500));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.file_name, "main.sp");
        assert_eq!(config.references, vec!["std".to_string()]);
    }
}
