//! Configuration for the host binary.
//!
//! Loaded from environment variables with defaults matching
//! [`SessionConfig::default`].

use sandpit_core::{CoreError, SessionConfig};
use std::time::Duration;

/// Configuration for sandpit-host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Wall-clock budget per execution.
    pub execution_timeout: Duration,

    /// Budget per build.
    pub build_timeout: Duration,

    /// Budget per synthetic request.
    pub request_timeout: Duration,

    /// Checkpoint poll interval.
    pub poll_interval: Duration,

    /// Default source file name for builds and breakpoints.
    pub file_name: String,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("file name must not be empty")]
    EmptyFileName,
}

impl Default for HostConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            execution_timeout: session.execution_timeout,
            build_timeout: session.build_timeout,
            request_timeout: session.request_timeout,
            poll_interval: session.poll_interval,
            file_name: session.file_name,
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SANDPIT_TIMEOUT_MS` | `10000` |
    /// | `SANDPIT_BUILD_TIMEOUT_MS` | `30000` |
    /// | `SANDPIT_REQUEST_TIMEOUT_MS` | `5000` |
    /// | `SANDPIT_POLL_MS` | `50` |
    /// | `SANDPIT_FILE` | `Program.sp` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            execution_timeout: millis("SANDPIT_TIMEOUT_MS", default.execution_timeout),
            build_timeout: millis("SANDPIT_BUILD_TIMEOUT_MS", default.build_timeout),
            request_timeout: millis("SANDPIT_REQUEST_TIMEOUT_MS", default.request_timeout),
            poll_interval: millis("SANDPIT_POLL_MS", default.poll_interval),
            file_name: lookup("SANDPIT_FILE").unwrap_or(default.file_name),
        }
    }

    /// Validate the configured values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("SANDPIT_TIMEOUT_MS", self.execution_timeout),
            ("SANDPIT_BUILD_TIMEOUT_MS", self.build_timeout),
            ("SANDPIT_REQUEST_TIMEOUT_MS", self.request_timeout),
            ("SANDPIT_POLL_MS", self.poll_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }
        if self.file_name.trim().is_empty() {
            return Err(ConfigError::EmptyFileName);
        }
        Ok(())
    }

    /// Validate but only log a warning; invalid values are replaced by defaults
    /// in [`to_session_config`](Self::to_session_config).
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Invalid configuration; using defaults for bad values");
        }
    }

    /// Session configuration for these settings. Zero or empty values keep
    /// the session defaults.
    pub fn to_session_config(&self) -> Result<SessionConfig, CoreError> {
        let default = Self::default();
        let pick = |value: Duration, fallback: Duration| {
            if value.is_zero() {
                fallback
            } else {
                value
            }
        };
        let file_name = if self.file_name.trim().is_empty() {
            default.file_name
        } else {
            self.file_name.clone()
        };

        SessionConfig::builder()
            .execution_timeout(pick(self.execution_timeout, default.execution_timeout))
            .build_timeout(pick(self.build_timeout, default.build_timeout))
            .request_timeout(pick(self.request_timeout, default.request_timeout))
            .poll_interval(pick(self.poll_interval, default.poll_interval))
            .file_name(file_name)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::from_lookup(lookup(&[]));
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.file_name, "Program.sp");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = HostConfig::from_lookup(lookup(&[
            ("SANDPIT_TIMEOUT_MS", "2500"),
            ("SANDPIT_POLL_MS", " 5 "),
            ("SANDPIT_FILE", "main.sp"),
        ]));
        assert_eq!(config.execution_timeout, Duration::from_millis(2500));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.file_name, "main.sp");

        let session = config.to_session_config().unwrap();
        assert_eq!(session.execution_timeout, Duration::from_millis(2500));
        assert_eq!(session.file_name, "main.sp");
    }

    #[test]
    fn test_unparsable_falls_back() {
        let config = HostConfig::from_lookup(lookup(&[("SANDPIT_TIMEOUT_MS", "soon")]));
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_rejected_but_recoverable() {
        let config = HostConfig::from_lookup(lookup(&[("SANDPIT_POLL_MS", "0"), ("SANDPIT_FILE", "")]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("SANDPIT_POLL_MS"))
        ));

        let session = config.to_session_config().unwrap();
        assert_eq!(session.poll_interval, Duration::from_millis(50));
        assert_eq!(session.file_name, "Program.sp");
    }
}
