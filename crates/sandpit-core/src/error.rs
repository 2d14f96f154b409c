//! Error types for sandpit-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandpit-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the control plane.
///
/// Faults raised by user programs never appear here directly; they are
/// converted into [`ExecuteResult`](crate::ExecuteResult) or
/// [`RouteResponse`](crate::RouteResponse) values at the sandbox boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid session state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Execute was requested before any successful build
    #[error("no compiled module is active")]
    NoModule,

    /// The build did not complete within its budget
    #[error("build timeout after {0:?}")]
    BuildTimeout(Duration),

    /// A synthetic request did not complete within its budget
    #[error("request timeout after {0:?}")]
    RequestTimeout(Duration),

    /// The sandbox worker is gone or refused the message
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Invalid breakpoint location
    #[error("invalid breakpoint: {0}")]
    InvalidBreakpoint(String),

    /// Execute named a module that is not the active one
    #[error("module {0} is not the active module")]
    UnknownModule(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors raised while compiling or registering a route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unsupported verb: {0}")]
    UnknownVerb(String),

    #[error("route template must start with '/': {0}")]
    MissingLeadingSlash(String),

    #[error("malformed placeholder '{segment}' in {template}")]
    MalformedPlaceholder { template: String, segment: String },

    #[error("duplicate parameter '{name}' in {template}")]
    DuplicateParameter { template: String, name: String },

    #[error("handler for {0} takes path parameters but the template declares none")]
    ShapeMismatch(String),

    #[error("route template has an empty segment: {0}")]
    EmptySegment(String),

    #[error("routes are already published")]
    AlreadyPublished,
}

/// A fault raised by a sandboxed program or one of its route handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The program raised an error explicitly.
    #[error("{0}")]
    Raised(String),

    /// The program panicked; the payload message is preserved when it is a string.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Cooperative cancellation was observed (stop or watchdog).
    #[error("execution cancelled")]
    Cancelled,

    /// A route could not be registered.
    #[error("route registration failed: {0}")]
    Registration(#[from] RouteError),
}

impl Fault {
    /// Build a fault from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_from_str_panic() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(Fault::from_panic(payload), Fault::Panicked("boom".into()));
    }

    #[test]
    fn test_fault_from_formatted_panic() {
        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(Fault::from_panic(payload), Fault::Panicked("code 7".into()));
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidState {
            expected: "Idle".into(),
            actual: "Building".into(),
        };
        assert_eq!(err.to_string(), "invalid state: expected Idle, got Building");
        let err = Fault::from(RouteError::UnknownVerb("FETCH".into()));
        assert_eq!(err.to_string(), "route registration failed: unsupported verb: FETCH");
    }
}
