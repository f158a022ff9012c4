//! Error types for the Funcwave Kubernetes Operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error
    Configuration(String),
    /// The dispatched object was not of the expected kind
    UnexpectedObject(String),
    /// Function name fails the qualified-name rules
    InvalidName(String),
    /// Child resources did not become available
    Readiness(String),
    /// A panic was captured during reconciliation
    Panic(String),
    /// Serialization error
    Serialization(String),
    /// An error wrapped with additional context
    Wrapped(String, Box<OperatorError>),
}

impl OperatorError {
    /// Wrap this error with a context message, preserving it as the source.
    pub fn wrap(self, message: impl Into<String>) -> Self {
        OperatorError::Wrapped(message.into(), Box::new(self))
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::UnexpectedObject(msg) => write!(f, "Unexpected object: {}", msg),
            OperatorError::InvalidName(msg) => write!(f, "Invalid function name: {}", msg),
            OperatorError::Readiness(msg) => write!(f, "Readiness error: {}", msg),
            OperatorError::Panic(msg) => write!(f, "Captured panic: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::Wrapped(msg, _) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for OperatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperatorError::Wrapped(_, source) => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

/// Extract a readable message from a captured panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Render an error and its source chain as a newline-separated stack,
/// bounded to `max_depth` frames. Used for status messages.
pub fn error_stack(err: &dyn std::error::Error, max_depth: usize) -> String {
    let mut frames = Vec::new();
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = current {
        if frames.len() >= max_depth {
            break;
        }
        frames.push(e.to_string());
        current = e.source();
    }
    frames.join("\n")
}
