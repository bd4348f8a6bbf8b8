use thiserror::Error;

/// Lookup failure in the property registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("property P{0} is not implemented")]
    UnknownProperty(u32),
}

/// Outcome of a single call to a remote service, classified for retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Terminal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    /// JSON that cannot be decoded usually means a truncated body from an overloaded
    /// endpoint, so it is retried.
    pub fn from_json(context: &str, error: &serde_json::Error) -> Self {
        Self::Transient(format!("{context}: {error}"))
    }
}

/// Failure returned by `RetryPolicy::run`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("{operation} failed: {message}")]
    Terminal { operation: String, message: String },
    #[error("{operation} gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },
}

impl RetryError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}
