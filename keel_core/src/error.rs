//! Error type shared by every keel crate.
//!
//! Each variant carries the symbolic kind of the failure plus a message.
//! Errors unwind the current call chain through `?`; nothing at this layer
//! retries.

use thiserror::Error;

/// Result alias used throughout keel.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// Error Kinds
// =============================================================================

/// Errors raised by the object substrate and the communication layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeelError {
    /// A required argument was absent.
    #[error("null argument: parameter #{arg}")]
    NullHandle {
        /// 1-based position of the offending parameter.
        arg: u32,
    },

    /// The object failed a validity heuristic or has already been freed.
    #[error("invalid object: {0}")]
    InvalidHandle(String),

    /// The object is not of the expected class.
    #[error("wrong type of object: {0}")]
    WrongType(String),

    /// The object has the right class but the wrong implementation.
    #[error("wrong subtype: {0}")]
    WrongSubtype(String),

    /// Two objects that must share a context do not.
    #[error("different communicators: {0}")]
    NotSameCommunicator(String),

    /// A bounded table or the communication layer ran out of resources.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operations were called in an order the API does not allow.
    #[error("usage error: {0}")]
    Usage(String),

    /// A required capability is not attached to the object.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An identifier outside the registered range was used.
    #[error("argument out of range: {0}")]
    OutOfRange(String),

    /// The communication layer failed.
    #[error("communication failure: {0}")]
    Comm(String),

    /// Writing to an output stream failed.
    #[error("write failed: {0}")]
    Io(String),
}

impl KeelError {
    /// Create an invalid-handle error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidHandle(message.into())
    }

    /// Create a wrong-type error.
    pub fn wrong_type(message: impl Into<String>) -> Self {
        Self::WrongType(message.into())
    }

    /// Create a wrong-subtype error.
    pub fn wrong_subtype(message: impl Into<String>) -> Self {
        Self::WrongSubtype(message.into())
    }

    /// Create a not-same-communicator error.
    pub fn not_same_comm(message: impl Into<String>) -> Self {
        Self::NotSameCommunicator(message.into())
    }

    /// Create a resource-exhausted error.
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    /// Create an out-of-range error.
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange(message.into())
    }

    /// Create a communication-layer error.
    pub fn comm(message: impl Into<String>) -> Self {
        Self::Comm(message.into())
    }

    /// Create an output error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Whether the failure leaves the participants of a collective in
    /// disagreement, so the whole group must abandon the context.
    #[inline]
    pub fn is_collective_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Comm(_))
    }
}

impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<std::fmt::Error> for KeelError {
    fn from(_: std::fmt::Error) -> Self {
        Self::Io("formatter error".to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
