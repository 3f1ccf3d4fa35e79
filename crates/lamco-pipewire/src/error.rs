//! Error types for PipeWire capture
//!
//! Errors are grouped into an [`ErrorType`] taxonomy so callers can decide on
//! recovery without matching every variant.

use thiserror::Error;

/// Errors that can occur while negotiating or exchanging buffers
#[derive(Error, Debug)]
pub enum PipeWireError {
    /// PipeWire main loop, context or thread could not be set up
    #[error("PipeWire initialization failed: {0}")]
    InitializationFailed(String),

    /// Connecting the context to the daemon failed
    #[error("PipeWire connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Stream could not be created or connected
    #[error("Stream creation failed: {0}")]
    StreamCreationFailed(String),

    /// No stream with this id
    #[error("Stream {0} not found")]
    StreamNotFound(u32),

    /// Too many concurrent streams
    #[error("Too many streams (limit {0})")]
    TooManyStreams(usize),

    /// The loop thread went away or did not answer
    #[error("Thread communication failed: {0}")]
    ThreadCommunicationFailed(String),

    /// The core reported an error while a sync round was pending
    #[error("Core sync failed: {0}")]
    SyncFailed(String),

    /// A bounded wait expired
    #[error("Timed out waiting for PipeWire")]
    Timeout,

    /// Parameter pods grew beyond the allowed size
    #[error("Parameter buffer overflow: {needed} bytes needed, limit {limit}")]
    ParamOverflow {
        /// Total bytes after the failing pod
        needed: usize,
        /// Configured limit
        limit: usize,
    },

    /// A pod could not be serialized
    #[error("Pod serialization failed: {0}")]
    PodSerialization(String),

    /// Error from the PipeWire bindings
    #[error("PipeWire error: {0}")]
    PipeWire(#[from] pipewire::Error),
}

/// Result type for PipeWire operations
pub type Result<T> = std::result::Result<T, PipeWireError>;

/// Coarse error categories
///
/// Per-frame failures never surface as [`PipeWireError`]; they are reported
/// as [`ProcessOutcome`](crate::exchange::ProcessOutcome) and categorized
/// through [`ProcessOutcome::error_type`](crate::exchange::ProcessOutcome::error_type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Broker or daemon unreachable, descriptor invalid
    Connection,
    /// User denied or cancelled
    Permission,
    /// Unexpected media type or unsupported pixel format
    Format,
    /// GPU buffer import failed
    Import,
    /// Surface or parameter memory exhausted
    Allocation,
    /// Buffer could not be turned into a frame
    Buffer,
    /// Bugs and broken invariants
    Internal,
}

/// What to do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Prune the failing modifier and renegotiate on the same stream
    Renegotiate,
    /// Drop the current frame and keep going
    DropFrame,
    /// Tear the session down and acquire a new capability
    RestartSession,
    /// Give up
    Abort,
}

impl ErrorType {
    /// Recovery for this category
    pub fn recovery(self) -> RecoveryAction {
        match self {
            Self::Import => RecoveryAction::Renegotiate,
            Self::Format | Self::Buffer => RecoveryAction::DropFrame,
            Self::Connection | Self::Permission => RecoveryAction::RestartSession,
            Self::Allocation | Self::Internal => RecoveryAction::Abort,
        }
    }
}

/// Classify an error for recovery decisions
pub fn classify_error(error: &PipeWireError) -> ErrorType {
    match error {
        PipeWireError::ConnectionFailed(_)
        | PipeWireError::SyncFailed(_)
        | PipeWireError::Timeout
        | PipeWireError::PipeWire(_) => ErrorType::Connection,
        PipeWireError::ParamOverflow { .. } => ErrorType::Allocation,
        PipeWireError::InitializationFailed(_)
        | PipeWireError::InvalidState(_)
        | PipeWireError::InvalidParameter(_)
        | PipeWireError::StreamCreationFailed(_)
        | PipeWireError::StreamNotFound(_)
        | PipeWireError::TooManyStreams(_)
        | PipeWireError::ThreadCommunicationFailed(_)
        | PipeWireError::PodSerialization(_) => ErrorType::Internal,
    }
}

impl PipeWireError {
    pub(crate) fn thread_gone(what: &str) -> Self {
        Self::ThreadCommunicationFailed(format!("{what}: loop thread not responding"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(classify_error(&PipeWireError::Timeout), ErrorType::Connection);
        assert_eq!(
            classify_error(&PipeWireError::SyncFailed("EPIPE".into())),
            ErrorType::Connection
        );
        assert_eq!(
            classify_error(&PipeWireError::ParamOverflow { needed: 10, limit: 5 }),
            ErrorType::Allocation
        );
        assert_eq!(classify_error(&PipeWireError::StreamNotFound(7)), ErrorType::Internal);
    }

    #[test]
    fn test_recovery() {
        assert_eq!(ErrorType::Import.recovery(), RecoveryAction::Renegotiate);
        assert_eq!(ErrorType::Format.recovery(), RecoveryAction::DropFrame);
        assert_eq!(ErrorType::Buffer.recovery(), RecoveryAction::DropFrame);
        assert_eq!(ErrorType::Permission.recovery(), RecoveryAction::RestartSession);
        assert_eq!(ErrorType::Internal.recovery(), RecoveryAction::Abort);
    }

    #[test]
    fn test_display() {
        let err = PipeWireError::ParamOverflow { needed: 70000, limit: 65536 };
        assert_eq!(
            err.to_string(),
            "Parameter buffer overflow: 70000 bytes needed, limit 65536"
        );
    }
}
