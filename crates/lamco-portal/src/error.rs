//! Error types for Portal operations
//!
//! Provides typed errors that library users can match and handle specifically.

use thiserror::Error;

use crate::session::SessionState;

/// Errors that can occur while acquiring a capture capability
///
/// All Portal operations return `Result<T, PortalError>`, allowing users to
/// tell a user denial apart from a missing device or a broken bus.
///
/// # Examples
///
/// ```no_run
/// # use lamco_portal::{PortalManager, PortalConfig, PortalError, CaptureKind};
/// # async fn example() -> Result<(), PortalError> {
/// let manager = PortalManager::new(PortalConfig::default()).await?;
/// let session = manager.session();
///
/// match session.request_access(CaptureKind::default()).await {
///     Ok(grant) => {
///         println!("Capture granted on node {:?}", grant.node_id());
///     }
///     Err(PortalError::PermissionDenied) => {
///         eprintln!("User denied permission");
///     }
///     Err(PortalError::ResourceAbsent) => {
///         eprintln!("No camera attached");
///     }
///     Err(e) => {
///         eprintln!("Other error: {}", e);
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum PortalError {
    /// Failed to connect to D-Bus session bus
    ///
    /// This usually indicates D-Bus is not running or not accessible.
    #[error("Failed to connect to D-Bus session bus")]
    DbusConnection(#[from] zbus::Error),

    /// Portal call failed below the request/response layer
    #[error("Portal request failed: {0}")]
    PortalRequest(#[from] ashpd::Error),

    /// The user dismissed the permission dialog (response code 1)
    #[error("User denied permission")]
    PermissionDenied,

    /// The broker answered a request with a non-zero code other than 1
    #[error("Portal request ended with response code {0}")]
    RequestFailed(u32),

    /// The session was cancelled while a request was in flight
    #[error("Request cancelled")]
    Cancelled,

    /// The requested capture resource does not exist (no camera attached)
    #[error("Requested capture resource is not present")]
    ResourceAbsent,

    /// The session started but the broker handed back no streams
    #[error("No streams available - user may have denied screen access")]
    NoStreamsAvailable,

    /// Failed to open the PipeWire remote for the granted session
    #[error("Failed to open PipeWire connection: {0}")]
    PipeWireFailed(String),

    /// A session lifecycle call was made from the wrong state
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidState {
        /// State the session was in
        from: SessionState,
        /// State the call tried to reach
        to: SessionState,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for Portal operations
pub type Result<T> = std::result::Result<T, PortalError>;

impl PortalError {
    /// Create a PipeWire error
    pub(crate) fn pipewire_failed(msg: impl Into<String>) -> Self {
        Self::PipeWireFailed(msg.into())
    }

    /// Map a non-zero broker response code onto an error
    pub(crate) fn from_response_code(code: u32) -> Self {
        match code {
            1 => Self::PermissionDenied,
            other => Self::RequestFailed(other),
        }
    }

    /// Whether the user (rather than the system) ended the request
    pub fn is_user_denial(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortalError::PermissionDenied;
        assert_eq!(err.to_string(), "User denied permission");

        let err = PortalError::RequestFailed(2);
        assert_eq!(err.to_string(), "Portal request ended with response code 2");
    }

    #[test]
    fn test_response_codes() {
        assert!(matches!(PortalError::from_response_code(1), PortalError::PermissionDenied));
        assert!(matches!(PortalError::from_response_code(2), PortalError::RequestFailed(2)));
    }

    #[test]
    fn test_error_helpers() {
        let err = PortalError::pipewire_failed("connection lost");
        assert!(matches!(err, PortalError::PipeWireFailed(_)));
        assert!(!err.is_user_denial());
        assert!(PortalError::Cancelled.is_user_denial());
    }

    #[test]
    fn test_invalid_state_display() {
        let err = PortalError::InvalidState {
            from: SessionState::Idle,
            to: SessionState::Connected,
        };
        assert_eq!(err.to_string(), "Invalid session transition from Idle to Connected");
    }
}
