//! Error types for the voxwire session core.
//!
//! Every failure in the crate maps onto one of these variants, and every
//! variant surfaces to the host automation layer as an `Error` lifecycle
//! event carrying the variant's display message. Nothing here is retried
//! internally; the automation layer decides whether to call `start` again.

use thiserror::Error;

/// Result type alias for session operations.
pub type VoxResult<T> = Result<T, VoxError>;

/// Errors that can occur while driving a voice-agent session.
#[derive(Error, Debug)]
pub enum VoxError {
    /// Bad input to `start` (empty agent id, malformed endpoint, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called while a session is already active.
    #[error("a session is already running")]
    AlreadyRunning,

    /// An audio device could not be claimed from the backend.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The transport could not establish a connection to the agent.
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// No audio/data activity before the configured deadline.
    #[error("timeout")]
    Timeout,

    /// Mid-stream transport failure.
    #[error("transport error: {0}")]
    TransportError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_is_bare_timeout() {
        // The host automation layer matches on this exact message.
        assert_eq!(VoxError::Timeout.to_string(), "timeout");
    }

    #[test]
    fn messages_are_human_readable() {
        let err = VoxError::InvalidConfig("agent id must not be empty".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: agent id must not be empty"
        );

        let err = VoxError::DeviceUnavailable("mic0 already claimed".into());
        assert!(err.to_string().contains("mic0"));
    }
}
