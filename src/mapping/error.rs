//! Error definitions for the mapping module

use thiserror::Error;

/// Errors raised around the mapping engine
///
/// None of these ever abort a tick; they surface from setup, profile loading
/// and the collaborator boundaries.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Invalid profile or binding configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A device engine could not be set up
    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// Sending or receiving on an engine channel failed
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Spawning or joining an engine thread failed
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// The requested profile is not known to the profile store
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Persisting wheel calibration failed
    #[error("Calibration store error: {0}")]
    CalibrationError(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}
