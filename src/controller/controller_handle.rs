//! Controller Handle - Unified API for the report source
//!
//! Owns the gilrs collector thread and exposes its lifecycle to the
//! composition root.

use crate::controller::report::DeviceReport;
use crate::mapping::ManagerCommand;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use super::event_collector::{CollectorError, CollectorHandle, CollectorSettings};

/// Configuration settings for the controller subsystem
///
/// # Performance Impact
///
/// - `poll_interval_ms`: how often every connected gamepad is snapshotted.
///   DS4-class controllers report at 250Hz over USB, so values below 4ms only
///   repeat identical snapshots.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Snapshot interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4,
        }
    }
}

/// Errors that can occur during controller initialization or operation
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Error from the collection subsystem
    ///
    /// Typically indicates gamepad detection issues or driver problems.
    #[error("Collector error: {0}")]
    CollectorError(#[from] CollectorError),

    /// General initialization error
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

/// Handle for the controller subsystem lifecycle
#[derive(Debug)]
pub struct ControllerHandle {
    collector: CollectorHandle,
}

impl ControllerHandle {
    /// Spawns the report source
    ///
    /// Snapshots flow into `report_sender`; disconnects are announced on
    /// `command_sender` as [`ManagerCommand::Release`].
    pub fn spawn(
        settings: Option<ControllerSettings>,
        report_sender: mpsc::Sender<DeviceReport>,
        command_sender: mpsc::Sender<ManagerCommand>,
    ) -> Result<Self, ControllerError> {
        info!(
            "Initializing Controller system with settings: {:?}",
            settings
        );
        let settings = settings.unwrap_or_default();
        if settings.poll_interval_ms == 0 {
            return Err(ControllerError::InitializationError(
                "poll interval must be at least 1ms".to_string(),
            ));
        }

        let collector_settings = CollectorSettings {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        };
        debug!("Collector settings: {:?}", collector_settings);

        let collector =
            CollectorHandle::spawn(Some(collector_settings), report_sender, command_sender)?;

        info!("Controller system initialized successfully");
        Ok(Self { collector })
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down controller system");
        self.collector.shutdown();
    }
}
