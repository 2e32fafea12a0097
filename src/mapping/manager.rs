//! Manager for per-device mapping engines
//!
//! Routes every incoming report to the engine of its device, spawning the
//! engine on the first report a device sends.
//!
//! ```text
//!                    ┌──► engine-dev0 ──┐
//! DeviceReport ──►  Manager ──► engine-dev1 ──┼──► MappedState
//!                    └──► engine-dev2 ──┘
//! ```

use crate::controller::report::{DeviceIndex, DeviceReport, MappedState};
use crate::mapping::engine::{DeviceEngineHandle, MapperDeps};
use crate::mapping::feedback::{DeviceFeedback, RumbleState};
use crate::mapping::{MappingError, Profile};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands accepted by the manager task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    /// Reload the current profile of every running engine
    ReloadAll,
    /// Assign a profile to a device and reload its engine
    Reload { device: DeviceIndex, profile: String },
    /// Route rumble from the virtual output device to a physical device
    Rumble { device: DeviceIndex, rumble: RumbleState },
    /// Stop a device engine and release everything it holds
    Release(DeviceIndex),
}

pub struct MappingEngineManager {
    /// Running engines, indexed by device
    engines: HashMap<DeviceIndex, DeviceEngineHandle>,
    report_rx: mpsc::Receiver<DeviceReport>,
    command_rx: mpsc::Receiver<ManagerCommand>,
    mapped_tx: mpsc::Sender<MappedState>,
    deps: MapperDeps,
    default_profile: String,
    /// Profile assignments that differ from the default
    assignments: HashMap<DeviceIndex, String>,
    cancel: CancellationToken,
}

impl MappingEngineManager {
    pub fn new(
        report_rx: mpsc::Receiver<DeviceReport>,
        command_rx: mpsc::Receiver<ManagerCommand>,
        mapped_tx: mpsc::Sender<MappedState>,
        deps: MapperDeps,
        default_profile: String,
        cancel: CancellationToken,
    ) -> Self {
        info!("Creating new MappingEngineManager");
        Self {
            engines: HashMap::new(),
            report_rx,
            command_rx,
            mapped_tx,
            deps,
            default_profile,
            assignments: HashMap::new(),
            cancel,
        }
    }

    pub fn assign_profile(&mut self, device: DeviceIndex, profile: String) {
        self.assignments.insert(device, profile);
    }

    pub fn profile_for(&self, device: DeviceIndex) -> &str {
        self.assignments
            .get(&device)
            .map(String::as_str)
            .unwrap_or(&self.default_profile)
    }

    pub fn is_engine_running(&self, device: DeviceIndex) -> bool {
        self.engines.contains_key(&device)
    }

    pub fn active_engines(&self) -> Vec<(DeviceIndex, String)> {
        let mut active: Vec<_> = self
            .engines
            .iter()
            .map(|(device, handle)| (*device, handle.name.clone()))
            .collect();
        active.sort();
        active
    }

    pub fn feedback(&self, device: DeviceIndex) -> Option<DeviceFeedback> {
        self.engines.get(&device).map(DeviceEngineHandle::feedback)
    }

    fn resolve_profile(&self, device: DeviceIndex) -> Profile {
        let name = self.profile_for(device);
        match self.deps.profiles.load_profile(name) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("{} falls back to passthrough, profile '{}' unavailable: {}", device, name, e);
                Profile::passthrough(name)
            }
        }
    }

    fn engine_for(&mut self, device: DeviceIndex) -> Result<&DeviceEngineHandle, MappingError> {
        if !self.engines.contains_key(&device) {
            info!("First report from {}, starting engine", device);
            let profile = self.resolve_profile(device);
            let handle =
                DeviceEngineHandle::spawn(device, profile, &self.deps, self.mapped_tx.clone())?;
            self.engines.insert(device, handle);
        }
        self.engines
            .get(&device)
            .ok_or_else(|| MappingError::InitializationError(format!("No engine for {}", device)))
    }

    /// Hands a report to its device engine
    pub async fn route_report(&mut self, report: DeviceReport) -> Result<(), MappingError> {
        let device = report.device;
        let result = self.engine_for(device)?.try_send_report(report);
        if let Err(e) = result {
            warn!("Engine for {} stopped accepting reports: {}", device, e);
            self.release(device).await?;
        }
        Ok(())
    }

    pub async fn handle_command(&mut self, command: ManagerCommand) -> Result<(), MappingError> {
        debug!("Manager command: {:?}", command);
        match command {
            ManagerCommand::ReloadAll => {
                for (device, handle) in &self.engines {
                    let name = self
                        .assignments
                        .get(device)
                        .unwrap_or(&self.default_profile);
                    handle.reload_profile(name)?;
                }
            }
            ManagerCommand::Reload { device, profile } => {
                if let Some(handle) = self.engines.get(&device) {
                    handle.reload_profile(&profile)?;
                }
                self.assign_profile(device, profile);
            }
            ManagerCommand::Rumble { device, rumble } => match self.engines.get(&device) {
                Some(handle) => handle.route_rumble(rumble),
                None => debug!("Rumble for {} without engine", device),
            },
            ManagerCommand::Release(device) => self.release(device).await?,
        }
        Ok(())
    }

    /// Stops the engine of one device
    pub async fn release(&mut self, device: DeviceIndex) -> Result<(), MappingError> {
        let Some(mut handle) = self.engines.remove(&device) else {
            warn!("No active engine for {}", device);
            return Ok(());
        };
        info!("Releasing engine: {}", handle.name);
        handle.shutdown().await
    }

    /// Runs until cancelled or every input channel closes
    pub async fn run(mut self) -> Result<(), MappingError> {
        info!("Start mapping");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Manager cancelled");
                    break;
                }
                report = self.report_rx.recv() => match report {
                    Some(report) => {
                        if let Err(e) = self.route_report(report).await {
                            error!("Failed to route report: {}", e);
                        }
                    }
                    None => {
                        info!("Report source closed");
                        break;
                    }
                },
                Some(command) = self.command_rx.recv() => {
                    if let Err(e) = self.handle_command(command).await {
                        error!("Failed to handle manager command: {}", e);
                    }
                }
            }
        }
        self.shutdown_all().await
    }

    pub async fn shutdown_all(&mut self) -> Result<(), MappingError> {
        info!("Deactivating all mapping engines");
        let devices: Vec<DeviceIndex> = self.engines.keys().copied().collect();
        for device in devices {
            if let Err(e) = self.release(device).await {
                error!("Error releasing engine for {}: {}", device, e);
            }
        }
        info!("All mapping engines deactivated");
        Ok(())
    }
}

impl std::fmt::Debug for MappingEngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingEngineManager")
            .field("engines", &self.engines.len())
            .field("default_profile", &self.default_profile)
            .finish_non_exhaustive()
    }
}
