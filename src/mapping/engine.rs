//! Per-device mapping engine with statum lifecycle
//!
//! [`DeviceMapper`] is the synchronous per-report pipeline. [`DeviceEngine`]
//! drives it on a dedicated thread, one per connected controller.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Configured ──► Active ──► Deactivating ──► Deactivated
//! ```
//!
//! # Architecture
//!
//! ```text
//! DeviceReport ──► [DeviceMapper] ──► MappedState
//!       ▲                │   │              │
//!       │                │   └─► feedback   ▼
//!  Report Channel        ▼        (watch)   Output Channel
//!                SyntheticStateCommitter
//! ```

use crate::controller::report::{DeviceIndex, DeviceReport, MappedState};
use crate::mapping::axis_shaper::AxisShaper;
use crate::mapping::binding::{BindingTable, Extras};
use crate::mapping::controls::{Control, FieldMapping};
use crate::mapping::feedback::{DeviceFeedback, RumbleState};
use crate::mapping::remapper::{ControlRemapper, ExtrasEvent};
use crate::mapping::special_action::{
    ActionInput, ProfileSwitch, ProgramLauncher, SpecialActionEngine,
};
use crate::mapping::synthetic::{SyntheticState, SyntheticStateCommitter};
use crate::mapping::wheel::{CalibrationStore, WheelEmulation};
use crate::mapping::{MappingError, Profile, ProfileStore};
use statum::{machine, state};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Collaborators shared by every device engine
#[derive(Clone)]
pub struct MapperDeps {
    pub committer: Arc<SyntheticStateCommitter>,
    pub profiles: Arc<dyn ProfileStore>,
    pub calibrations: Arc<dyn CalibrationStore>,
    pub launcher: Arc<dyn ProgramLauncher>,
}

impl std::fmt::Debug for MapperDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperDeps").finish_non_exhaustive()
    }
}

/// Temporary profile context, kept outside the profile so it survives the
/// reload it causes
#[derive(Debug, Clone)]
struct TempProfile {
    restore: String,
    triggers: Vec<Control>,
    untriggers: Vec<Control>,
    auto_untrigger: bool,
}

/// Output of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickResult {
    pub mapped: MappedState,
    pub feedback: DeviceFeedback,
}

/// The per-device pipeline: shape, remap, special actions, wheel, commit
pub struct DeviceMapper {
    device: DeviceIndex,
    profile: Profile,
    shaper: AxisShaper,
    input: FieldMapping,
    remapper: ControlRemapper,
    actions: SpecialActionEngine,
    wheel: WheelEmulation,
    synth: SyntheticState,
    temp: Option<TempProfile>,
    extras: Option<Extras>,
    routed_rumble: RumbleState,
    committer: Arc<SyntheticStateCommitter>,
    profiles: Arc<dyn ProfileStore>,
}

impl DeviceMapper {
    pub fn new(device: DeviceIndex, profile: Profile, deps: &MapperDeps) -> Self {
        info!("Creating mapper for {} with profile '{}'", device, profile.name);
        Self {
            device,
            shaper: AxisShaper::new(&profile.axis),
            input: FieldMapping::default(),
            remapper: ControlRemapper::new(Arc::clone(&profile.bindings)),
            actions: SpecialActionEngine::new(
                Arc::clone(&profile.actions),
                &profile.bindings,
                Arc::clone(&deps.launcher),
            ),
            wheel: WheelEmulation::new(device, profile.wheel.clone(), Arc::clone(&deps.calibrations)),
            synth: SyntheticState::new(),
            temp: None,
            extras: None,
            routed_rumble: RumbleState::default(),
            committer: Arc::clone(&deps.committer),
            profiles: Arc::clone(&deps.profiles),
            profile,
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn profile_name(&self) -> &str {
        &self.profile.name
    }

    pub fn is_temporary_profile(&self) -> bool {
        self.temp.is_some()
    }

    pub fn wheel(&self) -> &WheelEmulation {
        &self.wheel
    }

    /// Rumble routed back in from the virtual output device
    pub fn set_routed_rumble(&mut self, rumble: RumbleState) {
        self.routed_rumble = rumble;
    }

    /// Loads a profile by name and makes it the base profile
    pub fn reload_named(&mut self, name: &str) -> Result<(), MappingError> {
        let profile = self.profiles.load_profile(name)?;
        self.reload_profile(profile);
        Ok(())
    }

    /// Replaces the base profile, dropping any temporary profile context
    pub fn reload_profile(&mut self, profile: Profile) {
        info!("{} reloading profile '{}'", self.device, profile.name);
        self.temp = None;
        self.apply_profile(profile);
    }

    fn apply_profile(&mut self, profile: Profile) {
        self.shaper = AxisShaper::new(&profile.axis);
        if let Some(ExtrasEvent::Deactivated { owner }) =
            self.remapper.reload(Arc::clone(&profile.bindings), &mut self.synth)
        {
            debug!("{} dropped extras of {} on reload", self.device, owner);
        }
        self.extras = None;
        self.actions.reload(Arc::clone(&profile.actions), &profile.bindings);
        self.wheel.set_config(profile.wheel.clone());
        self.profile = profile;
    }

    pub fn process(&mut self, report: &DeviceReport, now: Instant) -> TickResult {
        let shaped = self.shaper.shape(report);
        self.input.refresh(&shaped);
        self.check_untrigger();

        let remap = self.remapper.remap(&self.input, &mut self.synth, now);
        let mut output = remap.output;
        match remap.extras_event {
            Some(ExtrasEvent::Activated { owner, extras }) => {
                debug!("{} extras now owned by {}", self.device, owner);
                self.extras = Some(extras);
            }
            Some(ExtrasEvent::Deactivated { owner }) => {
                debug!("{} extras released by {}", self.device, owner);
                self.extras = None;
            }
            None => {}
        }

        let ctx = ActionInput {
            input: &self.input,
            battery: report.battery,
            calibrating: self.wheel.is_calibrating(),
        };
        let outcome = self.actions.process(ctx, &mut output, &mut self.synth, now);

        if let Some(command) = outcome.wheel_command {
            self.wheel.command(command);
        }
        let wheel = self.wheel.update(&report.motion, now);

        let mut mapped = output.to_mapped(&shaped);
        mapped.wheel = wheel.output;

        self.committer.commit(&mut self.synth, now);

        if let Some(switch) = outcome.profile_switch {
            self.enter_temp_profile(switch);
        }

        let lightbar = wheel
            .lightbar
            .or(outcome.lightbar)
            .or_else(|| self.extras.and_then(|e| e.lightbar));
        let rumble = match self.extras {
            Some(extras) if extras.rumble != RumbleState::default() => extras.rumble,
            _ => self.routed_rumble,
        };

        TickResult {
            mapped,
            feedback: DeviceFeedback::with_lightbar(lightbar, rumble),
        }
    }

    fn enter_temp_profile(&mut self, switch: ProfileSwitch) {
        let profile = match self.profiles.load_profile(&switch.name) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("{} cannot switch to profile '{}': {}", self.device, switch.name, e);
                return;
            }
        };

        let restore = match self.temp.take() {
            Some(previous) => previous.restore,
            None => self.profile.name.clone(),
        };
        info!(
            "{} switching to temporary profile '{}', restoring '{}' later",
            self.device, switch.name, restore
        );
        self.apply_profile(profile);
        self.remapper.suppress(&switch.triggers);
        self.temp = Some(TempProfile {
            restore,
            triggers: switch.triggers,
            untriggers: switch.untriggers,
            auto_untrigger: switch.auto_untrigger,
        });
    }

    fn check_untrigger(&mut self) {
        let Some(temp) = &self.temp else {
            return;
        };
        let release = if temp.auto_untrigger {
            temp.triggers.iter().any(|c| !self.input.is_active(*c))
        } else {
            !temp.untriggers.is_empty() && temp.untriggers.iter().all(|c| self.input.is_active(*c))
        };
        if !release {
            return;
        }

        let Some(temp) = self.temp.take() else {
            return;
        };
        match self.profiles.load_profile(&temp.restore) {
            Ok(profile) => {
                info!("{} restoring profile '{}'", self.device, temp.restore);
                self.apply_profile(profile);
                self.remapper.suppress(&temp.untriggers);
            }
            Err(e) => {
                error!("{} failed to restore profile '{}': {}", self.device, temp.restore, e);
            }
        }
    }

    /// Releases everything this device holds at the OS level
    pub fn release_all(&mut self, now: Instant) {
        self.remapper
            .reload(Arc::new(BindingTable::default()), &mut self.synth);
        self.actions.reset();
        self.synth.discard_current();
        self.committer.commit(&mut self.synth, now);
    }
}

impl std::fmt::Debug for DeviceMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMapper")
            .field("device", &self.device)
            .field("profile", &self.profile.name)
            .field("temporary", &self.temp.is_some())
            .finish_non_exhaustive()
    }
}

/// Commands accepted by a running device engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    ReloadProfile(String),
    Shutdown,
}

/// States for device engine lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum DeviceEngineState {
    Initializing, // Channels wired, no profile yet
    Configured,   // Mapper built from the initial profile
    Active,       // Processing reports on the engine thread
    Deactivating, // Releasing held output
    Deactivated,  // Fully stopped
}

#[machine]
pub struct DeviceEngine<S: DeviceEngineState> {
    device: DeviceIndex,
    name: String,
    report_rx: mpsc::Receiver<DeviceReport>,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
    output_tx: mpsc::Sender<MappedState>,
    feedback_tx: watch::Sender<DeviceFeedback>,
    rumble_rx: watch::Receiver<RumbleState>,
    mapper: Option<DeviceMapper>,
    cancel: CancellationToken,
}

impl<S: DeviceEngineState> DeviceEngine<S> {
    pub fn get_name(&self) -> &str {
        &self.name
    }
}

impl DeviceEngine<Initializing> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        device: DeviceIndex,
        report_rx: mpsc::Receiver<DeviceReport>,
        command_rx: mpsc::UnboundedReceiver<EngineCommand>,
        output_tx: mpsc::Sender<MappedState>,
        feedback_tx: watch::Sender<DeviceFeedback>,
        rumble_rx: watch::Receiver<RumbleState>,
        cancel: CancellationToken,
    ) -> Self {
        let name = format!("engine-{}", device);
        info!("Initializing device engine: {}", name);
        Self::new(
            device,
            name,
            report_rx,
            command_rx,
            output_tx,
            feedback_tx,
            rumble_rx,
            None, // mapper
            cancel,
        )
    }

    pub fn configure(mut self, profile: Profile, deps: &MapperDeps) -> DeviceEngine<Configured> {
        info!("Configuring {} with profile '{}'", self.name, profile.name);
        self.mapper = Some(DeviceMapper::new(self.device, profile, deps));
        self.transition()
    }
}

impl DeviceEngine<Configured> {
    pub fn activate(self) -> DeviceEngine<Active> {
        info!("Activating device engine: {}", self.name);
        self.transition()
    }
}

impl DeviceEngine<Active> {
    fn handle_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                EngineCommand::ReloadProfile(name) => {
                    let Some(mapper) = self.mapper.as_mut() else {
                        continue;
                    };
                    if let Err(e) = mapper.reload_named(&name) {
                        warn!("{} failed to reload profile '{}': {}", self.name, name, e);
                    }
                }
                EngineCommand::Shutdown => {
                    info!("Shutdown command received for: {}", self.name);
                    self.cancel.cancel();
                }
            }
        }
    }

    /// Processes reports until cancelled or the report channel closes
    pub fn run_until_shutdown(mut self) -> Result<DeviceEngine<Deactivating>, MappingError> {
        info!("Starting report loop for: {}", self.name);

        loop {
            self.handle_commands();
            if self.cancel.is_cancelled() {
                info!("Cancellation observed by: {}", self.name);
                break;
            }

            let Some(report) = self.report_rx.blocking_recv() else {
                info!("Report channel closed for: {}", self.name);
                break;
            };
            if report.device != self.device {
                warn!("{} ignoring report for {}", self.name, report.device);
                continue;
            }

            let Some(mapper) = self.mapper.as_mut() else {
                return Err(MappingError::InvalidStateTransition(format!(
                    "{} active without a mapper",
                    self.name
                )));
            };

            if self.rumble_rx.has_changed().unwrap_or(false) {
                mapper.set_routed_rumble(*self.rumble_rx.borrow_and_update());
            }

            let tick = mapper.process(&report, report.received_at);

            self.feedback_tx.send_if_modified(|current| {
                if *current != tick.feedback {
                    *current = tick.feedback;
                    true
                } else {
                    false
                }
            });

            if let Err(e) = self.output_tx.try_send(tick.mapped) {
                debug!("{} dropping mapped state: {}", self.name, e);
            }
        }

        info!("Transitioning to Deactivating state: {}", self.name);
        Ok(self.transition())
    }
}

impl DeviceEngine<Deactivating> {
    /// Releases every key and button the device still holds
    pub fn shutdown(mut self) -> DeviceEngine<Deactivated> {
        info!("Shutting down device engine: {}", self.name);
        if let Some(mapper) = self.mapper.as_mut() {
            mapper.release_all(Instant::now());
        }
        self.feedback_tx.send_replace(DeviceFeedback::default());
        info!("Engine shut down successfully: {}", self.name);
        self.transition()
    }
}

/// Handle for a device engine running on its own thread
#[derive(Debug)]
pub struct DeviceEngineHandle {
    pub device: DeviceIndex,
    pub name: String,
    report_tx: Option<mpsc::Sender<DeviceReport>>,
    command_tx: mpsc::UnboundedSender<EngineCommand>,
    feedback_rx: watch::Receiver<DeviceFeedback>,
    rumble_tx: watch::Sender<RumbleState>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<Result<(), MappingError>>>,
}

impl DeviceEngineHandle {
    /// Builds, configures and activates an engine, then starts its thread
    pub fn spawn(
        device: DeviceIndex,
        profile: Profile,
        deps: &MapperDeps,
        output_tx: mpsc::Sender<MappedState>,
    ) -> Result<Self, MappingError> {
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = watch::channel(DeviceFeedback::default());
        let (rumble_tx, rumble_rx) = watch::channel(RumbleState::default());
        let cancel = CancellationToken::new();

        let engine = DeviceEngine::create(
            device,
            report_rx,
            command_rx,
            output_tx,
            feedback_tx,
            rumble_rx,
            cancel.clone(),
        )
        .configure(profile, deps)
        .activate();
        let name = engine.get_name().to_string();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!("Spawning running engine: {}", thread_name);
                match engine.run_until_shutdown() {
                    Ok(deactivating) => {
                        deactivating.shutdown();
                        Ok(())
                    }
                    Err(e) => {
                        error!("Error running engine: {} - {}", thread_name, e);
                        Err(e)
                    }
                }
            })
            .map_err(|e| MappingError::ThreadError(format!("Failed to spawn {}: {}", name, e)))?;

        info!("Device engine activated: {}", name);
        Ok(Self {
            device,
            name,
            report_tx: Some(report_tx),
            command_tx,
            feedback_rx,
            rumble_tx,
            cancel,
            thread: Some(thread),
        })
    }

    /// Queues a report without blocking; a full queue drops the report
    pub fn try_send_report(&self, report: DeviceReport) -> Result<(), MappingError> {
        let Some(tx) = &self.report_tx else {
            return Err(MappingError::ChannelError(format!("{} is shut down", self.name)));
        };
        match tx.try_send(report) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("{} report queue full, dropping report", self.name);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MappingError::ChannelError(format!(
                "{} report channel closed",
                self.name
            ))),
        }
    }

    pub fn reload_profile(&self, name: &str) -> Result<(), MappingError> {
        self.command_tx
            .send(EngineCommand::ReloadProfile(name.to_string()))
            .map_err(|e| MappingError::ChannelError(format!("Failed to send reload: {}", e)))
    }

    pub fn feedback(&self) -> DeviceFeedback {
        *self.feedback_rx.borrow()
    }

    pub fn subscribe_feedback(&self) -> watch::Receiver<DeviceFeedback> {
        self.feedback_rx.clone()
    }

    /// Routes rumble from the virtual output device into the engine
    pub fn route_rumble(&self, rumble: RumbleState) {
        self.rumble_tx.send_replace(rumble);
    }

    /// Stops the engine thread and waits for it to release its output
    pub async fn shutdown(&mut self) -> Result<(), MappingError> {
        debug!("Sending shutdown signal to engine: {}", self.name);
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        self.cancel.cancel();
        // closing the channel wakes a thread blocked on the next report
        self.report_tx = None;

        let Some(thread) = self.thread.take() else {
            debug!("Engine already shut down: {}", self.name);
            return Ok(());
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(result)) => {
                debug!("Engine thread completed: {}", self.name);
                result
            }
            Ok(Err(_)) => {
                error!("Engine thread panicked: {}", self.name);
                Err(MappingError::ThreadError(format!("Engine thread panicked: {}", self.name)))
            }
            Err(e) => Err(MappingError::ThreadError(format!(
                "Failed to join {}: {}",
                self.name, e
            ))),
        }
    }
}
