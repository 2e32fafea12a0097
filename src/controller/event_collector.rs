use crate::controller::report::{
    ButtonState, DeviceIndex, DeviceReport, DpadState, AXIS_CENTER, MAX_DEVICES,
};
use crate::mapping::ManagerCommand;
use chrono::Local;
use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs, PowerInfo};
use statum::{machine, state};
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Collector settings
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub poll_interval: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(4),
        }
    }
}

// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to initialize collector: {0}")]
    InitializationError(String),

    #[error("Failed to send report: {0}")]
    ReportSendError(String),

    #[error("No free device slot: {0}")]
    NoFreeSlot(String),

    #[error("Failed to spawn collector thread: {0}")]
    ThreadError(String),
}

/// Maps gilrs gamepad ids to the fixed device slots of the mapping core
#[derive(Debug, Default)]
struct SlotTable {
    slots: HashMap<GamepadId, DeviceIndex>,
}

impl SlotTable {
    fn slot_of(&self, id: GamepadId) -> Option<DeviceIndex> {
        self.slots.get(&id).copied()
    }

    /// Assigns the lowest free slot, or the slot the gamepad already holds
    fn assign(&mut self, id: GamepadId) -> Result<DeviceIndex, CollectorError> {
        if let Some(slot) = self.slot_of(id) {
            return Ok(slot);
        }
        let free = (0..MAX_DEVICES)
            .filter_map(DeviceIndex::new)
            .find(|slot| !self.slots.values().any(|taken| taken == slot))
            .ok_or_else(|| {
                CollectorError::NoFreeSlot(format!("{} devices already connected", MAX_DEVICES))
            })?;
        self.slots.insert(id, free);
        Ok(free)
    }

    fn release(&mut self, id: GamepadId) -> Option<DeviceIndex> {
        self.slots.remove(&id)
    }

    fn assigned(&self) -> Vec<(GamepadId, DeviceIndex)> {
        let mut assigned: Vec<_> = self.slots.iter().map(|(id, slot)| (*id, *slot)).collect();
        assigned.sort_by_key(|(_, slot)| *slot);
        assigned
    }
}

// Define collector states using statum's state macro
#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
#[derive(Debug)]
pub struct EventCollector<S: CollectionState> {
    // Gilrs context
    gilrs: Gilrs,

    // Gamepad to device slot assignment
    slots: SlotTable,

    settings: CollectorSettings,

    // Channel for sending snapshots to the mapping manager
    report_sender: mpsc::Sender<DeviceReport>,

    // Channel for disconnect notifications
    command_sender: mpsc::Sender<ManagerCommand>,

    cancel: CancellationToken,
}

impl<S: CollectionState> EventCollector<S> {
    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }
}

// Implementation for Initializing state
impl EventCollector<Initializing> {
    pub fn create(
        settings: Option<CollectorSettings>,
        report_sender: mpsc::Sender<DeviceReport>,
        command_sender: mpsc::Sender<ManagerCommand>,
        cancel: CancellationToken,
    ) -> Result<Self, CollectorError> {
        let settings = settings.unwrap_or_default();
        debug!("Creating Event Collector with settings: {:?}", settings);

        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(CollectorError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(
            gilrs,
            SlotTable::default(),
            settings,
            report_sender,
            command_sender,
            cancel,
        ))
    }

    // Assign slots to every gamepad already connected and start collecting
    pub fn initialize(mut self) -> EventCollector<Collecting> {
        let gamepads: Vec<(GamepadId, String)> = self
            .gilrs
            .gamepads()
            .map(|(id, gamepad)| (id, gamepad.name().to_string()))
            .collect();

        if gamepads.is_empty() {
            warn!("No gamepad connected, waiting for connections");
        }
        for (id, name) in gamepads {
            match self.slots.assign(id) {
                Ok(slot) => info!("Gamepad '{}' ({}) assigned to {}", name, id, slot),
                Err(e) => warn!("Ignoring gamepad '{}': {}", name, e),
            }
        }

        info!("Event Collector initialized, transitioning to Collecting state");
        self.transition()
    }
}

impl EventCollector<Collecting> {
    // Drains pending gilrs events, tracking connects and disconnects
    fn pump_events(&mut self) {
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Connected => match self.slots.assign(id) {
                    Ok(slot) => info!("Controller {} connected as {}", id, slot),
                    Err(e) => warn!("Controller {} connected but ignored: {}", id, e),
                },
                EventType::Disconnected => {
                    if let Some(slot) = self.slots.release(id) {
                        warn!("Controller {} on {} disconnected", id, slot);
                        if let Err(e) = self.command_sender.try_send(ManagerCommand::Release(slot)) {
                            error!("Failed to notify disconnect of {}: {}", slot, e);
                        }
                    }
                }
                other => debug!("Gilrs event from {}: {:?}", id, other),
            }
        }
    }

    /// Sends one snapshot per connected device
    pub fn collect_reports(&mut self) -> Result<usize, CollectorError> {
        self.pump_events();
        let now = Instant::now();
        let mut sent = 0;

        for (id, slot) in self.slots.assigned() {
            let Some(gamepad) = self.gilrs.connected_gamepad(id) else {
                continue;
            };
            let report = snapshot(slot, &gamepad, now);
            match self.report_sender.try_send(report) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Report queue full, dropping snapshot for {}", slot);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(CollectorError::ReportSendError(format!(
                        "report channel closed while sending {}",
                        slot
                    )));
                }
            }
        }
        Ok(sent)
    }

    /// Polls until cancelled or the report channel closes
    pub fn run_collection_loop(&mut self) -> Result<(), CollectorError> {
        info!("Starting Event Collector loop");

        let mut report_count = 0usize;
        let mut last_log_time = Local::now();
        let log_interval = chrono::Duration::seconds(10);

        while !self.cancel.is_cancelled() {
            report_count += self.collect_reports()?;

            let now = Local::now();
            if now - last_log_time > log_interval {
                debug!(
                    "Event Collector stats: sent {} reports in last {} seconds (avg {:.2}/sec)",
                    report_count,
                    log_interval.num_seconds(),
                    report_count as f64 / log_interval.num_seconds() as f64
                );
                report_count = 0;
                last_log_time = now;
            }

            std::thread::sleep(self.settings.poll_interval);
        }

        info!("Event Collector loop cancelled");
        Ok(())
    }
}

// Public interface for spawning and stopping the collector
#[derive(Debug)]
pub struct CollectorHandle {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Starts the collector on its own thread; gilrs is created on that thread
    pub fn spawn(
        settings: Option<CollectorSettings>,
        report_sender: mpsc::Sender<DeviceReport>,
        command_sender: mpsc::Sender<ManagerCommand>,
    ) -> Result<Self, CollectorError> {
        info!("Spawning Event Collector with settings: {:?}", settings);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("event-collector".to_string())
            .spawn(move || {
                let collector =
                    match EventCollector::create(settings, report_sender, command_sender, token) {
                        Ok(collector) => collector,
                        Err(e) => {
                            error!("Failed to create Event Collector: {}", e);
                            return;
                        }
                    };
                let mut collecting = collector.initialize();
                if let Err(e) = collecting.run_collection_loop() {
                    error!("Collector thread terminated with error: {}", e);
                }
            })
            .map_err(|e| CollectorError::ThreadError(e.to_string()))?;

        info!("Event Collector successfully started");
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Event Collector thread panicked");
            }
        }
    }
}

fn snapshot(device: DeviceIndex, gamepad: &Gamepad<'_>, now: Instant) -> DeviceReport {
    let pressed = |button: Button| gamepad.is_pressed(button);
    let trigger = |button: Button| {
        gamepad
            .button_data(button)
            .map(|data| trigger_to_byte(data.value()))
            .unwrap_or(0)
    };

    let mut report = DeviceReport::neutral(device, now);
    report.buttons = ButtonState {
        cross: pressed(Button::South),
        circle: pressed(Button::East),
        square: pressed(Button::West),
        triangle: pressed(Button::North),
        l1: pressed(Button::LeftTrigger),
        r1: pressed(Button::RightTrigger),
        l3: pressed(Button::LeftThumb),
        r3: pressed(Button::RightThumb),
        share: pressed(Button::Select),
        options: pressed(Button::Start),
        ps: pressed(Button::Mode),
        mute: false,
        dpad: DpadState {
            up: pressed(Button::DPadUp),
            right: pressed(Button::DPadRight),
            down: pressed(Button::DPadDown),
            left: pressed(Button::DPadLeft),
        },
    };
    report.lx = axis_to_byte(gamepad.value(Axis::LeftStickX), false);
    report.ly = axis_to_byte(gamepad.value(Axis::LeftStickY), true);
    report.rx = axis_to_byte(gamepad.value(Axis::RightStickX), false);
    report.ry = axis_to_byte(gamepad.value(Axis::RightStickY), true);
    report.l2 = trigger(Button::LeftTrigger2);
    report.r2 = trigger(Button::RightTrigger2);
    report.battery = battery_percent(gamepad.power_info());
    report
}

// gilrs reports sticks in -1.0..=1.0 with up positive; reports use 0-255, down positive
fn axis_to_byte(value: f32, invert: bool) -> u8 {
    if !value.is_finite() {
        return AXIS_CENTER;
    }
    let value = if invert { -value } else { value };
    let scaled = (value.clamp(-1.0, 1.0) + 1.0) * 127.5;
    scaled.round().clamp(0.0, 255.0) as u8
}

fn trigger_to_byte(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn battery_percent(power: PowerInfo) -> u8 {
    match power {
        PowerInfo::Discharging(level) | PowerInfo::Charging(level) => level.min(100),
        PowerInfo::Charged | PowerInfo::Wired | PowerInfo::Unknown => 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_bytes_cover_full_range() {
        assert_eq!(axis_to_byte(-1.0, false), 0);
        assert_eq!(axis_to_byte(1.0, false), 255);
        assert_eq!(axis_to_byte(0.0, false), 128);
        assert_eq!(axis_to_byte(1.0, true), 0);
        assert_eq!(axis_to_byte(f32::NAN, false), AXIS_CENTER);
        assert_eq!(axis_to_byte(3.0, false), 255);
    }

    #[test]
    fn trigger_bytes_are_clamped() {
        assert_eq!(trigger_to_byte(0.0), 0);
        assert_eq!(trigger_to_byte(1.0), 255);
        assert_eq!(trigger_to_byte(-0.5), 0);
        assert_eq!(trigger_to_byte(f32::INFINITY), 0);
    }

    #[test]
    fn battery_levels() {
        assert_eq!(battery_percent(PowerInfo::Discharging(40)), 40);
        assert_eq!(battery_percent(PowerInfo::Charging(120)), 100);
        assert_eq!(battery_percent(PowerInfo::Wired), 100);
    }
}
