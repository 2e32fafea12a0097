//! Per-tick report model shared between the report source and the mapping core
//!
//! A [`DeviceReport`] is the raw snapshot a transport produces for one tick. The
//! mapping core never mutates it; it produces a [`MappedState`] of the same shape
//! for the virtual output collaborator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Center value of every stick axis byte
pub const AXIS_CENTER: u8 = 128;

/// Maximum number of devices handled at the same time
pub const MAX_DEVICES: usize = 4;

/// Raw gyro units per degree/second reported by DS4-class motion sensors
pub const GYRO_RAW_PER_DEG_PER_SEC: f64 = 16.0;

/// Slot index of a connected controller (0..=3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIndex(u8);

impl DeviceIndex {
    pub fn new(index: usize) -> Option<Self> {
        if index < MAX_DEVICES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DpadState {
    pub up: bool,
    pub right: bool,
    pub down: bool,
    pub left: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonState {
    pub cross: bool,
    pub circle: bool,
    pub square: bool,
    pub triangle: bool,
    pub l1: bool,
    pub r1: bool,
    pub l3: bool,
    pub r3: bool,
    pub share: bool,
    pub options: bool,
    pub ps: bool,
    pub mute: bool,
    pub dpad: DpadState,
}

/// Accelerometer and gyro readings in raw sensor units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionReport {
    pub accel_x: i32,
    pub accel_y: i32,
    pub accel_z: i32,
    pub gyro_yaw: i32,
    pub gyro_pitch: i32,
    pub gyro_roll: i32,
}

impl MotionReport {
    /// Largest angular velocity across the three gyro axes in degrees/second
    pub fn max_angular_velocity(&self) -> f64 {
        [self.gyro_yaw, self.gyro_pitch, self.gyro_roll]
            .iter()
            .map(|raw| (*raw as f64).abs() / GYRO_RAW_PER_DEG_PER_SEC)
            .fold(0.0, f64::max)
    }
}

/// Touchpad state as classified by the transport
///
/// Region flags tell which part of the pad is pressed together with the touch
/// button. Swipe fields carry a 0-255 magnitude for the current gesture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchState {
    pub touch_button: bool,
    pub left: bool,
    pub upper: bool,
    pub multi: bool,
    pub right: bool,
    pub swipe_left: u8,
    pub swipe_right: u8,
    pub swipe_up: u8,
    pub swipe_down: u8,
}

/// Raw per-tick snapshot of one controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceReport {
    pub device: DeviceIndex,
    pub received_at: Instant,
    pub buttons: ButtonState,
    pub lx: u8,
    pub ly: u8,
    pub rx: u8,
    pub ry: u8,
    pub l2: u8,
    pub r2: u8,
    pub motion: MotionReport,
    pub touch: TouchState,
    /// Battery charge 0-100
    pub battery: u8,
}

impl DeviceReport {
    /// Report with every control released and sticks centered
    pub fn neutral(device: DeviceIndex, received_at: Instant) -> Self {
        Self {
            device,
            received_at,
            buttons: ButtonState::default(),
            lx: AXIS_CENTER,
            ly: AXIS_CENTER,
            rx: AXIS_CENTER,
            ry: AXIS_CENTER,
            l2: 0,
            r2: 0,
            motion: MotionReport::default(),
            touch: TouchState::default(),
            battery: 100,
        }
    }
}

/// Steering value produced by the wheel emulation, in the channel's native range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelOutput {
    /// Signed 16-bit stick axis
    Xinput(i16),
    /// DS4-style 0-255 stick byte
    Ds4Stick(u8),
    /// Shared trigger pair, negative values steer on L2
    TriggerPair(i16),
    /// 0-32767 auxiliary axis
    Aux(u16),
}

/// Remapped virtual controller state for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedState {
    pub device: DeviceIndex,
    pub buttons: ButtonState,
    pub lx: u8,
    pub ly: u8,
    pub rx: u8,
    pub ry: u8,
    pub l2: u8,
    pub r2: u8,
    pub motion: MotionReport,
    pub touch: TouchState,
    pub battery: u8,
    pub wheel: Option<WheelOutput>,
}
