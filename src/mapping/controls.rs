//! Logical control enumeration and the dense per-control field arrays
//!
//! The declaration order of [`Control`] is load-bearing: the remapper walks
//! controls in this order and later controls win ties on a shared destination.

use crate::controller::report::{MappedState, AXIS_CENTER};
use crate::mapping::axis_shaper::ShapedState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Distance from center beyond which a stick direction counts as pressed
const AXIS_ACTIVE_DISTANCE: u8 = 55;

/// Trigger value beyond which a trigger counts as pressed
const TRIGGER_ACTIVE_VALUE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Control {
    LXNeg,
    LXPos,
    LYNeg,
    LYPos,
    RXNeg,
    RXPos,
    RYNeg,
    RYPos,
    L1,
    L2,
    L3,
    R1,
    R2,
    R3,
    Square,
    Triangle,
    Circle,
    Cross,
    DpadUp,
    DpadRight,
    DpadDown,
    DpadLeft,
    PS,
    TouchLeft,
    TouchUpper,
    TouchMulti,
    TouchRight,
    Share,
    Options,
    Mute,
    GyroXPos,
    GyroXNeg,
    GyroZPos,
    GyroZNeg,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
}

/// Stick axis addressed by an axis-direction control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickAxis {
    LX,
    LY,
    RX,
    RY,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    AxisDir { axis: StickAxis, positive: bool },
    Trigger,
    Button,
    Touch,
    GyroDir,
    Swipe,
}

impl Control {
    pub const COUNT: usize = 38;

    pub const ALL: [Control; Control::COUNT] = [
        Control::LXNeg,
        Control::LXPos,
        Control::LYNeg,
        Control::LYPos,
        Control::RXNeg,
        Control::RXPos,
        Control::RYNeg,
        Control::RYPos,
        Control::L1,
        Control::L2,
        Control::L3,
        Control::R1,
        Control::R2,
        Control::R3,
        Control::Square,
        Control::Triangle,
        Control::Circle,
        Control::Cross,
        Control::DpadUp,
        Control::DpadRight,
        Control::DpadDown,
        Control::DpadLeft,
        Control::PS,
        Control::TouchLeft,
        Control::TouchUpper,
        Control::TouchMulti,
        Control::TouchRight,
        Control::Share,
        Control::Options,
        Control::Mute,
        Control::GyroXPos,
        Control::GyroXNeg,
        Control::GyroZPos,
        Control::GyroZNeg,
        Control::SwipeLeft,
        Control::SwipeRight,
        Control::SwipeUp,
        Control::SwipeDown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn kind(self) -> ControlKind {
        use Control::*;
        match self {
            LXNeg => ControlKind::AxisDir { axis: StickAxis::LX, positive: false },
            LXPos => ControlKind::AxisDir { axis: StickAxis::LX, positive: true },
            LYNeg => ControlKind::AxisDir { axis: StickAxis::LY, positive: false },
            LYPos => ControlKind::AxisDir { axis: StickAxis::LY, positive: true },
            RXNeg => ControlKind::AxisDir { axis: StickAxis::RX, positive: false },
            RXPos => ControlKind::AxisDir { axis: StickAxis::RX, positive: true },
            RYNeg => ControlKind::AxisDir { axis: StickAxis::RY, positive: false },
            RYPos => ControlKind::AxisDir { axis: StickAxis::RY, positive: true },
            L2 | R2 => ControlKind::Trigger,
            TouchLeft | TouchUpper | TouchMulti | TouchRight => ControlKind::Touch,
            GyroXPos | GyroXNeg | GyroZPos | GyroZNeg => ControlKind::GyroDir,
            SwipeLeft | SwipeRight | SwipeUp | SwipeDown => ControlKind::Swipe,
            _ => ControlKind::Button,
        }
    }

    /// True for controls whose state is a boolean rather than a magnitude
    pub fn is_digital(self) -> bool {
        matches!(self.kind(), ControlKind::Button | ControlKind::Touch)
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Magnitude 0-255 of an axis-direction slot holding a half-restricted axis byte
fn axis_slot_magnitude(value: u8, positive: bool) -> u8 {
    if positive {
        let delta = value.saturating_sub(AXIS_CENTER) as u32;
        (delta * 255 / 127).min(255) as u8
    } else {
        let delta = AXIS_CENTER.saturating_sub(value) as u32;
        (delta * 255 / 128).min(255) as u8
    }
}

/// Inverse of [`axis_slot_magnitude`]
fn axis_slot_value(magnitude: u8, positive: bool) -> u8 {
    let m = magnitude as f64 / 255.0;
    if positive {
        (AXIS_CENTER as f64 + (m * 127.0).round()) as u8
    } else {
        (AXIS_CENTER as f64 - (m * 128.0).round()).max(0.0) as u8
    }
}

/// Dense per-control state for one tick
///
/// Axis directions store the axis byte restricted to their half (the negative
/// slot never exceeds 128, the positive slot is never below it). Triggers, gyro
/// directions and swipes store a 0-255 magnitude. Buttons and touch regions are
/// booleans.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    analog: [u8; Control::COUNT],
    digital: [bool; Control::COUNT],
    macro_override: [bool; Control::COUNT],
}

impl Default for FieldMapping {
    fn default() -> Self {
        let mut analog = [0u8; Control::COUNT];
        for control in Control::ALL {
            if let ControlKind::AxisDir { .. } = control.kind() {
                analog[control.index()] = AXIS_CENTER;
            }
        }
        Self {
            analog,
            digital: [false; Control::COUNT],
            macro_override: [false; Control::COUNT],
        }
    }
}

impl FieldMapping {
    pub fn from_shaped(shaped: &ShapedState) -> Self {
        let mut mapping = Self::default();
        mapping.refresh(shaped);
        mapping
    }

    /// Repopulates every field from the shaped state, keeping macro-override latches
    pub fn refresh(&mut self, shaped: &ShapedState) {
        let report = &shaped.report;
        let buttons = &report.buttons;
        let touch = &report.touch;

        self.set_axis(StickAxis::LX, report.lx);
        self.set_axis(StickAxis::LY, report.ly);
        self.set_axis(StickAxis::RX, report.rx);
        self.set_axis(StickAxis::RY, report.ry);

        self.analog[Control::L2.index()] = report.l2;
        self.analog[Control::R2.index()] = report.r2;

        self.analog[Control::GyroXPos.index()] = shaped.gyro_x.clamp(0, 255) as u8;
        self.analog[Control::GyroXNeg.index()] = (-shaped.gyro_x).clamp(0, 255) as u8;
        self.analog[Control::GyroZPos.index()] = shaped.gyro_z.clamp(0, 255) as u8;
        self.analog[Control::GyroZNeg.index()] = (-shaped.gyro_z).clamp(0, 255) as u8;

        self.analog[Control::SwipeLeft.index()] = touch.swipe_left;
        self.analog[Control::SwipeRight.index()] = touch.swipe_right;
        self.analog[Control::SwipeUp.index()] = touch.swipe_up;
        self.analog[Control::SwipeDown.index()] = touch.swipe_down;

        let digital = [
            (Control::L1, buttons.l1),
            (Control::L3, buttons.l3),
            (Control::R1, buttons.r1),
            (Control::R3, buttons.r3),
            (Control::Square, buttons.square),
            (Control::Triangle, buttons.triangle),
            (Control::Circle, buttons.circle),
            (Control::Cross, buttons.cross),
            (Control::DpadUp, buttons.dpad.up),
            (Control::DpadRight, buttons.dpad.right),
            (Control::DpadDown, buttons.dpad.down),
            (Control::DpadLeft, buttons.dpad.left),
            (Control::PS, buttons.ps),
            (Control::TouchLeft, touch.left),
            (Control::TouchUpper, touch.upper),
            (Control::TouchMulti, touch.multi),
            (Control::TouchRight, touch.right),
            (Control::Share, buttons.share),
            (Control::Options, buttons.options),
            (Control::Mute, buttons.mute),
        ];
        for (control, pressed) in digital {
            self.digital[control.index()] = pressed;
        }
    }

    fn set_axis(&mut self, axis: StickAxis, value: u8) {
        let (neg, pos) = axis_controls(axis);
        self.analog[neg.index()] = value.min(AXIS_CENTER);
        self.analog[pos.index()] = value.max(AXIS_CENTER);
    }

    /// Reconstructs a full axis byte from its two direction slots
    pub fn axis_value(&self, axis: StickAxis) -> u8 {
        let (neg, pos) = axis_controls(axis);
        let neg_mag = self.magnitude(neg);
        let pos_mag = self.magnitude(pos);
        if neg_mag == 0 && pos_mag == 0 {
            AXIS_CENTER
        } else if neg_mag > pos_mag {
            self.analog[neg.index()]
        } else {
            self.analog[pos.index()]
        }
    }

    /// Normalized 0-255 magnitude of any control; digital controls map to 0 or 255
    pub fn magnitude(&self, control: Control) -> u8 {
        match control.kind() {
            ControlKind::AxisDir { positive, .. } => {
                axis_slot_magnitude(self.analog[control.index()], positive)
            }
            ControlKind::Button | ControlKind::Touch => {
                if self.digital[control.index()] {
                    255
                } else {
                    0
                }
            }
            _ => self.analog[control.index()],
        }
    }

    pub fn is_active(&self, control: Control) -> bool {
        match control.kind() {
            ControlKind::AxisDir { positive, .. } => {
                let value = self.analog[control.index()];
                if positive {
                    value > AXIS_CENTER + AXIS_ACTIVE_DISTANCE
                } else {
                    value < AXIS_CENTER - AXIS_ACTIVE_DISTANCE
                }
            }
            ControlKind::Trigger => self.analog[control.index()] > TRIGGER_ACTIVE_VALUE,
            ControlKind::Button | ControlKind::Touch => self.digital[control.index()],
            ControlKind::GyroDir | ControlKind::Swipe => self.analog[control.index()] > 0,
        }
    }

    /// Resets a control to its neutral value
    pub fn clear(&mut self, control: Control) {
        match control.kind() {
            ControlKind::AxisDir { .. } => self.analog[control.index()] = AXIS_CENTER,
            ControlKind::Button | ControlKind::Touch => self.digital[control.index()] = false,
            _ => self.analog[control.index()] = 0,
        }
    }

    pub fn set_magnitude(&mut self, control: Control, magnitude: u8) {
        match control.kind() {
            ControlKind::AxisDir { positive, .. } => {
                self.analog[control.index()] = axis_slot_value(magnitude, positive)
            }
            ControlKind::Button | ControlKind::Touch => {
                self.digital[control.index()] = magnitude > 0
            }
            _ => self.analog[control.index()] = magnitude,
        }
    }

    pub fn press(&mut self, control: Control) {
        self.set_magnitude(control, 255);
    }

    pub fn macro_override(&self, control: Control) -> bool {
        self.macro_override[control.index()]
    }

    pub fn set_macro_override(&mut self, control: Control, latched: bool) {
        self.macro_override[control.index()] = latched;
    }

    /// Builds the virtual controller state from this (output) mapping
    pub fn to_mapped(&self, shaped: &ShapedState) -> MappedState {
        let report = &shaped.report;
        let mut buttons = report.buttons;
        let d = |control: Control| self.digital[control.index()];
        buttons.l1 = d(Control::L1);
        buttons.l3 = d(Control::L3);
        buttons.r1 = d(Control::R1);
        buttons.r3 = d(Control::R3);
        buttons.square = d(Control::Square);
        buttons.triangle = d(Control::Triangle);
        buttons.circle = d(Control::Circle);
        buttons.cross = d(Control::Cross);
        buttons.dpad.up = d(Control::DpadUp);
        buttons.dpad.right = d(Control::DpadRight);
        buttons.dpad.down = d(Control::DpadDown);
        buttons.dpad.left = d(Control::DpadLeft);
        buttons.ps = d(Control::PS);
        buttons.share = d(Control::Share);
        buttons.options = d(Control::Options);
        buttons.mute = d(Control::Mute);

        let mut touch = report.touch;
        touch.left = d(Control::TouchLeft);
        touch.upper = d(Control::TouchUpper);
        touch.multi = d(Control::TouchMulti);
        touch.right = d(Control::TouchRight);
        touch.swipe_left = self.analog[Control::SwipeLeft.index()];
        touch.swipe_right = self.analog[Control::SwipeRight.index()];
        touch.swipe_up = self.analog[Control::SwipeUp.index()];
        touch.swipe_down = self.analog[Control::SwipeDown.index()];

        MappedState {
            device: report.device,
            buttons,
            lx: self.axis_value(StickAxis::LX),
            ly: self.axis_value(StickAxis::LY),
            rx: self.axis_value(StickAxis::RX),
            ry: self.axis_value(StickAxis::RY),
            l2: self.analog[Control::L2.index()],
            r2: self.analog[Control::R2.index()],
            motion: report.motion,
            touch,
            battery: report.battery,
            wheel: None,
        }
    }
}

fn axis_controls(axis: StickAxis) -> (Control, Control) {
    match axis {
        StickAxis::LX => (Control::LXNeg, Control::LXPos),
        StickAxis::LY => (Control::LYNeg, Control::LYPos),
        StickAxis::RX => (Control::RXNeg, Control::RXPos),
        StickAxis::RY => (Control::RYNeg, Control::RYPos),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_order_matches_index() {
        for (position, control) in Control::ALL.iter().enumerate() {
            assert_eq!(control.index(), position);
        }
    }

    #[test]
    fn axis_slots_split_and_reconstruct() {
        let mut mapping = FieldMapping::default();
        mapping.set_axis(StickAxis::LX, 20);
        assert_eq!(mapping.axis_value(StickAxis::LX), 20);
        assert!(mapping.is_active(Control::LXNeg));
        assert!(!mapping.is_active(Control::LXPos));

        mapping.clear(Control::LXNeg);
        assert_eq!(mapping.axis_value(StickAxis::LX), AXIS_CENTER);
    }

    #[test]
    fn full_deflection_has_full_magnitude() {
        let mut mapping = FieldMapping::default();
        mapping.set_axis(StickAxis::RY, 255);
        assert_eq!(mapping.magnitude(Control::RYPos), 255);
        mapping.set_axis(StickAxis::RY, 0);
        assert_eq!(mapping.magnitude(Control::RYNeg), 255);
    }

    #[test]
    fn magnitude_round_trips_through_axis_slot() {
        let mut mapping = FieldMapping::default();
        mapping.set_magnitude(Control::LYPos, 255);
        assert_eq!(mapping.axis_value(StickAxis::LY), 255);
        mapping.set_magnitude(Control::LYNeg, 255);
        mapping.clear(Control::LYPos);
        assert_eq!(mapping.axis_value(StickAxis::LY), 0);
    }
}
