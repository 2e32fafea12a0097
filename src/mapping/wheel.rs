//! Steering wheel emulation from controller tilt
//!
//! The accelerometer sample `(accel_x, accel_z)` traces an arc while the
//! controller is turned like a wheel. Three persisted anchors (center, right
//! 90°, left 90°) define one circle per turn direction; the live angle is the
//! angle at the circle center between the center anchor and the sample.
//!
//! # Recalibration
//!
//! ```text
//! Normal ──Begin──► Activating ──► Running ──Complete──► Completing ──► Normal
//!                                     │
//!                                     └────Cancel──────► Cancelling ──► Normal
//! ```

use crate::controller::report::{DeviceIndex, MotionReport, WheelOutput};
use crate::mapping::error::MappingError;
use crate::mapping::feedback::{LightbarOverride, Rgb};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Gyro rate below which the controller counts as resting, in degrees/second
pub const STILL_VELOCITY: f64 = 0.5;
/// Continuous rest needed before an anchor is captured
pub const STILL_DURATION: Duration = Duration::from_secs(1);
/// Minimum distance between the center anchor and a turn anchor
pub const MIN_ANCHOR_DISTANCE: f64 = 50.0;
/// Samples this close to the center anchor read as angle 0
const CENTER_TOLERANCE: f64 = 1.0;
/// Live angle distance (0.1°) from an uncaptured target that triggers a flash
const TARGET_FLASH_DISTANCE: i32 = 10;
const CALIBRATION_FLASH_RATE: u8 = 40;

const MAX_ANGLE: i32 = 1800;
const FULL_TURN: i32 = 3600;

const DEFAULT_RIGHT_OFFSET: Point = Point { x: 127, y: 110 };
const DEFAULT_LEFT_OFFSET: Point = Point { x: -113, y: 110 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecalibrateState {
    #[default]
    Normal,
    Activating,
    Running,
    Completing,
    Cancelling,
}

/// Recalibration request from the special-action engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelCommand {
    Begin,
    Complete,
    Cancel,
}

/// Target channel of the wheel angle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelChannel {
    /// Signed 16-bit stick axis
    #[default]
    Xinput,
    /// 0-255 DS4 stick axis
    Ds4Stick,
    /// Shared ±255 trigger pair
    TriggerPair,
    /// 0-32767 auxiliary axis
    Aux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    pub enabled: bool,
    pub channel: WheelChannel,
    /// Total steering range in degrees
    pub range_deg: u16,
    /// Deadzone around straight ahead, in 0.1° units
    pub dead_zone: u16,
    /// Output floor in percent of the channel's half range
    pub anti_dead_zone: u8,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: WheelChannel::Xinput,
            range_deg: 360,
            dead_zone: 0,
            anti_dead_zone: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn offset(self, by: Point) -> Point {
        Point::new(self.x.saturating_add(by.x), self.y.saturating_add(by.y))
    }

    fn distance(self, other: Point) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        dx.hypot(dy)
    }
}

/// Persisted calibration record of one device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelAnchors {
    pub center: Point,
    pub right: Point,
    pub left: Point,
    pub captured_at: DateTime<Utc>,
}

impl WheelAnchors {
    /// Estimated anchors around a single resting sample
    pub fn estimated(center: Point) -> Self {
        Self {
            center,
            right: center.offset(DEFAULT_RIGHT_OFFSET),
            left: center.offset(DEFAULT_LEFT_OFFSET),
            captured_at: Utc::now(),
        }
    }
}

/// Storage collaborator for wheel calibrations
pub trait CalibrationStore: Send + Sync {
    fn load_calibration(&self, device: DeviceIndex) -> Option<WheelAnchors>;
    fn save_calibration(&self, device: DeviceIndex, anchors: WheelAnchors) -> Result<(), MappingError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec2 {
    x: f64,
    y: f64,
}

impl Vec2 {
    fn from_point(p: Point) -> Self {
        Self {
            x: p.x as f64,
            y: p.y as f64,
        }
    }

    fn sub(self, o: Vec2) -> Vec2 {
        Vec2 {
            x: self.x - o.x,
            y: self.y - o.y,
        }
    }

    fn dot(self, o: Vec2) -> f64 {
        self.x * o.x + self.y * o.y
    }

    fn len(self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Circle center where the chord `center → anchor` subtends a right angle
///
/// `ccw` selects the perpendicular side: counter-clockwise for the right arm,
/// clockwise for the left arm.
fn arc_center(center: Vec2, anchor: Vec2, ccw: bool) -> Vec2 {
    let chord = anchor.sub(center);
    let mid = Vec2 {
        x: (center.x + anchor.x) / 2.0,
        y: (center.y + anchor.y) / 2.0,
    };
    // perpendicular of the same length, scaled to half the chord
    let perp = if ccw {
        Vec2 { x: -chord.y, y: chord.x }
    } else {
        Vec2 { x: chord.y, y: -chord.x }
    };
    Vec2 {
        x: mid.x + perp.x / 2.0,
        y: mid.y + perp.y / 2.0,
    }
}

/// Derived turn-arc geometry of a set of anchors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelGeometry {
    center: Vec2,
    right_center: Vec2,
    left_center: Vec2,
    /// right anchor minus left anchor, decides the side of a sample
    axis: Vec2,
}

impl WheelGeometry {
    pub fn from_anchors(anchors: &WheelAnchors) -> Self {
        let center = Vec2::from_point(anchors.center);
        let right = Vec2::from_point(anchors.right);
        let left = Vec2::from_point(anchors.left);
        Self {
            center,
            right_center: arc_center(center, right, true),
            left_center: arc_center(center, left, false),
            axis: right.sub(left),
        }
    }

    /// Physical wheel angle in 0.1° units, positive to the right
    pub fn angle(&self, sample: Point) -> i32 {
        let sample = Vec2::from_point(sample);
        let offset = sample.sub(self.center);
        if offset.len() <= CENTER_TOLERANCE {
            return 0;
        }

        let right = offset.dot(self.axis) >= 0.0;
        let origin = if right { self.right_center } else { self.left_center };
        let ab = self.center.sub(origin);
        let cd = sample.sub(origin);
        let denominator = ab.len() * cd.len();
        if denominator <= f64::EPSILON || !denominator.is_finite() {
            return 0;
        }

        let cos = (ab.dot(cd) / denominator).clamp(-1.0, 1.0);
        let angle = ((cos.acos().to_degrees() * 10.0).round() as i32).clamp(0, MAX_ANGLE);
        if right {
            angle
        } else {
            -angle
        }
    }
}

/// Unwraps the physical angle across full turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnTracker {
    prev_physical: i32,
    prev_full: i32,
    turn_count: i32,
}

impl TurnTracker {
    pub fn turn_count(&self) -> i32 {
        self.turn_count
    }

    /// Feeds one physical angle, returns the unwrapped angle
    ///
    /// Only with `multi_turn` are turns counted. A jump of more than half a
    /// turn between consecutive physical angles is a wraparound. An unwrapped
    /// angle more than half a turn from the previous one is noise and the
    /// previous value holds.
    pub fn update(&mut self, physical: i32, multi_turn: bool) -> i32 {
        if !multi_turn {
            self.prev_physical = physical;
            self.prev_full = physical;
            self.turn_count = 0;
            return physical;
        }

        let delta = physical - self.prev_physical;
        if delta > MAX_ANGLE {
            self.turn_count -= 1;
        } else if delta < -MAX_ANGLE {
            self.turn_count += 1;
        }
        self.prev_physical = physical;

        let full = physical + self.turn_count * FULL_TURN;
        if (full - self.prev_full).abs() > MAX_ANGLE {
            debug!("Rejecting wheel angle jump {} -> {}", self.prev_full, full);
            return self.prev_full;
        }

        self.prev_full = full;
        full
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Applies the deadzone, range clamp and anti-deadzone, then maps to the channel
pub fn map_to_channel(angle: i32, config: &WheelConfig) -> WheelOutput {
    let half_range = (config.range_deg as f64 * 10.0 / 2.0).max(1.0);
    let dead_zone = (config.dead_zone as f64).min(half_range - 1.0).max(0.0);

    let magnitude = (angle as f64).abs();
    let rescaled = if magnitude <= dead_zone {
        0.0
    } else {
        (magnitude - dead_zone) * half_range / (half_range - dead_zone)
    };
    let mut ratio = (rescaled / half_range).min(1.0) * (angle as f64).signum();

    if ratio != 0.0 {
        let floor = config.anti_dead_zone.min(100) as f64 / 100.0;
        ratio = ratio.signum() * (floor + (1.0 - floor) * ratio.abs());
    }

    match config.channel {
        WheelChannel::Xinput => WheelOutput::Xinput((ratio * 32767.0).round() as i16),
        WheelChannel::Ds4Stick => {
            let value = if ratio < 0.0 {
                128.0 + ratio * 128.0
            } else {
                128.0 + ratio * 127.0
            };
            WheelOutput::Ds4Stick(value.round().clamp(0.0, 255.0) as u8)
        }
        WheelChannel::TriggerPair => WheelOutput::TriggerPair((ratio * 255.0).round() as i16),
        WheelChannel::Aux => {
            WheelOutput::Aux(((ratio + 1.0) / 2.0 * 32767.0).round().clamp(0.0, 32767.0) as u16)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Center = 0,
    Right = 1,
    Left = 2,
}

#[derive(Debug, Clone, Default)]
struct CalibrationSession {
    captured: [Option<Point>; 3],
    still_since: Option<Instant>,
}

impl CalibrationSession {
    fn count(&self) -> usize {
        self.captured.iter().filter(|p| p.is_some()).count()
    }

    fn get(&self, anchor: Anchor) -> Option<Point> {
        self.captured[anchor as usize]
    }

    fn anchors(&self) -> Option<WheelAnchors> {
        Some(WheelAnchors {
            center: self.get(Anchor::Center)?,
            right: self.get(Anchor::Right)?,
            left: self.get(Anchor::Left)?,
            captured_at: Utc::now(),
        })
    }
}

/// Wheel output and calibration feedback of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WheelTick {
    pub output: Option<WheelOutput>,
    pub lightbar: Option<LightbarOverride>,
}

/// Per-device wheel emulation, survives profile reloads
pub struct WheelEmulation {
    device: DeviceIndex,
    config: WheelConfig,
    anchors: Option<WheelAnchors>,
    geometry: Option<WheelGeometry>,
    state: RecalibrateState,
    session: CalibrationSession,
    turns: TurnTracker,
    warned_defaults: bool,
    store: Arc<dyn CalibrationStore>,
}

impl WheelEmulation {
    pub fn new(device: DeviceIndex, config: WheelConfig, store: Arc<dyn CalibrationStore>) -> Self {
        let anchors = store.load_calibration(device);
        match &anchors {
            Some(a) => info!("Loaded wheel calibration for {} captured {}", device, a.captured_at),
            None => debug!("No stored wheel calibration for {}", device),
        }
        Self {
            device,
            config,
            geometry: anchors.as_ref().map(WheelGeometry::from_anchors),
            anchors,
            state: RecalibrateState::Normal,
            session: CalibrationSession::default(),
            turns: TurnTracker::default(),
            warned_defaults: false,
            store,
        }
    }

    pub fn state(&self) -> RecalibrateState {
        self.state
    }

    pub fn is_calibrating(&self) -> bool {
        self.state != RecalibrateState::Normal
    }

    pub fn anchors(&self) -> Option<&WheelAnchors> {
        self.anchors.as_ref()
    }

    /// Swaps the profile-level settings, keeping the calibration
    pub fn set_config(&mut self, config: WheelConfig) {
        self.config = config;
        self.turns.reset();
    }

    pub fn command(&mut self, command: WheelCommand) {
        let next = match (self.state, command) {
            (RecalibrateState::Normal, WheelCommand::Begin) => RecalibrateState::Activating,
            (RecalibrateState::Activating | RecalibrateState::Running, WheelCommand::Complete) => {
                RecalibrateState::Completing
            }
            (RecalibrateState::Activating | RecalibrateState::Running, WheelCommand::Cancel) => {
                RecalibrateState::Cancelling
            }
            (state, command) => {
                debug!("Ignoring wheel command {:?} in state {:?}", command, state);
                return;
            }
        };
        info!("Wheel calibration {} {:?} -> {:?}", self.device, self.state, next);
        self.state = next;
    }

    pub fn update(&mut self, motion: &MotionReport, now: Instant) -> WheelTick {
        let sample = Point::new(motion.accel_x, motion.accel_z);

        match self.state {
            RecalibrateState::Normal => {}
            RecalibrateState::Activating => {
                self.session = CalibrationSession::default();
                self.state = RecalibrateState::Running;
                return self.calibration_tick(sample, motion, now);
            }
            RecalibrateState::Running => return self.calibration_tick(sample, motion, now),
            RecalibrateState::Completing => {
                self.finish_calibration();
                return self.zero_tick();
            }
            RecalibrateState::Cancelling => {
                info!("Wheel calibration cancelled for {}", self.device);
                self.session = CalibrationSession::default();
                self.state = RecalibrateState::Normal;
                return self.zero_tick();
            }
        }

        if !self.config.enabled {
            return WheelTick::default();
        }

        let geometry = self.geometry_or_defaults(sample);
        let physical = geometry.angle(sample);
        let angle = self.turns.update(physical, self.config.range_deg > 360);
        WheelTick {
            output: Some(map_to_channel(angle, &self.config)),
            lightbar: None,
        }
    }

    fn geometry_or_defaults(&mut self, sample: Point) -> WheelGeometry {
        if let Some(geometry) = self.geometry {
            return geometry;
        }
        if !self.warned_defaults {
            warn!(
                "Wheel for {} was never calibrated, estimating anchors around {:?}",
                self.device, sample
            );
            self.warned_defaults = true;
        }
        let anchors = WheelAnchors::estimated(sample);
        let geometry = WheelGeometry::from_anchors(&anchors);
        self.anchors = Some(anchors);
        self.geometry = Some(geometry);
        geometry
    }

    fn zero_tick(&self) -> WheelTick {
        WheelTick {
            output: self.config.enabled.then(|| map_to_channel(0, &self.config)),
            lightbar: None,
        }
    }

    fn calibration_tick(&mut self, sample: Point, motion: &MotionReport, now: Instant) -> WheelTick {
        if motion.max_angular_velocity() < STILL_VELOCITY {
            let since = *self.session.still_since.get_or_insert(now);
            if now.saturating_duration_since(since) > STILL_DURATION {
                self.try_capture(sample);
                self.session.still_since = Some(now);
            }
        } else {
            self.session.still_since = None;
        }

        let color = match self.session.count() {
            0 => Rgb::RED,
            1 => Rgb::YELLOW,
            2 => Rgb::TEAL,
            _ => Rgb::GREEN,
        };
        let flash = if self.near_uncaptured_target(sample) {
            CALIBRATION_FLASH_RATE
        } else {
            0
        };

        WheelTick {
            output: self.config.enabled.then(|| map_to_channel(0, &self.config)),
            lightbar: Some(LightbarOverride { color, flash }),
        }
    }

    fn try_capture(&mut self, sample: Point) {
        let Some(center) = self.session.get(Anchor::Center) else {
            debug!("Captured wheel center {:?} for {}", sample, self.device);
            self.session.captured[Anchor::Center as usize] = Some(sample);
            return;
        };

        if sample.distance(center) < MIN_ANCHOR_DISTANCE {
            return;
        }
        let anchor = if sample.x >= center.x {
            Anchor::Right
        } else {
            Anchor::Left
        };
        if self.session.get(anchor).is_none() {
            debug!("Captured wheel anchor {:?} at {:?} for {}", anchor, sample, self.device);
            self.session.captured[anchor as usize] = Some(sample);
        }
    }

    /// True when the live angle is within 1° of an anchor still to be captured
    fn near_uncaptured_target(&self, sample: Point) -> bool {
        let Some(geometry) = self.geometry else {
            return false;
        };
        let angle = geometry.angle(sample);
        [(Anchor::Center, 0), (Anchor::Right, 900), (Anchor::Left, -900)]
            .iter()
            .any(|(anchor, target)| {
                self.session.get(*anchor).is_none() && (angle - target).abs() <= TARGET_FLASH_DISTANCE
            })
    }

    fn finish_calibration(&mut self) {
        self.state = RecalibrateState::Normal;
        let Some(anchors) = self.session.anchors() else {
            warn!(
                "Wheel calibration for {} incomplete ({} of 3 anchors), keeping previous",
                self.device,
                self.session.count()
            );
            self.session = CalibrationSession::default();
            return;
        };

        info!("Wheel calibration complete for {}: {:?}", self.device, anchors);
        if let Err(e) = self.store.save_calibration(self.device, anchors) {
            warn!("Failed to persist wheel calibration for {}: {}", self.device, e);
        }
        self.geometry = Some(WheelGeometry::from_anchors(&anchors));
        self.anchors = Some(anchors);
        self.warned_defaults = false;
        self.turns.reset();
        self.session = CalibrationSession::default();
    }
}

impl std::fmt::Debug for WheelEmulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelEmulation")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("anchors", &self.anchors)
            .finish_non_exhaustive()
    }
}

/// Store for devices that never persist a calibration
#[derive(Debug, Default)]
pub struct NoCalibrationStore;

impl CalibrationStore for NoCalibrationStore {
    fn load_calibration(&self, _device: DeviceIndex) -> Option<WheelAnchors> {
        None
    }

    fn save_calibration(&self, _device: DeviceIndex, _anchors: WheelAnchors) -> Result<(), MappingError> {
        Ok(())
    }
}
