//! Per-axis shaping of sticks, triggers and gyro tilt
//!
//! Stick pipeline, in order: rotation, legacy diagonal curve, radial
//! deadzone/anti-deadzone/max-zone, sensitivity, square-stick, output curve.
//! Triggers and gyro tilt run the one-dimensional equivalent. Every degenerate
//! configuration resolves to a centered (or zero) output.

use crate::controller::report::{DeviceReport, MotionReport, AXIS_CENTER};
use crate::mapping::curve::{OutputCurve, ShapingCurve};
use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StickConfig {
    /// Rotation applied to the raw stick position, in degrees
    pub rotation: f64,
    /// Legacy diagonal curve, 0 (off) to 10
    pub legacy_curve: u8,
    /// Deadzone radius in raw axis units (0-127)
    pub dead_zone: u8,
    /// Anti-deadzone floor in percent
    pub anti_dead_zone: u8,
    /// Max-zone ceiling in percent
    pub max_zone: u8,
    pub sensitivity: f64,
    pub square_stick: bool,
    /// Roundness exponent for the square-stick mapping (2 = circle)
    pub square_roundness: f64,
    pub curve: OutputCurve,
}

impl Default for StickConfig {
    fn default() -> Self {
        Self {
            rotation: 0.0,
            legacy_curve: 0,
            dead_zone: 10,
            anti_dead_zone: 20,
            max_zone: 100,
            sensitivity: 1.0,
            square_stick: false,
            square_roundness: 5.0,
            curve: OutputCurve::Linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Deadzone in raw trigger units (0-255)
    pub dead_zone: u8,
    pub anti_dead_zone: u8,
    pub max_zone: u8,
    pub sensitivity: f64,
    pub curve: OutputCurve,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            dead_zone: 0,
            anti_dead_zone: 0,
            max_zone: 100,
            sensitivity: 1.0,
            curve: OutputCurve::Linear,
        }
    }
}

/// Accelerometer tilt exposed as the gyro direction controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroAxisConfig {
    pub enabled: bool,
    /// Deadzone in raw accelerometer units
    pub dead_zone: i32,
    /// Raw accelerometer value mapped to full deflection
    pub max_value: i32,
    pub sensitivity: f64,
    pub curve: OutputCurve,
}

impl Default for GyroAxisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dead_zone: 512,
            max_value: 8192,
            sensitivity: 1.0,
            curve: OutputCurve::Linear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub left_stick: StickConfig,
    pub right_stick: StickConfig,
    pub l2: TriggerConfig,
    pub r2: TriggerConfig,
    pub gyro: GyroAxisConfig,
}

/// A device report after shaping
///
/// Carries the shaped report plus the signed gyro tilt magnitudes (-255..=255)
/// feeding the gyro direction controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapedState {
    pub report: DeviceReport,
    pub gyro_x: i16,
    pub gyro_z: i16,
}

#[derive(Debug, Clone)]
struct StickShaper {
    config: StickConfig,
    curve: ShapingCurve,
}

impl StickShaper {
    fn new(config: &StickConfig) -> Self {
        Self {
            curve: ShapingCurve::resolve(&config.curve),
            config: config.clone(),
        }
    }

    fn shape(&self, x: u8, y: u8) -> (u8, u8) {
        let mut dx = x as f64 - AXIS_CENTER as f64;
        let mut dy = y as f64 - AXIS_CENTER as f64;

        if self.config.rotation != 0.0 && self.config.rotation.is_finite() {
            let (sin, cos) = self.config.rotation.to_radians().sin_cos();
            let rx = dx * cos - dy * sin;
            let ry = dx * sin + dy * cos;
            dx = rx.clamp(-128.0, 127.0);
            dy = ry.clamp(-128.0, 127.0);
        }

        if self.config.legacy_curve > 0 {
            (dx, dy) = legacy_diagonal_curve(dx, dy, self.config.legacy_curve);
        }

        let Some((mut nx, mut ny)) = self.apply_zones(dx, dy) else {
            return (AXIS_CENTER, AXIS_CENTER);
        };

        let sensitivity = sanitize_sensitivity(self.config.sensitivity);
        nx = (nx * sensitivity).clamp(-1.0, 1.0);
        ny = (ny * sensitivity).clamp(-1.0, 1.0);

        if self.config.square_stick {
            (nx, ny) = square_stick(nx, ny, self.config.square_roundness);
        }

        (
            signed_to_byte(self.curve.apply(nx)),
            signed_to_byte(self.curve.apply(ny)),
        )
    }

    /// Radial zones split per axis by the stick angle; None means centered
    fn apply_zones(&self, dx: f64, dy: f64) -> Option<(f64, f64)> {
        let max_zone = self.config.max_zone.min(100) as f64 / 100.0;
        if max_zone <= 0.0 {
            return None;
        }

        let dead_zone = self.config.dead_zone.min(127) as f64;
        let radius = dx.hypot(dy);
        if radius == 0.0 || radius <= dead_zone {
            return None;
        }

        let angle = dy.atan2(dx);
        let cos = angle.cos().abs();
        let sin = angle.sin().abs();
        let anti_dead = self.config.anti_dead_zone.min(100) as f64 / 100.0;

        let axis = |value: f64, weight: f64| -> f64 {
            let max_value = if value >= 0.0 { 127.0 } else { 128.0 };
            let dead = weight * (dead_zone / 127.0) * max_value;
            let zone = max_zone * max_value;
            let span = zone - dead;
            if span <= 0.0 {
                return 0.0;
            }
            let mut out = ((value.abs().min(zone) - dead) / span).clamp(0.0, 1.0);
            let floor = anti_dead * weight;
            if floor > 0.0 && out > 0.0 {
                out = (1.0 - floor) * out + floor;
            }
            out * value.signum()
        };

        Some((axis(dx, cos), axis(dy, sin)))
    }
}

/// Boosts diagonal deflection in proportion to how close the stick is to 45°
fn legacy_diagonal_curve(dx: f64, dy: f64, curve: u8) -> (f64, f64) {
    let strength = curve.min(10) as f64 / 10.0;
    let major = dx.abs().max(dy.abs());
    if major <= 0.0 {
        return (dx, dy);
    }
    let bias = dx.abs().min(dy.abs()) / major;
    let boost = 1.0 + strength * bias * (SQRT_2 - 1.0);
    (
        (dx * boost).clamp(-128.0, 127.0),
        (dy * boost).clamp(-128.0, 127.0),
    )
}

/// Stretches the circular gate towards a square using a superellipse factor
fn square_stick(x: f64, y: f64, roundness: f64) -> (f64, f64) {
    let radius = x.hypot(y);
    if radius == 0.0 {
        return (x, y);
    }
    let p = if roundness.is_finite() { roundness.max(1.0) } else { 2.0 };
    let angle = y.atan2(x);
    let c = angle.cos().abs();
    let s = angle.sin().abs();
    let denom = (c.powf(p) + s.powf(p)).powf(1.0 / p);
    if denom <= 0.0 || !denom.is_finite() {
        return (x, y);
    }
    let scale = 1.0 / denom;
    ((x * scale).clamp(-1.0, 1.0), (y * scale).clamp(-1.0, 1.0))
}

fn sanitize_sensitivity(sensitivity: f64) -> f64 {
    if sensitivity.is_finite() && sensitivity >= 0.0 {
        sensitivity
    } else {
        1.0
    }
}

/// Maps [-1, 1] onto an axis byte; negative values use the wider lower half
fn signed_to_byte(value: f64) -> u8 {
    let value = if value.is_finite() { value.clamp(-1.0, 1.0) } else { 0.0 };
    let scaled = if value >= 0.0 {
        AXIS_CENTER as f64 + (value * 127.0).round()
    } else {
        AXIS_CENTER as f64 + (value * 128.0).round()
    };
    scaled.clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone)]
struct TriggerShaper {
    config: TriggerConfig,
    curve: ShapingCurve,
}

impl TriggerShaper {
    fn new(config: &TriggerConfig) -> Self {
        Self {
            curve: ShapingCurve::resolve(&config.curve),
            config: config.clone(),
        }
    }

    fn shape(&self, value: u8) -> u8 {
        let max = self.config.max_zone.min(100) as f64 / 100.0 * 255.0;
        let dead = self.config.dead_zone as f64;
        let raw = value as f64;
        if max <= 0.0 || raw <= dead || max <= dead {
            return 0;
        }

        let mut out = ((raw.min(max) - dead) / (max - dead)).clamp(0.0, 1.0);
        let floor = self.config.anti_dead_zone.min(100) as f64 / 100.0;
        if floor > 0.0 && out > 0.0 {
            out = (1.0 - floor) * out + floor;
        }
        out = (out * sanitize_sensitivity(self.config.sensitivity)).clamp(0.0, 1.0);
        (self.curve.apply(out) * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

#[derive(Debug, Clone)]
struct GyroAxisShaper {
    config: GyroAxisConfig,
    curve: ShapingCurve,
}

impl GyroAxisShaper {
    fn new(config: &GyroAxisConfig) -> Self {
        Self {
            curve: ShapingCurve::resolve(&config.curve),
            config: config.clone(),
        }
    }

    fn shape_axis(&self, value: i32) -> i16 {
        let dead = self.config.dead_zone.max(0) as f64;
        let max = self.config.max_value as f64;
        let magnitude = (value as f64).abs();
        if magnitude <= dead || max <= dead {
            return 0;
        }
        let mut out = ((magnitude.min(max) - dead) / (max - dead)).clamp(0.0, 1.0);
        out = (out * sanitize_sensitivity(self.config.sensitivity)).clamp(0.0, 1.0);
        let shaped = (self.curve.apply(out) * 255.0).round() as i16;
        if value < 0 {
            -shaped
        } else {
            shaped
        }
    }

    fn shape(&self, motion: &MotionReport) -> (i16, i16) {
        if !self.config.enabled {
            return (0, 0);
        }
        (self.shape_axis(motion.accel_x), self.shape_axis(motion.accel_z))
    }
}

/// Applies the profile's axis configuration to raw reports
#[derive(Debug, Clone)]
pub struct AxisShaper {
    left: StickShaper,
    right: StickShaper,
    l2: TriggerShaper,
    r2: TriggerShaper,
    gyro: GyroAxisShaper,
}

impl AxisShaper {
    pub fn new(config: &AxisConfig) -> Self {
        Self {
            left: StickShaper::new(&config.left_stick),
            right: StickShaper::new(&config.right_stick),
            l2: TriggerShaper::new(&config.l2),
            r2: TriggerShaper::new(&config.r2),
            gyro: GyroAxisShaper::new(&config.gyro),
        }
    }

    pub fn shape(&self, report: &DeviceReport) -> ShapedState {
        let mut shaped = *report;
        (shaped.lx, shaped.ly) = self.left.shape(report.lx, report.ly);
        (shaped.rx, shaped.ry) = self.right.shape(report.rx, report.ry);
        shaped.l2 = self.l2.shape(report.l2);
        shaped.r2 = self.r2.shape(report.r2);
        let (gyro_x, gyro_z) = self.gyro.shape(&report.motion);

        ShapedState {
            report: shaped,
            gyro_x,
            gyro_z,
        }
    }
}

impl Default for AxisShaper {
    fn default() -> Self {
        Self::new(&AxisConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stick(config: StickConfig) -> StickShaper {
        StickShaper::new(&config)
    }

    fn plain_stick() -> StickConfig {
        StickConfig {
            dead_zone: 20,
            anti_dead_zone: 0,
            ..StickConfig::default()
        }
    }

    #[test]
    fn full_deflection_reaches_the_rails() {
        let shaper = stick(plain_stick());
        assert_eq!(shaper.shape(255, 128), (255, 128));
        assert_eq!(shaper.shape(0, 128), (0, 128));
        assert_eq!(shaper.shape(128, 0), (128, 0));
    }

    #[test]
    fn max_zone_saturates_to_curve_at_one() {
        let shaper = stick(StickConfig {
            max_zone: 70,
            curve: OutputCurve::EaseOutQuad,
            ..plain_stick()
        });
        let full = signed_to_byte(ShapingCurve::EaseOutQuad.apply(1.0));
        for x in [218u8, 230, 255] {
            assert_eq!(shaper.shape(x, 128).0, full, "x = {}", x);
        }
    }

    #[test]
    fn zero_max_zone_centers() {
        let shaper = stick(StickConfig {
            max_zone: 0,
            ..plain_stick()
        });
        assert_eq!(shaper.shape(255, 0), (128, 128));
    }

    #[test]
    fn deadzone_beyond_max_zone_centers() {
        let shaper = stick(StickConfig {
            dead_zone: 120,
            max_zone: 50,
            ..plain_stick()
        });
        assert_eq!(shaper.shape(255, 128), (128, 128));
    }

    #[test]
    fn anti_deadzone_lifts_first_step() {
        let shaper = stick(StickConfig {
            dead_zone: 10,
            anti_dead_zone: 40,
            ..StickConfig::default()
        });
        let (x, _) = shaper.shape(128 + 12, 128);
        assert!(x >= 128 + 50, "x = {}", x);
    }

    #[test]
    fn rotation_moves_x_into_y() {
        let shaper = stick(StickConfig {
            rotation: 90.0,
            ..plain_stick()
        });
        let (x, y) = shaper.shape(255, 128);
        assert_eq!(x, 128);
        assert_eq!(y, 255);
    }

    #[test]
    fn trigger_deadzone_and_max_zone() {
        let shaper = TriggerShaper::new(&TriggerConfig {
            dead_zone: 30,
            max_zone: 80,
            ..TriggerConfig::default()
        });
        assert_eq!(shaper.shape(30), 0);
        assert_eq!(shaper.shape(204), 255);
        assert_eq!(shaper.shape(255), 255);
        assert!(shaper.shape(100) > 0);
    }

    #[test]
    fn degenerate_trigger_is_zero() {
        let shaper = TriggerShaper::new(&TriggerConfig {
            dead_zone: 200,
            max_zone: 50,
            ..TriggerConfig::default()
        });
        assert_eq!(shaper.shape(255), 0);
    }

    #[test]
    fn gyro_axis_is_signed() {
        let shaper = GyroAxisShaper::new(&GyroAxisConfig {
            enabled: true,
            ..GyroAxisConfig::default()
        });
        let motion = MotionReport {
            accel_x: -8192,
            accel_z: 100,
            ..MotionReport::default()
        };
        assert_eq!(shaper.shape(&motion), (-255, 0));
    }

    #[test]
    fn square_stick_pushes_diagonal_outward() {
        let (x, y) = square_stick(0.7071, 0.7071, 5.0);
        assert!(x > 0.8 && y > 0.8);
        assert_eq!(square_stick(0.0, 0.0, 5.0), (0.0, 0.0));
    }

    proptest! {
        #[test]
        fn samples_inside_deadzone_are_centered(
            dead_zone in 1u8..=127,
            angle in 0.0f64..std::f64::consts::TAU,
            fraction in 0.0f64..=1.0,
            anti in 0u8..=100,
        ) {
            let shaper = stick(StickConfig {
                dead_zone,
                anti_dead_zone: anti,
                ..StickConfig::default()
            });
            let r = (dead_zone as f64 - 1.0).max(0.0) * fraction;
            let x = (128.0 + r * angle.cos()).round().clamp(0.0, 255.0);
            let y = (128.0 + r * angle.sin()).round().clamp(0.0, 255.0);
            prop_assume!((x - 128.0).hypot(y - 128.0) <= dead_zone as f64);
            prop_assert_eq!(shaper.shape(x as u8, y as u8), (128, 128));
        }

        #[test]
        fn quadratic_stick_output_is_monotonic(a in 128u8..=255, b in 128u8..=255) {
            let shaper = stick(StickConfig {
                curve: OutputCurve::Quadratic,
                ..plain_stick()
            });
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(shaper.shape(lo, 128).0 <= shaper.shape(hi, 128).0);
        }
    }
}
