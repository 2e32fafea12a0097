//! Lightbar and rumble values published to the output collaborators

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);
    pub const TEAL: Rgb = Rgb::new(0, 255, 255);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Linear blend, `ratio` 0.0 yields `self` and 1.0 yields `other`
    pub fn lerp(self, other: Rgb, ratio: f64) -> Rgb {
        let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * ratio).round() as u8;
        Rgb::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }
}

/// Override for the lightbar renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightbarOverride {
    pub color: Rgb,
    /// Flash rate, 0 disables flashing
    pub flash: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RumbleState {
    pub heavy: u8,
    pub light: u8,
}

/// Per-device feedback state, read by the lightbar and rumble collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeedback {
    pub forced_light: bool,
    pub forced_color: Rgb,
    pub forced_flash: u8,
    pub rumble: RumbleState,
}

impl DeviceFeedback {
    pub fn with_lightbar(lightbar: Option<LightbarOverride>, rumble: RumbleState) -> Self {
        match lightbar {
            Some(LightbarOverride { color, flash }) => Self {
                forced_light: true,
                forced_color: color,
                forced_flash: flash,
                rumble,
            },
            None => Self {
                rumble,
                ..Self::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_end_points() {
        let low = Rgb::new(255, 0, 0);
        let full = Rgb::new(0, 255, 0);
        assert_eq!(low.lerp(full, 0.0), low);
        assert_eq!(low.lerp(full, 1.0), full);
        assert_eq!(low.lerp(full, 0.5), Rgb::new(128, 128, 0));
    }
}
