//! Runtime binding table
//!
//! Bindings are decided once at profile load into a closed set of effects; the
//! per-tick path never re-inspects raw profile payloads.

use crate::mapping::controls::Control;
use crate::mapping::feedback::{LightbarOverride, Rgb, RumbleState};
use crate::mapping::synthetic::{KeyCode, MouseChannel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Macro values at or above this are waits of `value - MACRO_WAIT_BASE` ms
pub const MACRO_WAIT_BASE: i32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyModifiers {
    pub scan_code: bool,
    pub toggle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroStep {
    KeyDown(KeyCode),
    KeyUp(KeyCode),
    MouseDown(MouseChannel),
    MouseUp(MouseChannel),
    Wait(Duration),
}

/// Parses a macro from its integer form
///
/// Key and mouse codes alternate between press and release on each occurrence;
/// anything still held at the end gets a trailing release. Returns None for
/// codes outside the known ranges.
pub fn parse_macro(codes: &[i32]) -> Option<Vec<MacroStep>> {
    let mut steps = Vec::with_capacity(codes.len());
    let mut held_keys: Vec<KeyCode> = Vec::new();
    let mut held_mouse: Vec<MouseChannel> = Vec::new();

    for &code in codes {
        match code {
            c if c >= MACRO_WAIT_BASE => {
                steps.push(MacroStep::Wait(Duration::from_millis((c - MACRO_WAIT_BASE) as u64)))
            }
            256..=260 => {
                let channel = match code {
                    256 => MouseChannel::Left,
                    257 => MouseChannel::Right,
                    258 => MouseChannel::Middle,
                    259 => MouseChannel::Fourth,
                    _ => MouseChannel::Fifth,
                };
                if let Some(pos) = held_mouse.iter().position(|c| *c == channel) {
                    held_mouse.remove(pos);
                    steps.push(MacroStep::MouseUp(channel));
                } else {
                    held_mouse.push(channel);
                    steps.push(MacroStep::MouseDown(channel));
                }
            }
            1..=255 => {
                let key = KeyCode(code as u16);
                if let Some(pos) = held_keys.iter().position(|k| *k == key) {
                    held_keys.remove(pos);
                    steps.push(MacroStep::KeyUp(key));
                } else {
                    held_keys.push(key);
                    steps.push(MacroStep::KeyDown(key));
                }
            }
            _ => return None,
        }
    }

    steps.extend(held_keys.into_iter().rev().map(MacroStep::KeyUp));
    steps.extend(held_mouse.into_iter().rev().map(MacroStep::MouseUp));
    Some(steps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapTarget {
    Control(Control),
    Mouse(MouseChannel),
    MouseMove(MouseDirection),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BindingEffect {
    #[default]
    Unbound,
    Key {
        code: KeyCode,
        modifiers: KeyModifiers,
    },
    Macro {
        steps: Arc<[MacroStep]>,
        /// Restart from the top while the control stays held
        repeat: bool,
        scan_code: bool,
    },
    Remap(RemapTarget),
}

/// Side effects attached to a binding while it is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extras {
    pub rumble: RumbleState,
    pub lightbar: Option<LightbarOverride>,
    pub mouse_sensitivity: Option<u8>,
}

impl Extras {
    /// Parses `heavy,light,ledEnabled,r,g,b,flashRate,mouseSensEnabled,mouseSens`
    ///
    /// Malformed payloads are logged and treated as absent. An all-neutral
    /// payload also yields None.
    pub fn parse(payload: &str) -> Option<Self> {
        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        if fields.len() != 9 {
            debug!("Ignoring extras '{}': expected 9 fields, got {}", payload, fields.len());
            return None;
        }

        let mut values = [0u8; 9];
        for (slot, field) in values.iter_mut().zip(fields.iter()) {
            match field.parse::<u8>() {
                Ok(v) => *slot = v,
                Err(e) => {
                    debug!("Ignoring extras '{}': field '{}' invalid: {}", payload, field, e);
                    return None;
                }
            }
        }

        let [heavy, light, led_enabled, r, g, b, flash, sens_enabled, sens] = values;
        let extras = Self {
            rumble: RumbleState { heavy, light },
            lightbar: (led_enabled != 0).then_some(LightbarOverride {
                color: Rgb::new(r, g, b),
                flash,
            }),
            mouse_sensitivity: (sens_enabled != 0).then_some(sens),
        };

        if extras.rumble == RumbleState::default()
            && extras.lightbar.is_none()
            && extras.mouse_sensitivity.is_none()
        {
            None
        } else {
            Some(extras)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindingLayer {
    pub effect: BindingEffect,
    pub extras: Option<Extras>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlBinding {
    pub normal: BindingLayer,
    pub shift: BindingLayer,
    /// Control that activates the shift layer while held
    pub shift_trigger: Option<Control>,
}

/// One binding per logical control, indexed by enumeration order
#[derive(Debug, Clone, PartialEq)]
pub struct BindingTable {
    bindings: Vec<ControlBinding>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self {
            bindings: vec![ControlBinding::default(); Control::COUNT],
        }
    }
}

impl BindingTable {
    pub fn get(&self, control: Control) -> &ControlBinding {
        &self.bindings[control.index()]
    }

    pub fn set(&mut self, control: Control, binding: ControlBinding) {
        self.bindings[control.index()] = binding;
    }

    /// True when neither layer of the control does anything
    pub fn is_unbound(&self, control: Control) -> bool {
        let binding = self.get(control);
        binding.normal.effect == BindingEffect::Unbound
            && (binding.shift_trigger.is_none() || binding.shift.effect == BindingEffect::Unbound)
    }

    /// Every key code bound with the toggle modifier, in either layer
    pub fn toggle_keys(&self) -> Vec<KeyCode> {
        self.bindings
            .iter()
            .flat_map(|b| [&b.normal.effect, &b.shift.effect])
            .filter_map(|effect| match effect {
                BindingEffect::Key { code, modifiers } if modifiers.toggle => Some(*code),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_codes_alternate_press_and_release() {
        let steps = parse_macro(&[65, 350, 65, 256, 256]).unwrap();
        assert_eq!(
            steps,
            vec![
                MacroStep::KeyDown(KeyCode(65)),
                MacroStep::Wait(Duration::from_millis(50)),
                MacroStep::KeyUp(KeyCode(65)),
                MacroStep::MouseDown(MouseChannel::Left),
                MacroStep::MouseUp(MouseChannel::Left),
            ]
        );
    }

    #[test]
    fn unreleased_keys_get_trailing_release() {
        let steps = parse_macro(&[0x5B, 0x47]).unwrap();
        assert_eq!(
            &steps[2..],
            &[MacroStep::KeyUp(KeyCode(0x47)), MacroStep::KeyUp(KeyCode(0x5B))]
        );
    }

    #[test]
    fn out_of_range_macro_code_is_rejected() {
        assert!(parse_macro(&[65, -4]).is_none());
        assert!(parse_macro(&[280]).is_none());
    }

    #[test]
    fn extras_parse() {
        let extras = Extras::parse("200,0,1,255,0,0,10,1,50").unwrap();
        assert_eq!(extras.rumble.heavy, 200);
        assert_eq!(
            extras.lightbar,
            Some(LightbarOverride { color: Rgb::new(255, 0, 0), flash: 10 })
        );
        assert_eq!(extras.mouse_sensitivity, Some(50));
    }

    #[test]
    fn malformed_or_neutral_extras_are_absent() {
        assert!(Extras::parse("1,2,3").is_none());
        assert!(Extras::parse("a,0,0,0,0,0,0,0,0").is_none());
        assert!(Extras::parse("0,0,0,0,0,0,0,0,0").is_none());
    }
}
