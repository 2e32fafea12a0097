//! # Persistence Module
//!
//! Persisted profile and calibration model plus the portal that shares it.
//!
//! ## Key Abstractions
//! - **ProfileConfig**: the TOML form of a profile. It is resolved exactly once
//!   into the runtime [`Profile`]; malformed bindings and actions are dropped
//!   with a debug log so a bad entry never blocks the rest of a profile.
//! - **CalibrationBook**: wheel anchors per device slot.
//! - **ConfigPortal**: thread-safe access through the action/result pattern.
//! - **ConfigRepository**: file layout under the config root.
//!
//! ```text
//! <config dir>/padremap/
//! ├── config.toml
//! ├── calibrations.toml
//! └── profiles/
//!     ├── default.toml
//!     └── racing.toml
//! ```

pub mod config_portal;
pub mod repository;

use crate::controller::report::DeviceIndex;
use crate::mapping::binding::{
    parse_macro, BindingEffect, BindingLayer, BindingTable, ControlBinding, Extras, KeyModifiers,
    MacroStep, RemapTarget,
};
use crate::mapping::controls::Control;
use crate::mapping::feedback::Rgb;
use crate::mapping::special_action::{SpecialAction, SpecialActionKind};
use crate::mapping::synthetic::KeyCode;
use crate::mapping::wheel::WheelAnchors;
use crate::mapping::{AxisConfig, Profile, WheelConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Effect of one binding layer as written in a profile
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectConfig {
    Key {
        code: u16,
        #[serde(default)]
        scan_code: bool,
        #[serde(default)]
        toggle: bool,
    },
    Macro {
        codes: Vec<i32>,
        #[serde(default)]
        repeat: bool,
        #[serde(default)]
        scan_code: bool,
    },
    Remap {
        target: RemapTarget,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct LayerConfig {
    pub effect: Option<EffectConfig>,
    /// `heavy,light,ledEnabled,r,g,b,flashRate,mouseSensEnabled,mouseSens`
    pub extras: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BindingConfig {
    pub control: Control,
    #[serde(default)]
    pub normal: LayerConfig,
    #[serde(default)]
    pub shift: LayerConfig,
    pub shift_trigger: Option<Control>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKindConfig {
    Macro {
        codes: Vec<i32>,
        #[serde(default)]
        scan_code: bool,
    },
    Program {
        path: String,
        #[serde(default)]
        args: String,
    },
    Profile {
        name: String,
        #[serde(default)]
        auto_untrigger: bool,
    },
    Key {
        code: u16,
        #[serde(default)]
        scan_code: bool,
    },
    BatteryCheck {
        #[serde(default = "low_battery_color")]
        low: Rgb,
        #[serde(default = "full_battery_color")]
        full: Rgb,
    },
    WheelCalibrate,
    MultiAction {
        #[serde(default)]
        tap: Vec<i32>,
        #[serde(default)]
        hold: Vec<i32>,
        #[serde(default)]
        double_tap: Vec<i32>,
    },
    XboxGameDvr,
}

fn low_battery_color() -> Rgb {
    Rgb::RED
}

fn full_battery_color() -> Rgb {
    Rgb::GREEN
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SpecialActionConfig {
    pub name: String,
    pub triggers: Vec<Control>,
    #[serde(default)]
    pub untriggers: Vec<Control>,
    #[serde(default)]
    pub delay_ms: u64,
    pub kind: ActionKindConfig,
}

/// Persisted profile
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    pub name: String,
    pub axis: AxisConfig,
    pub wheel: WheelConfig,
    pub bindings: Vec<BindingConfig>,
    pub actions: Vec<SpecialActionConfig>,
}

impl ProfileConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Resolves the persisted form into the runtime profile
    pub fn resolve(&self) -> Profile {
        let mut table = BindingTable::default();
        for binding in &self.bindings {
            table.set(
                binding.control,
                ControlBinding {
                    normal: resolve_layer(binding.control, &binding.normal),
                    shift: resolve_layer(binding.control, &binding.shift),
                    shift_trigger: binding.shift_trigger,
                },
            );
        }

        let actions: Vec<SpecialAction> = self
            .actions
            .iter()
            .filter_map(|action| resolve_action(&self.name, action))
            .collect();

        debug!(
            "Resolved profile '{}': {} bindings, {} actions",
            self.name,
            self.bindings.len(),
            actions.len()
        );
        Profile {
            name: self.name.clone(),
            axis: self.axis.clone(),
            bindings: Arc::new(table),
            actions: Arc::from(actions),
            wheel: self.wheel.clone(),
        }
    }
}

fn resolve_layer(control: Control, layer: &LayerConfig) -> BindingLayer {
    let effect = match &layer.effect {
        None => BindingEffect::Unbound,
        Some(EffectConfig::Key { code: 0, .. }) => {
            debug!("{} bound to key code 0, treating as unbound", control);
            BindingEffect::Unbound
        }
        Some(EffectConfig::Key {
            code,
            scan_code,
            toggle,
        }) => BindingEffect::Key {
            code: KeyCode(*code),
            modifiers: KeyModifiers {
                scan_code: *scan_code,
                toggle: *toggle,
            },
        },
        Some(EffectConfig::Macro {
            codes,
            repeat,
            scan_code,
        }) => match resolve_macro(codes) {
            Some(steps) => BindingEffect::Macro {
                steps,
                repeat: *repeat,
                scan_code: *scan_code,
            },
            None => {
                debug!("{} has an invalid macro {:?}, treating as unbound", control, codes);
                BindingEffect::Unbound
            }
        },
        Some(EffectConfig::Remap {
            target: RemapTarget::Control(target),
        }) if *target == control => {
            debug!("{} remapped onto itself, treating as unbound", control);
            BindingEffect::Unbound
        }
        Some(EffectConfig::Remap { target }) => BindingEffect::Remap(*target),
    };

    BindingLayer {
        effect,
        extras: layer.extras.as_deref().and_then(Extras::parse),
    }
}

fn resolve_macro(codes: &[i32]) -> Option<Arc<[MacroStep]>> {
    if codes.is_empty() {
        return None;
    }
    parse_macro(codes).map(Arc::from)
}

fn resolve_action(profile: &str, action: &SpecialActionConfig) -> Option<SpecialAction> {
    if action.triggers.is_empty() {
        debug!("Action '{}' in '{}' has no triggers, skipping", action.name, profile);
        return None;
    }

    let invalid = |what: &str| {
        debug!("Action '{}' in '{}' has an invalid {}, skipping", action.name, profile, what);
    };

    let kind = match &action.kind {
        ActionKindConfig::Macro { codes, scan_code } => match resolve_macro(codes) {
            Some(steps) => SpecialActionKind::Macro {
                steps,
                scan_code: *scan_code,
            },
            None => {
                invalid("macro");
                return None;
            }
        },
        ActionKindConfig::Program { path, args } => {
            if path.trim().is_empty() {
                invalid("program path");
                return None;
            }
            SpecialActionKind::Program {
                path: path.clone(),
                args: args.clone(),
            }
        }
        ActionKindConfig::Profile {
            name,
            auto_untrigger,
        } => {
            if name.trim().is_empty() || name == profile {
                invalid("profile target");
                return None;
            }
            SpecialActionKind::Profile {
                name: name.clone(),
                auto_untrigger: *auto_untrigger,
            }
        }
        ActionKindConfig::Key { code, scan_code } => {
            if *code == 0 {
                invalid("key code");
                return None;
            }
            SpecialActionKind::Key {
                code: KeyCode(*code),
                modifiers: KeyModifiers {
                    scan_code: *scan_code,
                    toggle: false,
                },
            }
        }
        ActionKindConfig::BatteryCheck { low, full } => SpecialActionKind::BatteryCheck {
            low: *low,
            full: *full,
        },
        ActionKindConfig::WheelCalibrate => SpecialActionKind::WheelCalibrate,
        ActionKindConfig::MultiAction {
            tap,
            hold,
            double_tap,
        } => {
            let steps = |codes: &[i32]| -> Option<Arc<[MacroStep]>> {
                if codes.is_empty() {
                    Some(Arc::from(Vec::new()))
                } else {
                    parse_macro(codes).map(Arc::from)
                }
            };
            match (steps(tap), steps(hold), steps(double_tap)) {
                (Some(tap), Some(hold), Some(double_tap)) => SpecialActionKind::MultiAction {
                    tap,
                    hold,
                    double_tap,
                },
                _ => {
                    invalid("multi-action macro");
                    return None;
                }
            }
        }
        ActionKindConfig::XboxGameDvr => SpecialActionKind::xbox_game_dvr(),
    };

    Some(SpecialAction {
        name: action.name.clone(),
        triggers: action.triggers.clone(),
        untriggers: action.untriggers.clone(),
        kind,
        delay: Duration::from_millis(action.delay_ms),
    })
}

/// Persisted wheel calibrations, keyed by device slot
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CalibrationBook {
    pub devices: BTreeMap<String, WheelAnchors>,
    /// Set when an in-memory calibration has not been written yet
    #[serde(skip)]
    pub dirty: bool,
}

impl CalibrationBook {
    pub fn get(&self, device: DeviceIndex) -> Option<WheelAnchors> {
        self.devices.get(&device.get().to_string()).copied()
    }

    pub fn insert(&mut self, device: DeviceIndex, anchors: WheelAnchors) {
        self.devices.insert(device.get().to_string(), anchors);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::synthetic::MouseChannel;

    const PROFILE: &str = r#"
name = "racing"

[wheel]
enabled = true
channel = "trigger_pair"
range_deg = 900

[[bindings]]
control = "Cross"
normal = { effect = { type = "key", code = 32 }, extras = "0,0,1,255,0,0,0,0,0" }
shift = { effect = { type = "remap", target = { mouse = "Left" } } }
shift_trigger = "L1"

[[bindings]]
control = "Square"
normal = { effect = { type = "macro", codes = [65, 0] } }

[[bindings]]
control = "R2"
normal = { effect = { type = "remap", target = { control = "Cross" } } }

[[actions]]
name = "calibrate"
triggers = ["PS", "Options"]
kind = { type = "wheel_calibrate" }

[[actions]]
name = "broken"
triggers = []
kind = { type = "key", code = 13 }

[[actions]]
name = "switch"
triggers = ["Share"]
untriggers = ["Share", "PS"]
delay_ms = 250
kind = { type = "profile", name = "default" }
"#;

    #[test]
    fn resolves_bindings_and_actions() {
        let config: ProfileConfig = toml::from_str(PROFILE).unwrap();
        let profile = config.resolve();

        assert_eq!(profile.name, "racing");
        assert!(profile.wheel.enabled);
        assert_eq!(profile.wheel.range_deg, 900);

        let cross = profile.bindings.get(Control::Cross);
        assert_eq!(
            cross.normal.effect,
            BindingEffect::Key {
                code: KeyCode(32),
                modifiers: KeyModifiers::default()
            }
        );
        assert!(cross.normal.extras.and_then(|e| e.lightbar).is_some());
        assert_eq!(
            cross.shift.effect,
            BindingEffect::Remap(RemapTarget::Mouse(MouseChannel::Left))
        );
        assert_eq!(cross.shift_trigger, Some(Control::L1));
        assert_eq!(
            profile.bindings.get(Control::R2).normal.effect,
            BindingEffect::Remap(RemapTarget::Control(Control::Cross))
        );

        assert_eq!(profile.actions.len(), 2);
        assert_eq!(profile.actions[0].kind, SpecialActionKind::WheelCalibrate);
        assert_eq!(profile.actions[1].delay, Duration::from_millis(250));
    }

    #[test]
    fn malformed_entries_become_unbound() {
        let config: ProfileConfig = toml::from_str(PROFILE).unwrap();
        let profile = config.resolve();

        // code 0 is outside every macro range
        assert_eq!(
            profile.bindings.get(Control::Square).normal.effect,
            BindingEffect::Unbound
        );
        assert!(profile.bindings.is_unbound(Control::Triangle));
    }

    #[test]
    fn self_remap_and_bad_extras_are_dropped() {
        let config = ProfileConfig {
            bindings: vec![BindingConfig {
                control: Control::L1,
                normal: LayerConfig {
                    effect: Some(EffectConfig::Remap {
                        target: RemapTarget::Control(Control::L1),
                    }),
                    extras: Some("1,2,three".to_string()),
                },
                shift: LayerConfig::default(),
                shift_trigger: None,
            }],
            ..ProfileConfig::named("loop")
        };
        let profile = config.resolve();
        let binding = profile.bindings.get(Control::L1);
        assert_eq!(binding.normal.effect, BindingEffect::Unbound);
        assert_eq!(binding.normal.extras, None);
    }

    #[test]
    fn calibration_book_marks_dirty() {
        let device = DeviceIndex::new(2).unwrap();
        let mut book = CalibrationBook::default();
        assert_eq!(book.get(device), None);

        let anchors = WheelAnchors::estimated(Default::default());
        book.insert(device, anchors);
        assert!(book.dirty);
        assert_eq!(book.get(device), Some(anchors));

        let text = toml::to_string_pretty(&book).unwrap();
        let parsed: CalibrationBook = toml::from_str(&text).unwrap();
        assert!(!parsed.dirty);
        assert_eq!(parsed.devices.len(), 1);
    }
}
