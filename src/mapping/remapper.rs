//! Binding resolution for every logical control
//!
//! Controls are visited in enumeration order. Key and macro effects stage into
//! the device's synthetic state, remaps are queued and resolved after the walk
//! so every destination sees all of its sources at once.

use crate::mapping::binding::{BindingEffect, BindingTable, Extras, MouseDirection, RemapTarget};
use crate::mapping::controls::{Control, ControlKind, FieldMapping};
use crate::mapping::macro_player::{MacroPlayer, MacroStatus};
use crate::mapping::synthetic::{KeyMode, SyntheticState};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Mouse sensitivity used when no extras override is active
pub const DEFAULT_MOUSE_SENSITIVITY: u8 = 25;

/// Change of the single extras owner slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrasEvent {
    Activated { owner: Control, extras: Extras },
    Deactivated { owner: Control },
}

#[derive(Debug, Clone)]
pub struct RemapResult {
    pub output: FieldMapping,
    pub extras_event: Option<ExtrasEvent>,
}

#[derive(Debug)]
pub struct ControlRemapper {
    bindings: Arc<BindingTable>,
    macros: Vec<Option<MacroPlayer>>,
    was_active: [bool; Control::COUNT],
    suppressed: [bool; Control::COUNT],
    overrides: [bool; Control::COUNT],
    extras_owner: Option<(Control, Extras)>,
    queue: Vec<(Control, RemapTarget)>,
}

impl ControlRemapper {
    pub fn new(bindings: Arc<BindingTable>) -> Self {
        Self {
            bindings,
            macros: vec![None; Control::COUNT],
            was_active: [false; Control::COUNT],
            suppressed: [false; Control::COUNT],
            overrides: [false; Control::COUNT],
            extras_owner: None,
            queue: Vec::with_capacity(Control::COUNT),
        }
    }

    pub fn extras(&self) -> Option<Extras> {
        self.extras_owner.map(|(_, extras)| extras)
    }

    pub fn is_macro_playing(&self, control: Control) -> bool {
        self.macros[control.index()].is_some()
    }

    /// Treats the controls as released until they are physically let go
    pub fn suppress(&mut self, controls: &[Control]) {
        for control in controls {
            debug!("Suppressing {} until release", control);
            self.suppressed[control.index()] = true;
        }
    }

    /// Swaps in a new binding table, dropping every latch owned by the old one
    pub fn reload(
        &mut self,
        bindings: Arc<BindingTable>,
        synth: &mut SyntheticState,
    ) -> Option<ExtrasEvent> {
        for code in self.bindings.toggle_keys() {
            synth.force_untoggle(code);
        }
        for slot in self.macros.iter_mut() {
            if let Some(mut player) = slot.take() {
                player.cancel();
            }
        }
        self.overrides = [false; Control::COUNT];
        self.was_active = [false; Control::COUNT];
        self.bindings = bindings;

        self.extras_owner
            .take()
            .map(|(owner, _)| ExtrasEvent::Deactivated { owner })
    }

    pub fn remap(
        &mut self,
        input: &FieldMapping,
        synth: &mut SyntheticState,
        now: Instant,
    ) -> RemapResult {
        let bindings = Arc::clone(&self.bindings);
        let mut output = input.clone();
        let mut claimants: Vec<(Control, Extras)> = Vec::new();
        let mut newly_claimed: Option<(Control, Extras)> = None;
        self.queue.clear();

        for control in Control::ALL {
            let i = control.index();
            let active = input.is_active(control);

            if self.suppressed[i] {
                if active {
                    if self.was_active[i] {
                        self.cancel_macro(control);
                    }
                    self.was_active[i] = false;
                    output.clear(control);
                    continue;
                }
                debug!("{} released, lifting suppression", control);
                self.suppressed[i] = false;
            }

            let rising = active && !self.was_active[i];
            let falling = !active && self.was_active[i];
            self.was_active[i] = active;

            let binding = bindings.get(control);
            let layer = match binding.shift_trigger {
                Some(trigger)
                    if input.is_active(trigger) && binding.shift.effect != BindingEffect::Unbound =>
                {
                    &binding.shift
                }
                _ => &binding.normal,
            };

            match &layer.effect {
                BindingEffect::Unbound => {}
                BindingEffect::Key { code, modifiers } => {
                    output.clear(control);
                    if active {
                        let mode = KeyMode::from_scan_code(modifiers.scan_code);
                        if modifiers.toggle {
                            synth.press_toggle(*code, mode);
                        } else {
                            synth.press_key(*code, mode);
                        }
                    }
                }
                BindingEffect::Macro {
                    steps,
                    repeat,
                    scan_code,
                } => {
                    output.clear(control);
                    if rising {
                        debug!("Starting macro on {}", control);
                        self.macros[i] = Some(MacroPlayer::start(
                            Arc::clone(steps),
                            KeyMode::from_scan_code(*scan_code),
                            *repeat,
                            Some(control),
                            now,
                        ));
                        self.overrides[i] = true;
                    }
                }
                BindingEffect::Remap(target) => {
                    output.clear(control);
                    if input.magnitude(control) > 0 {
                        self.queue.push((control, *target));
                    }
                }
            }

            if falling {
                self.cancel_macro(control);
            }

            if self.overrides[i] {
                output.clear(control);
            }
            output.set_macro_override(control, self.overrides[i]);

            if active {
                if let Some(extras) = layer.extras {
                    claimants.push((control, extras));
                    if rising && newly_claimed.is_none() {
                        newly_claimed = Some((control, extras));
                    }
                }
            }
        }

        self.advance_macros(input, synth, now);
        self.drain_queue(input, &mut output, synth);
        let extras_event = self.resolve_extras(&claimants, newly_claimed);

        RemapResult {
            output,
            extras_event,
        }
    }

    fn cancel_macro(&mut self, control: Control) {
        let i = control.index();
        if let Some(mut player) = self.macros[i].take() {
            if player.bound() == Some(control) {
                debug!("Cancelling macro on {} release", control);
                player.cancel();
            } else {
                self.macros[i] = Some(player);
                return;
            }
        }
        self.overrides[i] = false;
    }

    fn advance_macros(&mut self, input: &FieldMapping, synth: &mut SyntheticState, now: Instant) {
        for control in Control::ALL {
            let i = control.index();
            let Some(player) = self.macros[i].as_mut() else {
                continue;
            };
            if player.advance(now, input.is_active(control), synth) == MacroStatus::Finished {
                debug!("Macro on {} finished", control);
                self.macros[i] = None;
                self.overrides[i] = false;
            }
        }
    }

    /// Resolves queued remaps; later controls in enumeration order win ties
    fn drain_queue(&mut self, input: &FieldMapping, output: &mut FieldMapping, synth: &mut SyntheticState) {
        let sensitivity = self
            .extras_owner
            .and_then(|(_, extras)| extras.mouse_sensitivity)
            .unwrap_or(DEFAULT_MOUSE_SENSITIVITY);

        for (source, target) in self.queue.drain(..) {
            let magnitude = input.magnitude(source);
            match target {
                RemapTarget::Control(destination) => match destination.kind() {
                    ControlKind::Button | ControlKind::Touch => {
                        if input.is_active(source) {
                            output.press(destination);
                        }
                    }
                    ControlKind::AxisDir { .. }
                    | ControlKind::Trigger
                    | ControlKind::GyroDir
                    | ControlKind::Swipe => {
                        if magnitude >= output.magnitude(destination) {
                            output.set_magnitude(destination, magnitude);
                        }
                    }
                },
                RemapTarget::Mouse(channel) => {
                    if input.is_active(source) {
                        synth.press_mouse(channel);
                    }
                }
                RemapTarget::MouseMove(direction) => {
                    let pixels =
                        (magnitude as f64 / 255.0 * sensitivity as f64 / 2.5).round() as i32;
                    match direction {
                        MouseDirection::Up => synth.move_mouse(0, -pixels),
                        MouseDirection::Down => synth.move_mouse(0, pixels),
                        MouseDirection::Left => synth.move_mouse(-pixels, 0),
                        MouseDirection::Right => synth.move_mouse(pixels, 0),
                    }
                }
            }
        }
    }

    fn resolve_extras(
        &mut self,
        claimants: &[(Control, Extras)],
        newly_claimed: Option<(Control, Extras)>,
    ) -> Option<ExtrasEvent> {
        if let Some((owner, extras)) = newly_claimed {
            self.extras_owner = Some((owner, extras));
            return Some(ExtrasEvent::Activated { owner, extras });
        }

        let (owner, current) = self.extras_owner?;
        if let Some(&(_, extras)) = claimants.iter().find(|(c, _)| *c == owner) {
            if extras == current {
                return None;
            }
            self.extras_owner = Some((owner, extras));
            return Some(ExtrasEvent::Activated { owner, extras });
        }

        match claimants.first() {
            Some(&(next, extras)) => {
                debug!("Extras ownership moves from {} to {}", owner, next);
                self.extras_owner = Some((next, extras));
                Some(ExtrasEvent::Activated { owner: next, extras })
            }
            None => {
                self.extras_owner = None;
                Some(ExtrasEvent::Deactivated { owner })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::binding::{
        parse_macro, BindingLayer, ControlBinding, KeyModifiers, MacroStep,
    };
    use crate::mapping::synthetic::{KeyCode, MouseChannel};
    use std::time::Duration;

    fn layer(effect: BindingEffect) -> BindingLayer {
        BindingLayer { effect, extras: None }
    }

    fn table(entries: Vec<(Control, ControlBinding)>) -> Arc<BindingTable> {
        let mut table = BindingTable::default();
        for (control, binding) in entries {
            table.set(control, binding);
        }
        Arc::new(table)
    }

    fn key(code: u16) -> BindingEffect {
        BindingEffect::Key {
            code: KeyCode(code),
            modifiers: KeyModifiers::default(),
        }
    }

    fn pressed(controls: &[Control]) -> FieldMapping {
        let mut input = FieldMapping::default();
        for control in controls {
            input.press(*control);
        }
        input
    }

    #[test]
    fn key_binding_stages_key_and_clears_output() {
        let bindings = table(vec![(
            Control::Cross,
            ControlBinding { normal: layer(key(0x20)), ..Default::default() },
        )]);
        let mut remapper = ControlRemapper::new(bindings);
        let mut synth = SyntheticState::new();

        let result = remapper.remap(&pressed(&[Control::Cross]), &mut synth, Instant::now());
        assert!(synth.is_key_staged(KeyCode(0x20)));
        assert!(!result.output.is_active(Control::Cross));
    }

    #[test]
    fn shift_layer_applies_while_trigger_held() {
        let bindings = table(vec![(
            Control::Cross,
            ControlBinding {
                normal: layer(key(0x41)),
                shift: layer(key(0x42)),
                shift_trigger: Some(Control::L1),
            },
        )]);
        let mut remapper = ControlRemapper::new(bindings);

        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[Control::Cross, Control::L1]), &mut synth, Instant::now());
        assert!(synth.is_key_staged(KeyCode(0x42)));
        assert!(!synth.is_key_staged(KeyCode(0x41)));
    }

    #[test]
    fn remaps_to_shared_axis_take_largest_magnitude() {
        let bindings = table(vec![
            (
                Control::LXPos,
                ControlBinding {
                    normal: layer(BindingEffect::Remap(RemapTarget::Control(Control::RXPos))),
                    ..Default::default()
                },
            ),
            (
                Control::LYPos,
                ControlBinding {
                    normal: layer(BindingEffect::Remap(RemapTarget::Control(Control::RXPos))),
                    ..Default::default()
                },
            ),
        ]);
        let mut remapper = ControlRemapper::new(bindings);
        let mut input = FieldMapping::default();
        input.set_magnitude(Control::LXPos, 200);
        input.set_magnitude(Control::LYPos, 255);

        let mut synth = SyntheticState::new();
        let result = remapper.remap(&input, &mut synth, Instant::now());
        assert_eq!(result.output.magnitude(Control::RXPos), 255);
        assert_eq!(result.output.magnitude(Control::LXPos), 0);
        assert_eq!(result.output.magnitude(Control::LYPos), 0);
    }

    #[test]
    fn button_remap_to_mouse_button() {
        let bindings = table(vec![(
            Control::R1,
            ControlBinding {
                normal: layer(BindingEffect::Remap(RemapTarget::Mouse(MouseChannel::Left))),
                ..Default::default()
            },
        )]);
        let mut remapper = ControlRemapper::new(bindings);
        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[Control::R1]), &mut synth, Instant::now());
        assert!(synth.is_mouse_staged(MouseChannel::Left));
    }

    #[test]
    fn extras_activate_transfer_and_deactivate_once() {
        let heavy = Extras::parse("200,0,0,0,0,0,0,0,0").unwrap();
        let light = Extras::parse("0,90,0,0,0,0,0,0,0").unwrap();
        let bindings = table(vec![
            (
                Control::L1,
                ControlBinding {
                    normal: BindingLayer { effect: BindingEffect::Unbound, extras: Some(heavy) },
                    ..Default::default()
                },
            ),
            (
                Control::R1,
                ControlBinding {
                    normal: BindingLayer { effect: BindingEffect::Unbound, extras: Some(light) },
                    ..Default::default()
                },
            ),
        ]);
        let mut remapper = ControlRemapper::new(bindings);
        let mut synth = SyntheticState::new();
        let now = Instant::now();

        let result = remapper.remap(&pressed(&[Control::L1]), &mut synth, now);
        assert_eq!(
            result.extras_event,
            Some(ExtrasEvent::Activated { owner: Control::L1, extras: heavy })
        );

        let result = remapper.remap(&pressed(&[Control::L1, Control::R1]), &mut synth, now);
        assert_eq!(
            result.extras_event,
            Some(ExtrasEvent::Activated { owner: Control::R1, extras: light })
        );

        let result = remapper.remap(&pressed(&[Control::L1]), &mut synth, now);
        assert_eq!(
            result.extras_event,
            Some(ExtrasEvent::Activated { owner: Control::L1, extras: heavy })
        );

        let result = remapper.remap(&pressed(&[]), &mut synth, now);
        assert_eq!(result.extras_event, Some(ExtrasEvent::Deactivated { owner: Control::L1 }));

        let result = remapper.remap(&pressed(&[]), &mut synth, now);
        assert_eq!(result.extras_event, None);
    }

    #[test]
    fn suppressed_control_stays_released_until_let_go() {
        let bindings = table(vec![(
            Control::Cross,
            ControlBinding { normal: layer(key(0x20)), ..Default::default() },
        )]);
        let mut remapper = ControlRemapper::new(bindings);
        let now = Instant::now();

        remapper.suppress(&[Control::Cross]);
        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[Control::Cross]), &mut synth, now);
        assert!(!synth.is_key_staged(KeyCode(0x20)));

        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[]), &mut synth, now);
        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[Control::Cross]), &mut synth, now);
        assert!(synth.is_key_staged(KeyCode(0x20)));
    }

    #[test]
    fn bound_macro_cancels_on_release() {
        let steps: Arc<[MacroStep]> = parse_macro(&[0x41, 5300, 0x41]).unwrap().into();
        let bindings = table(vec![(
            Control::Square,
            ControlBinding {
                normal: layer(BindingEffect::Macro { steps, repeat: false, scan_code: false }),
                ..Default::default()
            },
        )]);
        let mut remapper = ControlRemapper::new(bindings);
        let t0 = Instant::now();

        let mut synth = SyntheticState::new();
        let result = remapper.remap(&pressed(&[Control::Square]), &mut synth, t0);
        assert!(synth.is_key_staged(KeyCode(0x41)));
        assert!(result.output.macro_override(Control::Square));

        let mut synth = SyntheticState::new();
        let result = remapper.remap(&pressed(&[]), &mut synth, t0 + Duration::from_millis(20));
        assert!(!synth.is_key_staged(KeyCode(0x41)));
        assert!(!remapper.is_macro_playing(Control::Square));
        assert!(!result.output.macro_override(Control::Square));
    }

    #[test]
    fn reload_drops_extras_and_macros() {
        let extras = Extras::parse("0,0,1,255,0,0,0,0,0").unwrap();
        let steps: Arc<[MacroStep]> = parse_macro(&[0x41, 5300, 0x41]).unwrap().into();
        let bindings = table(vec![(
            Control::Square,
            ControlBinding {
                normal: BindingLayer {
                    effect: BindingEffect::Macro { steps, repeat: false, scan_code: false },
                    extras: Some(extras),
                },
                ..Default::default()
            },
        )]);
        let mut remapper = ControlRemapper::new(bindings);
        let mut synth = SyntheticState::new();
        remapper.remap(&pressed(&[Control::Square]), &mut synth, Instant::now());

        let event = remapper.reload(Arc::new(BindingTable::default()), &mut synth);
        assert_eq!(event, Some(ExtrasEvent::Deactivated { owner: Control::Square }));
        assert!(!remapper.is_macro_playing(Control::Square));
        assert_eq!(remapper.extras(), None);
    }
}
