//! Profile-level gesture and trigger actions
//!
//! Every action owns a latch that moves through
//!
//! ```text
//! Idle ──► Triggered ──► Active ───────► Untriggered ──► Idle
//!   │                      ▲
//!   ├──► HoldPending ──────┤
//!   │         │            │
//!   │         ▼            │
//!   └──── TapPending ──────┘
//! ```
//!
//! Timed gestures compare against instants captured on edges. Nothing here
//! sleeps; a pending gesture expires when a later tick observes its deadline.

use crate::mapping::binding::{BindingTable, KeyModifiers, MacroStep};
use crate::mapping::controls::{Control, FieldMapping};
use crate::mapping::error::MappingError;
use crate::mapping::feedback::{LightbarOverride, Rgb};
use crate::mapping::macro_player::{MacroPlayer, MacroStatus};
use crate::mapping::synthetic::{KeyCode, KeyMode, SyntheticState};
use crate::mapping::wheel::WheelCommand;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Releases shorter than this are taps
pub const TAP_THRESHOLD: Duration = Duration::from_millis(100);
/// Holds at least this long select the hold macro
pub const HOLD_THRESHOLD: Duration = Duration::from_millis(500);
/// Time after a tap in which a second press counts as a double tap
pub const DOUBLE_TAP_WINDOW: Duration = Duration::from_millis(150);
/// Length of the passthrough pulse a tap falls through with
pub const TAP_PULSE: Duration = Duration::from_millis(40);
/// Minimum spacing between accepted wheel-calibration commands
pub const CALIBRATE_DEBOUNCE: Duration = Duration::from_secs(3);

const BATTERY_FADE_STEP: u8 = 5;

const VK_MENU: u16 = 0x12;
const VK_SNAPSHOT: u16 = 0x2C;
const VK_G: u16 = 0x47;
const VK_R: u16 = 0x52;
const VK_LWIN: u16 = 0x5B;

/// Presses every key in order, then releases in reverse
fn chord(keys: &[u16]) -> Arc<[MacroStep]> {
    keys.iter()
        .map(|k| MacroStep::KeyDown(KeyCode(*k)))
        .chain(keys.iter().rev().map(|k| MacroStep::KeyUp(KeyCode(*k))))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpecialActionKind {
    Macro {
        steps: Arc<[MacroStep]>,
        scan_code: bool,
    },
    Program {
        path: String,
        args: String,
    },
    Profile {
        name: String,
        /// Restore on the first trigger release instead of the untrigger set
        auto_untrigger: bool,
    },
    Key {
        code: KeyCode,
        modifiers: KeyModifiers,
    },
    BatteryCheck {
        low: Rgb,
        full: Rgb,
    },
    WheelCalibrate,
    MultiAction {
        tap: Arc<[MacroStep]>,
        hold: Arc<[MacroStep]>,
        double_tap: Arc<[MacroStep]>,
    },
}

impl SpecialActionKind {
    /// Game bar shortcuts: Win+G, Win+Alt+PrintScreen, Win+Alt+R
    pub fn xbox_game_dvr() -> Self {
        Self::MultiAction {
            tap: chord(&[VK_LWIN, VK_G]),
            hold: chord(&[VK_LWIN, VK_MENU, VK_SNAPSHOT]),
            double_tap: chord(&[VK_LWIN, VK_MENU, VK_R]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecialAction {
    pub name: String,
    pub triggers: Vec<Control>,
    pub untriggers: Vec<Control>,
    pub kind: SpecialActionKind,
    /// Continuous hold required before a plain action fires
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionPhase {
    #[default]
    Idle,
    Triggered,
    TapPending,
    HoldPending,
    Active,
    Untriggered,
}

/// How an action's trigger set is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gesture {
    Plain,
    Delayed,
    /// Single otherwise unbound trigger, taps fall through to the default mapping
    TapOrHold,
    Multi,
}

#[derive(Debug, Clone, Default)]
struct ActionLatch {
    phase: ActionPhase,
    tapped_once: bool,
    first_touch: Option<Instant>,
    second_touch_begin: Option<Instant>,
    released_at: Option<Instant>,
    action_done: bool,
    key_held: bool,
    fade: u8,
    /// The press that is currently held started a calibration
    calibration_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Fire,
    Release,
    PassTap,
    Tap,
    Hold,
    DoubleTap,
}

/// Request to switch to a temporary profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSwitch {
    pub name: String,
    pub triggers: Vec<Control>,
    pub untriggers: Vec<Control>,
    pub auto_untrigger: bool,
}

/// Side effects of one tick of the action engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub profile_switch: Option<ProfileSwitch>,
    pub lightbar: Option<LightbarOverride>,
    pub wheel_command: Option<WheelCommand>,
}

/// Device-level values the actions read
#[derive(Debug, Clone, Copy)]
pub struct ActionInput<'a> {
    pub input: &'a FieldMapping,
    pub battery: u8,
    pub calibrating: bool,
}

/// Launch collaborator for program actions
pub trait ProgramLauncher: Send + Sync {
    fn launch(&self, path: &str, args: &str) -> Result<(), MappingError>;
}

/// Launcher that only logs the request
#[derive(Debug, Default)]
pub struct LoggingLauncher;

impl ProgramLauncher for LoggingLauncher {
    fn launch(&self, path: &str, args: &str) -> Result<(), MappingError> {
        info!("Launch requested: {} {}", path, args);
        Ok(())
    }
}

pub struct SpecialActionEngine {
    actions: Arc<[SpecialAction]>,
    gestures: Vec<Gesture>,
    latches: Vec<ActionLatch>,
    macros: Vec<MacroPlayer>,
    pulses: Vec<(Control, Instant)>,
    last_calibrate_command: Option<Instant>,
    launcher: Arc<dyn ProgramLauncher>,
}

impl SpecialActionEngine {
    pub fn new(
        actions: Arc<[SpecialAction]>,
        bindings: &BindingTable,
        launcher: Arc<dyn ProgramLauncher>,
    ) -> Self {
        let gestures = classify(&actions, bindings);
        Self {
            latches: vec![ActionLatch::default(); actions.len()],
            actions,
            gestures,
            macros: Vec::new(),
            pulses: Vec::new(),
            last_calibrate_command: None,
            launcher,
        }
    }

    /// Replaces the action list and resets every latch to Idle
    pub fn reload(&mut self, actions: Arc<[SpecialAction]>, bindings: &BindingTable) {
        info!("Reloading {} special actions", actions.len());
        self.gestures = classify(&actions, bindings);
        self.actions = actions;
        self.reset();
    }

    /// Drops every latch, playing macro and pending pulse
    pub fn reset(&mut self) {
        self.latches = vec![ActionLatch::default(); self.actions.len()];
        self.macros.clear();
        self.pulses.clear();
    }

    pub fn phase(&self, index: usize) -> Option<ActionPhase> {
        self.latches.get(index).map(|latch| latch.phase)
    }

    pub fn process(
        &mut self,
        ctx: ActionInput<'_>,
        output: &mut FieldMapping,
        synth: &mut SyntheticState,
        now: Instant,
    ) -> ActionOutcome {
        let actions = Arc::clone(&self.actions);
        let mut outcome = ActionOutcome::default();

        for (index, action) in actions.iter().enumerate() {
            let all_held =
                !action.triggers.is_empty() && action.triggers.iter().all(|c| ctx.input.is_active(*c));
            let gesture = self.gestures[index];
            let latch = &mut self.latches[index];

            if latch.phase == ActionPhase::Untriggered {
                latch.phase = ActionPhase::Idle;
            }

            let transition = match gesture {
                Gesture::Plain => step_plain(latch, all_held, now),
                Gesture::Delayed => step_delayed(latch, all_held, action.delay, now),
                Gesture::TapOrHold => step_tap_or_hold(latch, all_held, now),
                Gesture::Multi => step_multi(latch, all_held, now),
            };

            if transition != Transition::None {
                debug!("Action '{}' {:?} -> {:?}", action.name, transition, latch.phase);
            }

            match transition {
                Transition::None => {}
                Transition::Fire => self.fire(index, action, &ctx, &mut outcome, now),
                Transition::Release => self.release(index, action, &ctx, &mut outcome, now),
                Transition::PassTap => {
                    if let Some(trigger) = action.triggers.first() {
                        self.pulses.push((*trigger, now + TAP_PULSE));
                    }
                }
                Transition::Tap | Transition::Hold | Transition::DoubleTap => {
                    if let SpecialActionKind::MultiAction { tap, hold, double_tap } = &action.kind {
                        let steps = match transition {
                            Transition::Tap => tap,
                            Transition::Hold => hold,
                            _ => double_tap,
                        };
                        info!("Action '{}' plays {:?} macro", action.name, transition);
                        self.macros.push(MacroPlayer::start(
                            Arc::clone(steps),
                            KeyMode::VirtualKey,
                            false,
                            None,
                            now,
                        ));
                    }
                }
            }

            self.tick_active(index, action, &ctx, &mut outcome, synth);

            let latch = &self.latches[index];
            let gesture_pending = matches!(
                latch.phase,
                ActionPhase::HoldPending | ActionPhase::Active | ActionPhase::TapPending
            );
            if matches!(gesture, Gesture::TapOrHold | Gesture::Multi) && gesture_pending {
                for trigger in &action.triggers {
                    output.clear(*trigger);
                }
            }
        }

        self.pulses.retain(|(_, until)| now < *until);
        for (control, _) in &self.pulses {
            output.press(*control);
        }

        self.macros
            .retain_mut(|player| player.advance(now, false, synth) == MacroStatus::Playing);

        outcome
    }

    fn fire(
        &mut self,
        index: usize,
        action: &SpecialAction,
        ctx: &ActionInput<'_>,
        outcome: &mut ActionOutcome,
        now: Instant,
    ) {
        info!("Special action '{}' fired", action.name);
        match &action.kind {
            SpecialActionKind::Macro { steps, scan_code } => {
                self.macros.push(MacroPlayer::start(
                    Arc::clone(steps),
                    KeyMode::from_scan_code(*scan_code),
                    false,
                    None,
                    now,
                ));
            }
            SpecialActionKind::Program { path, args } => {
                if let Err(e) = self.launcher.launch(path, args) {
                    warn!("Action '{}' failed to launch {}: {}", action.name, path, e);
                }
            }
            SpecialActionKind::Profile {
                name,
                auto_untrigger,
            } => {
                outcome.profile_switch = Some(ProfileSwitch {
                    name: name.clone(),
                    triggers: action.triggers.clone(),
                    untriggers: action.untriggers.clone(),
                    auto_untrigger: *auto_untrigger,
                });
            }
            SpecialActionKind::Key { .. } => self.latches[index].key_held = true,
            SpecialActionKind::BatteryCheck { .. } => self.latches[index].fade = 0,
            SpecialActionKind::WheelCalibrate => {
                if ctx.calibrating {
                    self.latches[index].calibration_started = false;
                } else if self.accept_calibrate_command(now) {
                    self.latches[index].calibration_started = true;
                    outcome.wheel_command = Some(WheelCommand::Begin);
                }
            }
            SpecialActionKind::MultiAction { .. } => {}
        }
    }

    fn release(
        &mut self,
        index: usize,
        action: &SpecialAction,
        ctx: &ActionInput<'_>,
        outcome: &mut ActionOutcome,
        now: Instant,
    ) {
        if action.kind != SpecialActionKind::WheelCalibrate {
            return;
        }
        let latch = &mut self.latches[index];
        let started = std::mem::take(&mut latch.calibration_started);
        if started || !ctx.calibrating {
            return;
        }
        let held = latch
            .first_touch
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if self.accept_calibrate_command(now) {
            outcome.wheel_command = Some(if held >= CALIBRATE_DEBOUNCE {
                WheelCommand::Cancel
            } else {
                WheelCommand::Complete
            });
        }
    }

    fn accept_calibrate_command(&mut self, now: Instant) -> bool {
        let accepted = self
            .last_calibrate_command
            .map_or(true, |at| now.saturating_duration_since(at) >= CALIBRATE_DEBOUNCE);
        if accepted {
            self.last_calibrate_command = Some(now);
        } else {
            debug!("Ignoring wheel calibration command inside debounce window");
        }
        accepted
    }

    /// Per-tick work of actions that stay on while held
    fn tick_active(
        &mut self,
        index: usize,
        action: &SpecialAction,
        ctx: &ActionInput<'_>,
        outcome: &mut ActionOutcome,
        synth: &mut SyntheticState,
    ) {
        let latch = &mut self.latches[index];
        match &action.kind {
            SpecialActionKind::Key { code, modifiers } if latch.key_held => {
                let release = if action.untriggers.is_empty() {
                    latch.phase != ActionPhase::Active
                } else {
                    action.untriggers.iter().all(|c| ctx.input.is_active(*c))
                };
                if release {
                    debug!("Action '{}' releases key {}", action.name, code);
                    latch.key_held = false;
                } else {
                    synth.press_key(*code, KeyMode::from_scan_code(modifiers.scan_code));
                }
            }
            SpecialActionKind::BatteryCheck { low, full } if latch.phase == ActionPhase::Active => {
                latch.fade = latch.fade.saturating_add(BATTERY_FADE_STEP).min(100);
                let target = low.lerp(*full, ctx.battery.min(100) as f64 / 100.0);
                let color = Rgb::default().lerp(target, latch.fade as f64 / 100.0);
                outcome.lightbar = Some(LightbarOverride { color, flash: 0 });
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for SpecialActionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialActionEngine")
            .field("actions", &self.actions.len())
            .field("playing_macros", &self.macros.len())
            .finish_non_exhaustive()
    }
}

fn classify(actions: &[SpecialAction], bindings: &BindingTable) -> Vec<Gesture> {
    actions
        .iter()
        .map(|action| match (&action.kind, action.triggers.as_slice()) {
            (SpecialActionKind::MultiAction { .. }, _) => Gesture::Multi,
            _ if !action.delay.is_zero() => Gesture::Delayed,
            (_, [single]) if bindings.is_unbound(*single) => Gesture::TapOrHold,
            _ => Gesture::Plain,
        })
        .collect()
}

fn step_plain(latch: &mut ActionLatch, all_held: bool, now: Instant) -> Transition {
    match (latch.phase, all_held) {
        (ActionPhase::Idle, true) => {
            latch.phase = ActionPhase::Active;
            latch.first_touch = Some(now);
            if latch.action_done {
                Transition::None
            } else {
                latch.action_done = true;
                Transition::Fire
            }
        }
        (ActionPhase::Active, false) => {
            latch.phase = ActionPhase::Untriggered;
            latch.action_done = false;
            Transition::Release
        }
        _ => Transition::None,
    }
}

fn step_delayed(latch: &mut ActionLatch, all_held: bool, delay: Duration, now: Instant) -> Transition {
    match (latch.phase, all_held) {
        (ActionPhase::Idle, true) => {
            latch.phase = ActionPhase::Triggered;
            latch.first_touch = Some(now);
            Transition::None
        }
        (ActionPhase::Triggered, true) => {
            let held = latch
                .first_touch
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if held >= delay {
                latch.phase = ActionPhase::Active;
                latch.action_done = true;
                Transition::Fire
            } else {
                Transition::None
            }
        }
        (ActionPhase::Triggered, false) => {
            latch.phase = ActionPhase::Idle;
            Transition::None
        }
        (ActionPhase::Active, false) => {
            latch.phase = ActionPhase::Untriggered;
            latch.action_done = false;
            Transition::Release
        }
        _ => Transition::None,
    }
}

fn step_tap_or_hold(latch: &mut ActionLatch, all_held: bool, now: Instant) -> Transition {
    match (latch.phase, all_held) {
        (ActionPhase::Idle, true) => {
            latch.phase = ActionPhase::HoldPending;
            latch.first_touch = Some(now);
            Transition::None
        }
        (ActionPhase::HoldPending, true) => {
            let held = latch
                .first_touch
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if held >= TAP_THRESHOLD {
                latch.phase = ActionPhase::Active;
                latch.action_done = true;
                Transition::Fire
            } else {
                Transition::None
            }
        }
        (ActionPhase::HoldPending, false) => {
            latch.phase = ActionPhase::Idle;
            Transition::PassTap
        }
        (ActionPhase::Active, false) => {
            latch.phase = ActionPhase::Untriggered;
            latch.action_done = false;
            Transition::Release
        }
        _ => Transition::None,
    }
}

fn step_multi(latch: &mut ActionLatch, all_held: bool, now: Instant) -> Transition {
    if latch.phase == ActionPhase::TapPending {
        let expired = latch
            .released_at
            .map_or(true, |at| now.saturating_duration_since(at) > DOUBLE_TAP_WINDOW);
        if expired {
            let tapped = std::mem::take(&mut latch.tapped_once);
            latch.phase = ActionPhase::Idle;
            if tapped {
                return Transition::Tap;
            }
        } else if all_held {
            latch.second_touch_begin = Some(now);
            latch.tapped_once = false;
            latch.action_done = true;
            latch.phase = ActionPhase::Active;
            return Transition::DoubleTap;
        } else {
            return Transition::None;
        }
    }

    match (latch.phase, all_held) {
        (ActionPhase::Idle, true) => {
            latch.phase = ActionPhase::HoldPending;
            latch.first_touch = Some(now);
            latch.second_touch_begin = None;
            Transition::None
        }
        (ActionPhase::HoldPending, true) => {
            let held = latch
                .first_touch
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if held >= HOLD_THRESHOLD {
                latch.phase = ActionPhase::Active;
                latch.action_done = true;
                Transition::Hold
            } else {
                Transition::None
            }
        }
        (ActionPhase::HoldPending, false) => {
            let held = latch
                .first_touch
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            latch.tapped_once = held >= TAP_THRESHOLD;
            latch.released_at = Some(now);
            latch.phase = ActionPhase::TapPending;
            Transition::None
        }
        (ActionPhase::Active, false) => {
            latch.phase = ActionPhase::Untriggered;
            latch.action_done = false;
            Transition::None
        }
        _ => Transition::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::binding::{BindingEffect, BindingLayer, ControlBinding};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher(Mutex<Vec<String>>);

    impl ProgramLauncher for RecordingLauncher {
        fn launch(&self, path: &str, _args: &str) -> Result<(), MappingError> {
            self.0.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    fn action(triggers: &[Control], kind: SpecialActionKind) -> SpecialAction {
        SpecialAction {
            name: "test".to_string(),
            triggers: triggers.to_vec(),
            untriggers: Vec::new(),
            kind,
            delay: Duration::ZERO,
        }
    }

    fn engine_with(actions: Vec<SpecialAction>, bindings: &BindingTable) -> SpecialActionEngine {
        SpecialActionEngine::new(actions.into(), bindings, Arc::new(LoggingLauncher))
    }

    fn pressed(controls: &[Control]) -> FieldMapping {
        let mut input = FieldMapping::default();
        for control in controls {
            input.press(*control);
        }
        input
    }

    struct Tick {
        output: FieldMapping,
        synth: SyntheticState,
        outcome: ActionOutcome,
    }

    fn tick(
        engine: &mut SpecialActionEngine,
        held: &[Control],
        now: Instant,
    ) -> Tick {
        let input = pressed(held);
        let mut output = input.clone();
        let mut synth = SyntheticState::new();
        let ctx = ActionInput {
            input: &input,
            battery: 50,
            calibrating: false,
        };
        let outcome = engine.process(ctx, &mut output, &mut synth, now);
        Tick {
            output,
            synth,
            outcome,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn plain_action_fires_once_per_press() {
        let launcher = Arc::new(RecordingLauncher::default());
        let bindings = BindingTable::default();
        let actions: Arc<[SpecialAction]> = vec![action(
            &[Control::L1, Control::R1],
            SpecialActionKind::Program {
                path: "notepad".to_string(),
                args: String::new(),
            },
        )]
        .into();
        let mut engine = SpecialActionEngine::new(actions, &bindings, launcher.clone());
        let t0 = Instant::now();

        tick(&mut engine, &[Control::L1], t0);
        for n in 1..5 {
            tick(&mut engine, &[Control::L1, Control::R1], t0 + ms(n * 10));
        }
        assert_eq!(launcher.0.lock().unwrap().len(), 1);

        tick(&mut engine, &[], t0 + ms(60));
        tick(&mut engine, &[Control::L1, Control::R1], t0 + ms(70));
        assert_eq!(launcher.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn delayed_action_requires_continuous_hold() {
        let bindings = {
            let mut table = BindingTable::default();
            table.set(
                Control::Options,
                ControlBinding {
                    normal: BindingLayer {
                        effect: BindingEffect::Remap(crate::mapping::binding::RemapTarget::Control(
                            Control::Share,
                        )),
                        extras: None,
                    },
                    ..Default::default()
                },
            );
            table
        };
        let mut delayed = action(
            &[Control::Options],
            SpecialActionKind::Profile {
                name: "racing".to_string(),
                auto_untrigger: true,
            },
        );
        delayed.delay = Duration::from_secs(1);
        let mut engine = engine_with(vec![delayed], &bindings);
        let t0 = Instant::now();

        tick(&mut engine, &[Control::Options], t0);
        let early = tick(&mut engine, &[Control::Options], t0 + ms(900));
        assert!(early.outcome.profile_switch.is_none());
        let fired = tick(&mut engine, &[Control::Options], t0 + ms(1000));
        assert_eq!(
            fired.outcome.profile_switch.map(|s| s.name),
            Some("racing".to_string())
        );
    }

    #[test]
    fn tap_on_unbound_trigger_falls_through_as_pulse() {
        let bindings = BindingTable::default();
        let mut engine = engine_with(
            vec![action(
                &[Control::PS],
                SpecialActionKind::Key {
                    code: KeyCode(0x41),
                    modifiers: KeyModifiers::default(),
                },
            )],
            &bindings,
        );
        let t0 = Instant::now();

        let held = tick(&mut engine, &[Control::PS], t0);
        assert!(!held.output.is_active(Control::PS));
        let released = tick(&mut engine, &[], t0 + ms(50));
        assert!(released.output.is_active(Control::PS));
        assert!(!released.synth.is_key_staged(KeyCode(0x41)));
        let later = tick(&mut engine, &[], t0 + ms(95));
        assert!(!later.output.is_active(Control::PS));
        assert_eq!(engine.phase(0), Some(ActionPhase::Idle));
    }

    #[test]
    fn sustained_hold_on_unbound_trigger_holds_key() {
        let bindings = BindingTable::default();
        let mut engine = engine_with(
            vec![action(
                &[Control::PS],
                SpecialActionKind::Key {
                    code: KeyCode(0x41),
                    modifiers: KeyModifiers::default(),
                },
            )],
            &bindings,
        );
        let t0 = Instant::now();

        tick(&mut engine, &[Control::PS], t0);
        let active = tick(&mut engine, &[Control::PS], t0 + ms(150));
        assert!(active.synth.is_key_staged(KeyCode(0x41)));
        assert!(!active.output.is_active(Control::PS));

        let released = tick(&mut engine, &[], t0 + ms(300));
        assert!(!released.synth.is_key_staged(KeyCode(0x41)));
        assert!(!released.output.is_active(Control::PS));
    }

    fn multi_macros() -> (Arc<[MacroStep]>, Arc<[MacroStep]>, Arc<[MacroStep]>) {
        (chord(&[0x41]), chord(&[0x42]), chord(&[0x43]))
    }

    fn multi_engine(bindings: &BindingTable) -> SpecialActionEngine {
        let (tap, hold, double_tap) = multi_macros();
        engine_with(
            vec![action(
                &[Control::Triangle],
                SpecialActionKind::MultiAction {
                    tap,
                    hold,
                    double_tap,
                },
            )],
            bindings,
        )
    }

    /// Runs a press of `hold_ms` and then idles, collecting staged key codes
    fn run_press(hold_ms: u64, idle_ms: u64) -> Vec<u16> {
        let bindings = BindingTable::default();
        let mut engine = multi_engine(&bindings);
        let t0 = Instant::now();
        let mut staged = Vec::new();

        let mut t = 0;
        while t <= hold_ms + idle_ms {
            let held: &[Control] = if t < hold_ms { &[Control::Triangle] } else { &[] };
            let result = tick(&mut engine, held, t0 + ms(t));
            for code in [0x41, 0x42, 0x43] {
                if result.synth.is_key_staged(KeyCode(code)) && !staged.contains(&code) {
                    staged.push(code);
                }
            }
            t += 5;
        }
        staged
    }

    #[test]
    fn quick_release_invokes_nothing() {
        assert!(run_press(60, 400).is_empty());
    }

    #[test]
    fn release_between_thresholds_plays_tap() {
        assert_eq!(run_press(250, 400), vec![0x41]);
    }

    #[test]
    fn long_hold_plays_hold_once() {
        assert_eq!(run_press(800, 400), vec![0x42]);
    }

    #[test]
    fn second_press_in_window_plays_double_tap() {
        let bindings = BindingTable::default();
        let mut engine = multi_engine(&bindings);
        let t0 = Instant::now();
        let mut staged = Vec::new();

        let script: &[(u64, bool)] = &[(0, true), (120, false), (200, true), (260, false)];
        for t in (0..=800).step_by(5) {
            let held = script
                .iter()
                .rev()
                .find(|(at, _)| *at <= t)
                .map(|(_, down)| *down)
                .unwrap_or(false);
            let controls: &[Control] = if held { &[Control::Triangle] } else { &[] };
            let result = tick(&mut engine, controls, t0 + ms(t));
            for code in [0x41, 0x42, 0x43] {
                if result.synth.is_key_staged(KeyCode(code)) && !staged.contains(&code) {
                    staged.push(code);
                }
            }
        }
        assert_eq!(staged, vec![0x43]);
    }

    #[test]
    fn battery_check_fades_toward_charge_color() {
        let bindings = BindingTable::default();
        let mut engine = engine_with(
            vec![action(
                &[Control::Share, Control::Options],
                SpecialActionKind::BatteryCheck {
                    low: Rgb::RED,
                    full: Rgb::GREEN,
                },
            )],
            &bindings,
        );
        let t0 = Instant::now();

        let mut last = None;
        for n in 0..30 {
            let result = tick(&mut engine, &[Control::Share, Control::Options], t0 + ms(n * 5));
            last = result.outcome.lightbar;
        }
        assert_eq!(last.map(|l| l.color), Some(Rgb::new(128, 128, 0)));

        let released = tick(&mut engine, &[], t0 + ms(200));
        assert_eq!(released.outcome.lightbar, None);
    }

    #[test]
    fn wheel_calibrate_begins_then_completes_after_debounce() {
        let bindings = BindingTable::default();
        let mut engine = engine_with(
            vec![action(&[Control::L3, Control::R3], SpecialActionKind::WheelCalibrate)],
            &bindings,
        );
        let both: &[Control] = &[Control::L3, Control::R3];
        let none: &[Control] = &[];
        let t0 = Instant::now();

        let run = |engine: &mut SpecialActionEngine, held: &[Control], at: Duration, calibrating: bool| {
            let input = pressed(held);
            let mut output = input.clone();
            let mut synth = SyntheticState::new();
            let ctx = ActionInput {
                input: &input,
                battery: 100,
                calibrating,
            };
            engine.process(ctx, &mut output, &mut synth, t0 + at).wheel_command
        };

        assert_eq!(run(&mut engine, both, ms(0), false), Some(WheelCommand::Begin));
        assert_eq!(run(&mut engine, none, ms(200), true), None);
        // inside the debounce window
        assert_eq!(run(&mut engine, both, ms(1000), true), None);
        assert_eq!(run(&mut engine, none, ms(1200), true), None);

        assert_eq!(run(&mut engine, both, ms(4000), true), None);
        assert_eq!(run(&mut engine, none, ms(4500), true), Some(WheelCommand::Complete));
    }

    #[test]
    fn reset_returns_latches_to_idle() {
        let bindings = BindingTable::default();
        let mut engine = multi_engine(&bindings);
        let t0 = Instant::now();
        tick(&mut engine, &[Control::Triangle], t0);
        assert_eq!(engine.phase(0), Some(ActionPhase::HoldPending));

        engine.reset();
        assert_eq!(engine.phase(0), Some(ActionPhase::Idle));
    }

    #[test]
    fn game_dvr_tap_is_win_g() {
        let SpecialActionKind::MultiAction { tap, .. } = SpecialActionKind::xbox_game_dvr() else {
            panic!("expected multi action");
        };
        assert_eq!(
            &tap[..],
            &[
                MacroStep::KeyDown(KeyCode(VK_LWIN)),
                MacroStep::KeyDown(KeyCode(VK_G)),
                MacroStep::KeyUp(KeyCode(VK_G)),
                MacroStep::KeyUp(KeyCode(VK_LWIN)),
            ]
        );
    }
}
