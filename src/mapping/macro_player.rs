//! Tick-driven macro playback
//!
//! A player keeps the index of the next pending step and the instant it may
//! fire. It is advanced once per report and re-stages the keys it holds into the
//! device's synthetic state every tick, so releasing simply means "stop staging".

use crate::mapping::binding::MacroStep;
use crate::mapping::controls::Control;
use crate::mapping::synthetic::{KeyCode, KeyMode, MouseChannel, SyntheticState};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroStatus {
    Playing,
    Finished,
}

#[derive(Debug, Clone)]
pub struct MacroPlayer {
    steps: Arc<[MacroStep]>,
    next: usize,
    next_fire_at: Instant,
    held_keys: Vec<KeyCode>,
    held_mouse: Vec<MouseChannel>,
    mode: KeyMode,
    repeat: bool,
    /// Control whose release cancels playback; None plays to completion
    bound: Option<Control>,
}

impl MacroPlayer {
    pub fn start(
        steps: Arc<[MacroStep]>,
        mode: KeyMode,
        repeat: bool,
        bound: Option<Control>,
        now: Instant,
    ) -> Self {
        Self {
            steps,
            next: 0,
            next_fire_at: now,
            held_keys: Vec::new(),
            held_mouse: Vec::new(),
            mode,
            repeat,
            bound,
        }
    }

    pub fn bound(&self) -> Option<Control> {
        self.bound
    }

    /// Runs every due step and stages whatever the macro currently holds
    ///
    /// A release step for a key pressed during this same call is deferred to the
    /// next tick so every press reaches at least one commit.
    pub fn advance(
        &mut self,
        now: Instant,
        still_held: bool,
        synth: &mut SyntheticState,
    ) -> MacroStatus {
        let mut pressed_keys: Vec<KeyCode> = Vec::new();
        let mut pressed_mouse: Vec<MouseChannel> = Vec::new();

        while self.next < self.steps.len() && now >= self.next_fire_at {
            match self.steps[self.next] {
                MacroStep::KeyDown(code) => {
                    if !self.held_keys.contains(&code) {
                        self.held_keys.push(code);
                    }
                    pressed_keys.push(code);
                }
                MacroStep::KeyUp(code) => {
                    if pressed_keys.contains(&code) {
                        break;
                    }
                    self.held_keys.retain(|k| *k != code);
                }
                MacroStep::MouseDown(channel) => {
                    if !self.held_mouse.contains(&channel) {
                        self.held_mouse.push(channel);
                    }
                    pressed_mouse.push(channel);
                }
                MacroStep::MouseUp(channel) => {
                    if pressed_mouse.contains(&channel) {
                        break;
                    }
                    self.held_mouse.retain(|c| *c != channel);
                }
                MacroStep::Wait(duration) => {
                    self.next_fire_at += duration;
                }
            }
            self.next += 1;
        }

        for code in &self.held_keys {
            synth.press_key(*code, self.mode);
        }
        for channel in &self.held_mouse {
            synth.press_mouse(*channel);
        }

        if self.next < self.steps.len() || !self.held_keys.is_empty() || !self.held_mouse.is_empty() {
            return MacroStatus::Playing;
        }

        if self.repeat && still_held {
            self.next = 0;
            self.next_fire_at = now;
            return MacroStatus::Playing;
        }

        MacroStatus::Finished
    }

    /// Stops playback; held keys are released by no longer being staged
    pub fn cancel(&mut self) {
        self.next = self.steps.len();
        self.held_keys.clear();
        self.held_mouse.clear();
        self.repeat = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::binding::parse_macro;
    use std::time::Duration;

    fn player(codes: &[i32], now: Instant) -> MacroPlayer {
        let steps: Arc<[MacroStep]> = parse_macro(codes).unwrap().into();
        MacroPlayer::start(steps, KeyMode::VirtualKey, false, None, now)
    }

    #[test]
    fn press_is_staged_before_release() {
        let t0 = Instant::now();
        let mut macro_player = player(&[65, 65], t0);
        let mut synth = SyntheticState::new();

        assert_eq!(macro_player.advance(t0, false, &mut synth), MacroStatus::Playing);
        assert!(synth.is_key_staged(KeyCode(65)));

        let mut synth = SyntheticState::new();
        assert_eq!(
            macro_player.advance(t0 + Duration::from_millis(1), false, &mut synth),
            MacroStatus::Finished
        );
        assert!(!synth.is_key_staged(KeyCode(65)));
    }

    #[test]
    fn waits_hold_the_key_until_due() {
        let t0 = Instant::now();
        let mut macro_player = player(&[65, 400, 65], t0);

        for ms in [0u64, 50, 99] {
            let mut synth = SyntheticState::new();
            macro_player.advance(t0 + Duration::from_millis(ms), false, &mut synth);
            assert!(synth.is_key_staged(KeyCode(65)), "ms = {}", ms);
        }

        let mut synth = SyntheticState::new();
        let status = macro_player.advance(t0 + Duration::from_millis(100), false, &mut synth);
        assert_eq!(status, MacroStatus::Finished);
        assert!(!synth.is_key_staged(KeyCode(65)));
    }

    #[test]
    fn cancel_releases_everything() {
        let t0 = Instant::now();
        let mut macro_player = player(&[65, 1000, 65], t0);
        let mut synth = SyntheticState::new();
        macro_player.advance(t0, false, &mut synth);

        macro_player.cancel();
        let mut synth = SyntheticState::new();
        let status = macro_player.advance(t0 + Duration::from_millis(5), false, &mut synth);
        assert_eq!(status, MacroStatus::Finished);
        assert!(!synth.is_key_staged(KeyCode(65)));
    }
}
