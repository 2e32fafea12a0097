//! Synthetic keyboard/mouse state and the cross-device committer
//!
//! Each device stages counts for the current tick into its own
//! [`SyntheticState`]. The [`SyntheticStateCommitter`] folds the per-device
//! deltas into one process-wide state under a single short-held lock and emits
//! OS events only on edges of the aggregated counts.
//!
//! ```text
//! device 0 ─┐  (current − previous)
//! device 1 ─┼──────────────► GlobalSyntheticState ──► edges ──► InputSink
//! device 2 ─┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Re-fire cadence of a held mouse wheel channel
pub const WHEEL_REPEAT_INTERVAL: Duration = Duration::from_millis(100);
/// Hold time before a key starts repeating
pub const KEY_REPEAT_DELAY: Duration = Duration::from_millis(500);
/// Interval between repeats once a key is repeating
pub const KEY_REPEAT_INTERVAL: Duration = Duration::from_millis(25);

const LOCK_ATTEMPTS: usize = 5;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MouseChannel {
    Left,
    Middle,
    Right,
    Fourth,
    Fifth,
    WheelUp,
    WheelDown,
    Toggle,
}

impl MouseChannel {
    pub const COUNT: usize = 8;

    pub const BUTTONS: [MouseChannel; 5] = [
        MouseChannel::Left,
        MouseChannel::Middle,
        MouseChannel::Right,
        MouseChannel::Fourth,
        MouseChannel::Fifth,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Windows-style virtual key code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyCode(pub u16);

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMode {
    VirtualKey,
    ScanCode,
}

impl KeyMode {
    pub fn from_scan_code(scan_code: bool) -> Self {
        if scan_code {
            Self::ScanCode
        } else {
            Self::VirtualKey
        }
    }
}

/// Event handed to the OS input collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    KeyDown { code: KeyCode, mode: KeyMode, repeat: bool },
    KeyUp { code: KeyCode, mode: KeyMode },
    MouseDown(MouseChannel),
    MouseUp(MouseChannel),
    /// Wheel notches, positive scrolls up
    MouseWheel(i32),
    MouseMove { dx: i32, dy: i32 },
}

/// OS input collaborator
pub trait InputSink: Send + Sync {
    fn emit(&self, event: OutputEvent);
}

/// Sink that only logs, used when no OS injection backend is wired up
#[derive(Debug, Default)]
pub struct TracingSink;

impl InputSink for TracingSink {
    fn emit(&self, event: OutputEvent) {
        debug!("Synthetic input: {:?}", event);
    }
}

/// Sink forwarding events over a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<OutputEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<OutputEvent>) -> Self {
        Self { sender }
    }
}

impl InputSink for ChannelSink {
    fn emit(&self, event: OutputEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping synthetic input event {:?}: {}", event, e);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    current: u32,
    previous: u32,
}

impl Counts {
    fn is_idle(&self) -> bool {
        self.current == 0 && self.previous == 0
    }

    fn rising(&self) -> bool {
        self.current != 0 && self.previous == 0
    }

    /// Adds another state's tick delta into this running count
    fn absorb(&mut self, delta: Counts) {
        let sum = self.current as i64 + delta.current as i64 - delta.previous as i64;
        self.current = sum.max(0) as u32;
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceKey {
    vk: Counts,
    scan: Counts,
    toggle: Counts,
    toggle_scan: bool,
    untoggle: bool,
}

impl DeviceKey {
    fn is_idle(&self) -> bool {
        self.vk.is_idle() && self.scan.is_idle() && self.toggle.is_idle() && !self.untoggle
    }
}

/// Per-device staged key and mouse counts
///
/// Only ever incremented during a tick. The committer computes the delta against
/// the previous tick, then rotates current into previous.
#[derive(Debug, Clone, Default)]
pub struct SyntheticState {
    mouse: [Counts; MouseChannel::COUNT],
    keys: BTreeMap<KeyCode, DeviceKey>,
    mouse_dx: i32,
    mouse_dy: i32,
}

impl SyntheticState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press_key(&mut self, code: KeyCode, mode: KeyMode) {
        let key = self.keys.entry(code).or_default();
        match mode {
            KeyMode::VirtualKey => key.vk.current += 1,
            KeyMode::ScanCode => key.scan.current += 1,
        }
    }

    /// Stages a toggle press; the global toggle flips on the rising edge
    pub fn press_toggle(&mut self, code: KeyCode, mode: KeyMode) {
        let key = self.keys.entry(code).or_default();
        key.toggle.current += 1;
        key.toggle_scan = mode == KeyMode::ScanCode;
    }

    /// Requests that a latched toggle key be released
    pub fn force_untoggle(&mut self, code: KeyCode) {
        self.keys.entry(code).or_default().untoggle = true;
    }

    pub fn press_mouse(&mut self, channel: MouseChannel) {
        self.mouse[channel.index()].current += 1;
    }

    pub fn move_mouse(&mut self, dx: i32, dy: i32) {
        self.mouse_dx = self.mouse_dx.saturating_add(dx);
        self.mouse_dy = self.mouse_dy.saturating_add(dy);
    }

    pub fn is_key_staged(&self, code: KeyCode) -> bool {
        self.keys
            .get(&code)
            .map(|key| key.vk.current > 0 || key.scan.current > 0 || key.toggle.current > 0)
            .unwrap_or(false)
    }

    pub fn is_mouse_staged(&self, channel: MouseChannel) -> bool {
        self.mouse[channel.index()].current > 0
    }

    /// Drops everything staged for the current tick, keeping previous counts
    pub fn discard_current(&mut self) {
        for counts in self.mouse.iter_mut() {
            counts.current = 0;
        }
        for key in self.keys.values_mut() {
            key.vk.current = 0;
            key.scan.current = 0;
            key.toggle.current = 0;
        }
        self.mouse_dx = 0;
        self.mouse_dy = 0;
    }

    fn rotate(&mut self) {
        for counts in self.mouse.iter_mut() {
            counts.previous = counts.current;
            counts.current = 0;
        }
        for key in self.keys.values_mut() {
            for counts in [&mut key.vk, &mut key.scan, &mut key.toggle] {
                counts.previous = counts.current;
                counts.current = 0;
            }
            key.untoggle = false;
        }
        self.keys.retain(|_, key| !key.is_idle());
        self.mouse_dx = 0;
        self.mouse_dy = 0;
    }
}

#[derive(Debug, Clone, Default)]
struct GlobalKey {
    vk: Counts,
    scan: Counts,
    toggle: Counts,
    toggled: bool,
    toggle_scan: bool,
    /// Mode the key is currently down in, as seen by the OS
    held: Option<KeyMode>,
    pressed_at: Option<Instant>,
    last_repeat: Option<Instant>,
}

impl GlobalKey {
    fn desired(&self) -> Option<KeyMode> {
        if self.scan.current > 0 {
            Some(KeyMode::ScanCode)
        } else if self.vk.current > 0 {
            Some(KeyMode::VirtualKey)
        } else if self.toggled {
            Some(KeyMode::from_scan_code(self.toggle_scan))
        } else {
            None
        }
    }

    fn held_by_counts(&self) -> bool {
        self.scan.current > 0 || self.vk.current > 0
    }

    fn is_idle(&self) -> bool {
        self.vk.current == 0
            && self.scan.current == 0
            && self.toggle.current == 0
            && self.held.is_none()
            && !self.toggled
    }
}

/// Process-wide aggregate of every device's synthetic state
#[derive(Debug, Default)]
pub struct GlobalSyntheticState {
    mouse: [Counts; MouseChannel::COUNT],
    mouse_held: [bool; MouseChannel::COUNT],
    mouse_toggle: bool,
    wheel_fired_at: [Option<Instant>; MouseChannel::COUNT],
    keys: BTreeMap<KeyCode, GlobalKey>,
}

impl GlobalSyntheticState {
    fn absorb(&mut self, device: &SyntheticState) {
        for (global, local) in self.mouse.iter_mut().zip(device.mouse.iter()) {
            global.absorb(*local);
        }
        for (code, local) in &device.keys {
            let global = self.keys.entry(*code).or_default();
            global.vk.absorb(local.vk);
            global.scan.absorb(local.scan);
            global.toggle.absorb(local.toggle);
            if local.toggle.current > 0 {
                global.toggle_scan = local.toggle_scan;
            }
            if local.untoggle {
                global.toggled = false;
            }
        }
    }

    fn emit_mouse(&mut self, now: Instant, sink: &dyn InputSink) {
        if self.mouse[MouseChannel::Toggle.index()].rising() {
            self.mouse_toggle = !self.mouse_toggle;
            debug!("Mouse toggle {}", if self.mouse_toggle { "on" } else { "off" });
        }

        for channel in MouseChannel::BUTTONS {
            let i = channel.index();
            let desired = self.mouse[i].current != 0 || (self.mouse_toggle && self.mouse_held[i]);
            if desired != self.mouse_held[i] {
                self.mouse_held[i] = desired;
                sink.emit(if desired {
                    OutputEvent::MouseDown(channel)
                } else {
                    OutputEvent::MouseUp(channel)
                });
            }
        }

        for (channel, notches) in [(MouseChannel::WheelUp, 1), (MouseChannel::WheelDown, -1)] {
            let i = channel.index();
            if self.mouse[i].current == 0 {
                self.wheel_fired_at[i] = None;
                continue;
            }
            let due = match self.wheel_fired_at[i] {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= WHEEL_REPEAT_INTERVAL,
            };
            if due {
                self.wheel_fired_at[i] = Some(now);
                sink.emit(OutputEvent::MouseWheel(notches));
            }
        }
    }

    fn emit_keys(&mut self, now: Instant, sink: &dyn InputSink) {
        for (code, key) in self.keys.iter_mut() {
            if key.toggle.rising() {
                key.toggled = !key.toggled;
            }

            let desired = key.desired();
            if desired != key.held {
                if let Some(mode) = key.held {
                    sink.emit(OutputEvent::KeyUp { code: *code, mode });
                }
                if let Some(mode) = desired {
                    sink.emit(OutputEvent::KeyDown {
                        code: *code,
                        mode,
                        repeat: false,
                    });
                    key.pressed_at = Some(now);
                } else {
                    key.pressed_at = None;
                }
                key.last_repeat = None;
                key.held = desired;
                continue;
            }

            let (Some(mode), Some(pressed_at)) = (key.held, key.pressed_at) else {
                continue;
            };
            let held_for = now.saturating_duration_since(pressed_at);
            if !key.held_by_counts() || held_for <= KEY_REPEAT_DELAY {
                continue;
            }
            let due = key
                .last_repeat
                .map_or(true, |at| now.saturating_duration_since(at) >= KEY_REPEAT_INTERVAL);
            if due {
                key.last_repeat = Some(now);
                sink.emit(OutputEvent::KeyDown {
                    code: *code,
                    mode,
                    repeat: true,
                });
            }
        }
    }

    fn rotate(&mut self) {
        for counts in self.mouse.iter_mut() {
            counts.previous = counts.current;
        }
        for key in self.keys.values_mut() {
            key.vk.previous = key.vk.current;
            key.scan.previous = key.scan.current;
            key.toggle.previous = key.toggle.current;
        }
        self.keys.retain(|_, key| !key.is_idle());
    }
}

/// The single cross-device synchronization point
pub struct SyntheticStateCommitter {
    global: RwLock<GlobalSyntheticState>,
    sink: Box<dyn InputSink>,
}

impl SyntheticStateCommitter {
    pub fn new(sink: Box<dyn InputSink>) -> Self {
        Self {
            global: RwLock::new(GlobalSyntheticState::default()),
            sink,
        }
    }

    fn acquire(&self) -> Option<RwLockWriteGuard<'_, GlobalSyntheticState>> {
        for attempt in 1..=LOCK_ATTEMPTS {
            match self.global.try_write() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(_)) => {
                    error!("Synthetic state lock poisoned");
                    return None;
                }
                Err(TryLockError::WouldBlock) => {
                    warn!(
                        "Synthetic state lock blocked (attempt {}/{})",
                        attempt, LOCK_ATTEMPTS
                    );
                    if attempt < LOCK_ATTEMPTS {
                        std::thread::sleep(LOCK_RETRY_DELAY);
                    }
                }
            }
        }
        None
    }

    /// Merges one device's staged tick into the global state and emits edges
    ///
    /// Returns false when the lock could not be taken; the device's staged counts
    /// are dropped but its previous counts are kept so the next delta is correct.
    pub fn commit(&self, device: &mut SyntheticState, now: Instant) -> bool {
        let Some(mut global) = self.acquire() else {
            warn!("Skipping synthetic state commit, lock unavailable");
            device.discard_current();
            return false;
        };

        global.absorb(device);
        global.emit_mouse(now, self.sink.as_ref());
        global.emit_keys(now, self.sink.as_ref());

        if device.mouse_dx != 0 || device.mouse_dy != 0 {
            self.sink.emit(OutputEvent::MouseMove {
                dx: device.mouse_dx,
                dy: device.mouse_dy,
            });
        }

        global.rotate();
        device.rotate();
        true
    }

    /// Keys currently held down at the OS level
    pub fn held_keys(&self) -> Vec<KeyCode> {
        match self.global.read() {
            Ok(global) => global
                .keys
                .iter()
                .filter(|(_, key)| key.held.is_some())
                .map(|(code, _)| *code)
                .collect(),
            Err(e) => {
                error!("Synthetic state lock poisoned: {}", e);
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for SyntheticStateCommitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticStateCommitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<OutputEvent>>>);

    impl Recorder {
        fn take(&self) -> Vec<OutputEvent> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl InputSink for Recorder {
        fn emit(&self, event: OutputEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn committer() -> (SyntheticStateCommitter, Recorder) {
        let recorder = Recorder::default();
        (
            SyntheticStateCommitter::new(Box::new(recorder.clone())),
            recorder,
        )
    }

    const A: KeyCode = KeyCode(0x41);

    #[test]
    fn held_key_emits_single_down_then_up() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.press_key(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0);
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyDown { code: A, mode: KeyMode::VirtualKey, repeat: false }]
        );

        device.press_key(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0 + Duration::from_millis(10));
        assert!(events.take().is_empty());

        committer.commit(&mut device, t0 + Duration::from_millis(20));
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyUp { code: A, mode: KeyMode::VirtualKey }]
        );
        assert!(committer.held_keys().is_empty());
    }

    #[test]
    fn key_repeat_starts_after_delay() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        let mut repeats = 0;
        for ms in (0..=600).step_by(5) {
            device.press_key(A, KeyMode::VirtualKey);
            committer.commit(&mut device, t0 + Duration::from_millis(ms));
            repeats += events
                .take()
                .iter()
                .filter(|e| matches!(e, OutputEvent::KeyDown { repeat: true, .. }))
                .count();
        }
        // repeats at 505, 530, 555, 580
        assert_eq!(repeats, 4);
    }

    #[test]
    fn no_repeat_at_exactly_the_delay() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.press_key(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0);
        events.take();
        device.press_key(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0 + KEY_REPEAT_DELAY);
        assert!(events.take().is_empty());
    }

    #[test]
    fn blocked_lock_skips_commit_and_keeps_previous_counts() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        {
            let _guard = committer.global.write().unwrap();
            device.press_key(A, KeyMode::VirtualKey);
            assert!(!committer.commit(&mut device, t0));
        }
        assert!(events.take().is_empty());

        device.press_key(A, KeyMode::VirtualKey);
        assert!(committer.commit(&mut device, t0 + Duration::from_millis(5)));
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyDown { code: A, mode: KeyMode::VirtualKey, repeat: false }]
        );
    }

    #[test]
    fn poisoned_lock_skips_commit() {
        let (committer, events) = committer();
        std::thread::scope(|scope| {
            let poisoner = scope.spawn(|| {
                let _guard = committer.global.write().unwrap();
                panic!("panic while holding the synthetic state");
            });
            assert!(poisoner.join().is_err());
        });
        assert!(committer.global.is_poisoned());

        let mut device = SyntheticState::new();
        device.press_key(A, KeyMode::VirtualKey);
        assert!(!committer.commit(&mut device, Instant::now()));
        assert!(events.take().is_empty());
    }

    #[test]
    fn mode_change_forces_release_and_press() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.press_key(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0);
        events.take();

        device.press_key(A, KeyMode::ScanCode);
        committer.commit(&mut device, t0 + Duration::from_millis(5));
        assert_eq!(
            events.take(),
            vec![
                OutputEvent::KeyUp { code: A, mode: KeyMode::VirtualKey },
                OutputEvent::KeyDown { code: A, mode: KeyMode::ScanCode, repeat: false },
            ]
        );
    }

    #[test]
    fn toggle_flips_on_rising_edge_only() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        for ms in 0..3 {
            device.press_toggle(A, KeyMode::VirtualKey);
            committer.commit(&mut device, t0 + Duration::from_millis(ms));
        }
        committer.commit(&mut device, t0 + Duration::from_millis(3));
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyDown { code: A, mode: KeyMode::VirtualKey, repeat: false }]
        );

        device.press_toggle(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0 + Duration::from_millis(4));
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyUp { code: A, mode: KeyMode::VirtualKey }]
        );
    }

    #[test]
    fn force_untoggle_releases_latched_key() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.press_toggle(A, KeyMode::VirtualKey);
        committer.commit(&mut device, t0);
        committer.commit(&mut device, t0 + Duration::from_millis(1));
        events.take();

        device.force_untoggle(A);
        committer.commit(&mut device, t0 + Duration::from_millis(2));
        assert_eq!(
            events.take(),
            vec![OutputEvent::KeyUp { code: A, mode: KeyMode::VirtualKey }]
        );
    }

    #[test]
    fn wheel_refires_while_held() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        let mut notches = 0;
        for ms in (0..=250).step_by(10) {
            device.press_mouse(MouseChannel::WheelDown);
            committer.commit(&mut device, t0 + Duration::from_millis(ms));
            notches += events
                .take()
                .iter()
                .filter(|e| matches!(e, OutputEvent::MouseWheel(-1)))
                .count();
        }
        // 0, 100, 200
        assert_eq!(notches, 3);
    }

    #[test]
    fn mouse_toggle_latches_buttons() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.press_mouse(MouseChannel::Toggle);
        device.press_mouse(MouseChannel::Left);
        committer.commit(&mut device, t0);
        assert_eq!(events.take(), vec![OutputEvent::MouseDown(MouseChannel::Left)]);

        committer.commit(&mut device, t0 + Duration::from_millis(10));
        assert!(events.take().is_empty());

        device.press_mouse(MouseChannel::Toggle);
        committer.commit(&mut device, t0 + Duration::from_millis(20));
        assert_eq!(events.take(), vec![OutputEvent::MouseUp(MouseChannel::Left)]);
    }

    #[test]
    fn mouse_motion_is_forwarded_once() {
        let (committer, events) = committer();
        let mut device = SyntheticState::new();
        let t0 = Instant::now();

        device.move_mouse(3, -2);
        device.move_mouse(1, 0);
        committer.commit(&mut device, t0);
        committer.commit(&mut device, t0 + Duration::from_millis(1));
        assert_eq!(events.take(), vec![OutputEvent::MouseMove { dx: 4, dy: -2 }]);
    }
}
