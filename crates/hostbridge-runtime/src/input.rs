//! Input/event bridge.
//!
//! Host input events are translated through the active `InputMappingProfile`
//! into the synthetic events the hosted program reads. Each host event becomes
//! one batch; batches are queued in the order they were translated, so
//! concurrent host producers still see their events delivered in the order the
//! bridge accepted them. The profile can be swapped at any time; the swap
//! applies from the next event on.
//!
//! A batch that does not fit the queue in time is dropped, except for what the
//! hosted program needs to stay consistent: releases of presses it already saw,
//! the joystick connected notice and the latest hat state. Those are owed and go
//! out ahead of the next batch.

use crate::{effective_render_scale, RuntimeError};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use hostbridge_schema::{
    ButtonBinding, ButtonOutput, ControllerConfig, GamepadAxis, GestureKind,
    InputMappingProfile, MouseButton, SessionConfig, SyntheticAction,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long delivery waits on a full queue before dropping a batch.
const DELIVERY_TIMEOUT: Duration = Duration::from_millis(100);
const ROOM_POLL: Duration = Duration::from_millis(1);

const DPAD_UP: u8 = 0x1;
const DPAD_RIGHT: u8 = 0x2;
const DPAD_DOWN: u8 = 0x4;
const DPAD_LEFT: u8 = 0x8;

/// The device class that produced a host event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Touchscreen,
    Keyboard,
    Mouse,
    Gamepad,
    Joystick,
    Dpad,
}

impl InputSource {
    pub fn is_controller(self) -> bool {
        matches!(
            self,
            InputSource::Gamepad | InputSource::Joystick | InputSource::Dpad
        )
    }
}

/// Physical keys of an external controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKey {
    A,
    B,
    X,
    Y,
    L1,
    R1,
    L2,
    R2,
    Select,
    Start,
    ThumbL,
    ThumbR,
    DpadUp,
    DpadRight,
    DpadDown,
    DpadLeft,
    Other(u32),
}

impl ControllerKey {
    fn dpad_bit(self) -> Option<u8> {
        match self {
            ControllerKey::DpadUp => Some(DPAD_UP),
            ControllerKey::DpadRight => Some(DPAD_RIGHT),
            ControllerKey::DpadDown => Some(DPAD_DOWN),
            ControllerKey::DpadLeft => Some(DPAD_LEFT),
            _ => None,
        }
    }

    fn binding(self, config: &ControllerConfig) -> Option<ButtonBinding> {
        let b = &config.buttons;
        match self {
            ControllerKey::A => Some(b.a),
            ControllerKey::B => Some(b.b),
            ControllerKey::X => Some(b.x),
            ControllerKey::Y => Some(b.y),
            ControllerKey::L1 => Some(b.left_bumper),
            ControllerKey::R1 => Some(b.right_bumper),
            ControllerKey::Select => Some(b.back),
            ControllerKey::Start => Some(b.start),
            ControllerKey::ThumbL => Some(b.left_thumb),
            ControllerKey::ThumbR => Some(b.right_thumb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Down,
    Up,
    /// Batched repeats; never translated.
    Multiple,
}

/// Raw axis values of one controller motion event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerAxes {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rz: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchPhase {
    Down,
    Move,
    Up,
    Cancel,
}

/// An input event as the host observed it. Coordinates are host view pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostEvent {
    Touch {
        pointer: u32,
        phase: TouchPhase,
        x: f32,
        y: f32,
    },
    Tap {
        x: f32,
        y: f32,
    },
    LongPress {
        x: f32,
        y: f32,
    },
    Drag {
        points: Vec<(f32, f32)>,
    },
    Scroll {
        dx: f32,
        dy: f32,
    },
    VirtualKey {
        name: String,
        pressed: bool,
    },
    Key {
        code: u32,
        pressed: bool,
    },
    ControllerKey {
        source: InputSource,
        key: ControllerKey,
        action: KeyAction,
        repeat: u32,
    },
    ControllerMotion {
        source: InputSource,
        axes: ControllerAxes,
    },
}

/// An event in the hosted program's input vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntheticEvent {
    Key { code: i32, pressed: bool },
    MouseButton { button: MouseButton, pressed: bool },
    CursorPos { x: f32, y: f32 },
    PointerDelta { dx: f32, dy: f32 },
    Scroll { dx: f32, dy: f32 },
    JoystickConnected,
    JoystickButton { button: i32, pressed: bool },
    JoystickAxis { axis: i32, value: f32 },
    JoystickHat { hat: i32, state: u8 },
}

/// Result of translating one host event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    pub events: Vec<SyntheticEvent>,
    /// `false` means the host should handle the event itself.
    pub consumed: bool,
}

impl Translation {
    fn consumed(events: Vec<SyntheticEvent>) -> Self {
        Self {
            events,
            consumed: true,
        }
    }

    fn pass_through() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub translated: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Pointer and controller state carried between events.
#[derive(Debug, Default)]
struct TranslatorState {
    /// Pointer currently driving the hosted cursor.
    cursor_pointer: Option<u32>,
    /// Pointers pressed inside a mapped touch region, with the action they pressed.
    region_presses: HashMap<u32, SyntheticAction>,
    dpad: u8,
    joystick_connected: bool,
}

impl TranslatorState {
    fn translate(
        &mut self,
        profile: &InputMappingProfile,
        scale: f32,
        event: &HostEvent,
    ) -> Translation {
        match event {
            HostEvent::Touch {
                pointer,
                phase,
                x,
                y,
            } => self.touch(profile, scale, *pointer, *phase, *x, *y),
            HostEvent::Tap { x, y } => {
                let mut out = Vec::new();
                match profile.gesture_rule(GestureKind::Tap) {
                    Some(rule) => {
                        self.digital(&rule.action, true, &mut out);
                        self.digital(&rule.action, false, &mut out);
                    }
                    None => {
                        out.push(cursor(*x, *y, scale));
                        out.push(left(true));
                        out.push(left(false));
                    }
                }
                Translation::consumed(out)
            }
            HostEvent::LongPress { .. } => match profile.gesture_rule(GestureKind::LongPress) {
                Some(rule) => {
                    let mut out = Vec::new();
                    self.digital(&rule.action, true, &mut out);
                    self.digital(&rule.action, false, &mut out);
                    Translation::consumed(out)
                }
                None => Translation::pass_through(),
            },
            HostEvent::Drag { points } => {
                let action = profile
                    .gesture_rule(GestureKind::Drag)
                    .map_or(&SyntheticAction::Cursor, |r| &r.action);
                Translation::consumed(drag(points, action, scale))
            }
            HostEvent::Scroll { dx, dy } => {
                let event = match profile.gesture_rule(GestureKind::Scroll).map(|r| &r.action) {
                    Some(SyntheticAction::PointerDelta { scale }) => SyntheticEvent::PointerDelta {
                        dx: dx * scale,
                        dy: dy * scale,
                    },
                    Some(SyntheticAction::Scroll { scale }) => SyntheticEvent::Scroll {
                        dx: dx * scale,
                        dy: dy * scale,
                    },
                    _ => SyntheticEvent::Scroll { dx: *dx, dy: *dy },
                };
                Translation::consumed(vec![event])
            }
            HostEvent::VirtualKey { .. } if !profile.controller.overlay_controls_enabled => {
                trace!("overlay controls are off");
                Translation::pass_through()
            }
            HostEvent::VirtualKey { name, pressed } => match profile.virtual_key_rule(name) {
                Some(rule) => {
                    let mut out = Vec::new();
                    self.digital(&rule.action, *pressed, &mut out);
                    Translation::consumed(out)
                }
                None => {
                    debug!("virtual key '{name}' has no mapping");
                    Translation::pass_through()
                }
            },
            HostEvent::Key { code, pressed } => match profile.host_key_rule(*code) {
                Some(rule) => {
                    let mut out = Vec::new();
                    self.digital(&rule.action, *pressed, &mut out);
                    Translation::consumed(out)
                }
                None => Translation::pass_through(),
            },
            HostEvent::ControllerKey {
                source,
                key,
                action,
                repeat,
            } => self.controller_key(&profile.controller, *source, *key, *action, *repeat),
            HostEvent::ControllerMotion { source, axes } => {
                self.controller_motion(&profile.controller, *source, axes)
            }
        }
    }

    fn touch(
        &mut self,
        profile: &InputMappingProfile,
        scale: f32,
        pointer: u32,
        phase: TouchPhase,
        x: f32,
        y: f32,
    ) -> Translation {
        let mut out = Vec::new();
        match phase {
            TouchPhase::Down => {
                let region = if profile.controller.overlay_controls_enabled {
                    profile.region_at(x, y)
                } else {
                    None
                };
                if let Some(rule) = region {
                    let action = rule.action.clone();
                    self.digital(&action, true, &mut out);
                    self.region_presses.insert(pointer, action);
                } else if self.cursor_pointer.is_none() {
                    self.cursor_pointer = Some(pointer);
                    out.push(cursor(x, y, scale));
                    out.push(left(true));
                } else {
                    trace!("ignoring extra pointer {pointer}");
                }
            }
            TouchPhase::Move => {
                if self.cursor_pointer == Some(pointer) {
                    out.push(cursor(x, y, scale));
                }
            }
            TouchPhase::Up | TouchPhase::Cancel => {
                if let Some(action) = self.region_presses.remove(&pointer) {
                    self.digital(&action, false, &mut out);
                } else if self.cursor_pointer == Some(pointer) {
                    self.cursor_pointer = None;
                    out.push(left(false));
                }
            }
        }
        Translation::consumed(out)
    }

    fn digital(&mut self, action: &SyntheticAction, pressed: bool, out: &mut Vec<SyntheticEvent>) {
        match action {
            SyntheticAction::Key { code } => out.push(SyntheticEvent::Key {
                code: *code,
                pressed,
            }),
            SyntheticAction::MouseButton { button } => out.push(SyntheticEvent::MouseButton {
                button: *button,
                pressed,
            }),
            SyntheticAction::GamepadButton { button } => {
                self.ensure_joystick(out);
                out.push(SyntheticEvent::JoystickButton {
                    button: button.code(),
                    pressed,
                });
            }
            // Rejected by profile validation for digital triggers.
            SyntheticAction::PointerDelta { .. }
            | SyntheticAction::Cursor
            | SyntheticAction::Scroll { .. } => {}
        }
    }

    fn ensure_joystick(&mut self, out: &mut Vec<SyntheticEvent>) {
        if !self.joystick_connected {
            self.joystick_connected = true;
            out.push(SyntheticEvent::JoystickConnected);
        }
    }

    fn controller_key(
        &mut self,
        config: &ControllerConfig,
        source: InputSource,
        key: ControllerKey,
        action: KeyAction,
        repeat: u32,
    ) -> Translation {
        if !source.is_controller() || !config.enabled {
            return Translation::pass_through();
        }
        let pressed = match action {
            KeyAction::Down => true,
            KeyAction::Up => false,
            KeyAction::Multiple => return Translation::pass_through(),
        };
        if pressed && repeat > 0 {
            return Translation::consumed(Vec::new());
        }

        let mut out = Vec::new();
        self.ensure_joystick(&mut out);

        if let Some(bit) = key.dpad_bit() {
            if pressed {
                self.dpad |= bit;
            } else {
                self.dpad &= !bit;
            }
            out.push(SyntheticEvent::JoystickHat {
                hat: 0,
                state: self.dpad,
            });
            return Translation::consumed(out);
        }

        if let Some(binding) = key.binding(config) {
            out.push(match binding.output() {
                ButtonOutput::Button(button) => SyntheticEvent::JoystickButton {
                    button: button.code(),
                    pressed,
                },
                ButtonOutput::Axis(axis) => full_scale(axis, pressed),
            });
            return Translation::consumed(out);
        }

        match key {
            ControllerKey::L2 => out.push(full_scale(config.axes.left_trigger, pressed)),
            ControllerKey::R2 => out.push(full_scale(config.axes.right_trigger, pressed)),
            _ => {
                // The connected notice still goes out for an unmapped key.
                return Translation {
                    events: out,
                    consumed: false,
                };
            }
        }
        Translation::consumed(out)
    }

    fn controller_motion(
        &mut self,
        config: &ControllerConfig,
        source: InputSource,
        axes: &ControllerAxes,
    ) -> Translation {
        if !source.is_controller() || !config.enabled {
            return Translation::pass_through();
        }
        let dead_zone = config.dead_zone();
        let dz = |v: f32| if v.abs() < dead_zone { 0.0 } else { v };
        let map = &config.axes;

        let mut out = Vec::with_capacity(7);
        self.ensure_joystick(&mut out);
        for (axis, value) in [
            (map.left_x, dz(axes.x)),
            (map.left_y, dz(axes.y)),
            (map.right_x, dz(axes.z)),
            (map.right_y, dz(axes.rz)),
            (map.left_trigger, dz(axes.left_trigger.max(0.0))),
            (map.right_trigger, dz(axes.right_trigger.max(0.0))),
        ] {
            out.push(SyntheticEvent::JoystickAxis {
                axis: axis.code(),
                value,
            });
        }
        Translation::consumed(out)
    }
}

fn cursor(x: f32, y: f32, scale: f32) -> SyntheticEvent {
    SyntheticEvent::CursorPos {
        x: x * scale,
        y: y * scale,
    }
}

fn left(pressed: bool) -> SyntheticEvent {
    SyntheticEvent::MouseButton {
        button: MouseButton::Left,
        pressed,
    }
}

fn full_scale(axis: GamepadAxis, pressed: bool) -> SyntheticEvent {
    SyntheticEvent::JoystickAxis {
        axis: axis.code(),
        value: if pressed { 1.0 } else { 0.0 },
    }
}

/// A drag is one press, a move per sampled point and one release.
fn drag(points: &[(f32, f32)], action: &SyntheticAction, render_scale: f32) -> Vec<SyntheticEvent> {
    let Some(&(x0, y0)) = points.first() else {
        return Vec::new();
    };
    match action {
        SyntheticAction::PointerDelta { scale } => points
            .windows(2)
            .map(|w| SyntheticEvent::PointerDelta {
                dx: (w[1].0 - w[0].0) * scale,
                dy: (w[1].1 - w[0].1) * scale,
            })
            .collect(),
        _ => {
            let mut out = Vec::with_capacity(points.len() + 2);
            out.push(cursor(x0, y0, render_scale));
            out.push(left(true));
            for &(x, y) in &points[1..] {
                out.push(cursor(x, y, render_scale));
            }
            out.push(left(false));
            out
        }
    }
}

/// Hosted-side end of the synthetic event queue.
#[derive(Clone)]
pub struct InputReceiver {
    rx: Receiver<SyntheticEvent>,
}

impl InputReceiver {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SyntheticEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<SyntheticEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now, in delivery order.
    pub fn drain(&self) -> Vec<SyntheticEvent> {
        self.rx.try_iter().collect()
    }
}

#[derive(Default)]
struct Counters {
    translated: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputConfig {
    /// Host view pixels are multiplied by this before reaching the hosted
    /// cursor. Clamped to (0, 1], like the drawable scale.
    pub render_scale: f32,
    pub queue_capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            render_scale: 1.0,
            queue_capacity: 1024,
        }
    }
}

impl InputConfig {
    /// The session's render scale drives both the drawable and the cursor.
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            render_scale: config.render_scale,
            queue_capacity: config.input_queue_capacity,
        }
    }
}

/// Something the hosted program sees go down and expects to see come back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Held {
    Key(i32),
    Mouse(MouseButton),
    Joystick(i32),
}

impl Held {
    fn of(event: &SyntheticEvent) -> Option<(Held, bool)> {
        match *event {
            SyntheticEvent::Key { code, pressed } => Some((Held::Key(code), pressed)),
            SyntheticEvent::MouseButton { button, pressed } => {
                Some((Held::Mouse(button), pressed))
            }
            SyntheticEvent::JoystickButton { button, pressed } => {
                Some((Held::Joystick(button), pressed))
            }
            _ => None,
        }
    }
}

/// Events kept back from dropped batches, sent ahead of the next one.
#[derive(Debug, Default)]
struct Delivery {
    owed: Vec<SyntheticEvent>,
}

impl Delivery {
    /// Discard `events`, keeping what must still reach the hosted program.
    /// Returns how many were discarded.
    fn shed(&mut self, events: Vec<SyntheticEvent>) -> u64 {
        let mut pressed_here = HashSet::new();
        let mut hat = None;
        let mut dropped = 0;
        for event in events {
            match Held::of(&event) {
                Some((held, true)) => {
                    pressed_here.insert(held);
                    dropped += 1;
                }
                // The press went out earlier, so the release must too.
                Some((held, false)) if !pressed_here.remove(&held) => self.owed.push(event),
                Some(_) => dropped += 1,
                None => match event {
                    SyntheticEvent::JoystickConnected => self.owed.push(event),
                    SyntheticEvent::JoystickHat { .. } => {
                        if hat.replace(event).is_some() {
                            dropped += 1;
                        }
                    }
                    _ => dropped += 1,
                },
            }
        }
        self.owed.extend(hat);
        dropped
    }
}

pub struct InputBridge {
    profile: RwLock<Arc<InputMappingProfile>>,
    render_scale: f32,
    capacity: usize,
    state: Mutex<TranslatorState>,
    /// Locked after `state`, before `state` is released.
    delivery: Mutex<Delivery>,
    tx: Sender<SyntheticEvent>,
    counters: Counters,
}

impl InputBridge {
    /// Create a bridge and the receiver the hosted side reads from.
    pub fn new(
        profile: InputMappingProfile,
        config: InputConfig,
    ) -> Result<(Self, InputReceiver), RuntimeError> {
        profile.validate()?;
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let bridge = Self {
            profile: RwLock::new(Arc::new(profile)),
            render_scale: effective_render_scale(config.render_scale),
            capacity,
            state: Mutex::new(TranslatorState::default()),
            delivery: Mutex::new(Delivery::default()),
            tx,
            counters: Counters::default(),
        };
        Ok((bridge, InputReceiver { rx }))
    }

    pub fn profile(&self) -> Arc<InputMappingProfile> {
        let guard = self.profile.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn render_scale(&self) -> f32 {
        self.render_scale
    }

    pub fn overlay_enabled(&self) -> bool {
        self.profile().controller.overlay_controls_enabled
    }

    /// Turn the touch overlay on or off for the rest of the session. Presses
    /// already bound to a touch region still release normally.
    pub fn set_overlay_enabled(&self, enabled: bool) {
        let mut guard = self.profile.write().unwrap_or_else(PoisonError::into_inner);
        if guard.controller.overlay_controls_enabled != enabled {
            let mut next = InputMappingProfile::clone(&guard);
            next.controller.overlay_controls_enabled = enabled;
            *guard = Arc::new(next);
            debug!("overlay controls {}", if enabled { "on" } else { "off" });
        }
    }

    /// Replace the active profile. Applies from the next host event; a
    /// translation already running finishes with the profile it started with.
    /// The render scale stays the session's.
    pub fn swap_profile(&self, profile: InputMappingProfile) -> Result<(), RuntimeError> {
        profile.validate()?;
        let name = profile.name.clone();
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(profile);
        debug!("input profile swapped to '{name}'");
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, TranslatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate without delivering. Pointer and controller state still advance.
    pub fn translate(&self, event: &HostEvent) -> Translation {
        let mut state = self.state();
        let profile = self.profile();
        let translation = state.translate(&profile, self.render_scale, event);
        self.counters.translated.fetch_add(1, Ordering::Relaxed);
        translation
    }

    /// Translate and deliver in order. Returns the number of events delivered,
    /// owed events from earlier batches included.
    pub fn push_input_event(&self, event: &HostEvent) -> usize {
        let (translation, mut delivery) = {
            let mut state = self.state();
            let profile = self.profile();
            let translation = state.translate(&profile, self.render_scale, event);
            self.counters.translated.fetch_add(1, Ordering::Relaxed);
            (translation, self.delivery())
        };

        let mut batch = std::mem::take(&mut delivery.owed);
        batch.extend(translation.events);
        if batch.is_empty() {
            return 0;
        }
        let delivered = self.deliver(batch, &mut delivery);
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Send a batch once the queue has room for it. Only the holder of the
    /// delivery lock sends, so room never shrinks while waiting.
    fn deliver(&self, batch: Vec<SyntheticEvent>, delivery: &mut Delivery) -> usize {
        let deadline = Instant::now() + DELIVERY_TIMEOUT;
        let needed = batch.len().min(self.capacity);
        while self.capacity.saturating_sub(self.tx.len()) < needed {
            if Instant::now() >= deadline {
                warn!("input queue full, dropping a batch of {}", batch.len());
                let dropped = delivery.shed(batch);
                self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
                return 0;
            }
            std::thread::sleep(ROOM_POLL);
        }

        let mut delivered = 0;
        let mut unsent = Vec::new();
        let mut disconnected = false;
        let mut events = batch.into_iter();
        for event in events.by_ref() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.tx.send_timeout(event, remaining) {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(event)) => {
                    unsent.push(event);
                    break;
                }
                Err(SendTimeoutError::Disconnected(event)) => {
                    unsent.push(event);
                    disconnected = true;
                    break;
                }
            }
        }
        unsent.extend(events);

        if disconnected {
            // Nobody is reading any more, so nothing is owed.
            self.counters
                .dropped
                .fetch_add(unsent.len() as u64, Ordering::Relaxed);
        } else if !unsent.is_empty() {
            warn!("input queue full, dropping {} of a batch", unsent.len());
            let dropped = delivery.shed(unsent);
            self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        delivered
    }

    pub fn stats(&self) -> InputStats {
        InputStats {
            translated: self.counters.translated.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
