//! External game-controller configuration: which hosted gamepad button or axis
//! each physical control drives, plus the stick dead zone and whether the
//! on-screen overlay controls stay active while a controller is in use.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

pub const DEFAULT_DEAD_ZONE: f32 = 0.2;
pub const MAX_DEAD_ZONE: f32 = 0.95;

#[derive(Debug, Error)]
pub enum ControllerConfigError {
    #[error("controller config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid controller config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Hosted gamepad buttons, numbered like the desktop windowing library the hosted game expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamepadButton {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    Back,
    Start,
    Guide,
    LeftThumb,
    RightThumb,
}

impl GamepadButton {
    pub fn code(self) -> i32 {
        match self {
            GamepadButton::A => 0,
            GamepadButton::B => 1,
            GamepadButton::X => 2,
            GamepadButton::Y => 3,
            GamepadButton::LeftBumper => 4,
            GamepadButton::RightBumper => 5,
            GamepadButton::Back => 6,
            GamepadButton::Start => 7,
            GamepadButton::Guide => 8,
            GamepadButton::LeftThumb => 9,
            GamepadButton::RightThumb => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamepadAxis {
    LeftX,
    LeftY,
    RightX,
    RightY,
    LeftTrigger,
    RightTrigger,
}

impl GamepadAxis {
    pub fn code(self) -> i32 {
        match self {
            GamepadAxis::LeftX => 0,
            GamepadAxis::LeftY => 1,
            GamepadAxis::RightX => 2,
            GamepadAxis::RightY => 3,
            GamepadAxis::LeftTrigger => 4,
            GamepadAxis::RightTrigger => 5,
        }
    }
}

/// What a physical button is bound to. Triggers are analog on the hosted side,
/// so binding a digital button to one produces a full-scale axis event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonBinding {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    Back,
    Start,
    Guide,
    LeftThumb,
    RightThumb,
    LeftTrigger,
    RightTrigger,
}

/// The hosted-side effect of a [`ButtonBinding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonOutput {
    Button(GamepadButton),
    Axis(GamepadAxis),
}

impl ButtonBinding {
    pub fn output(self) -> ButtonOutput {
        match self {
            ButtonBinding::A => ButtonOutput::Button(GamepadButton::A),
            ButtonBinding::B => ButtonOutput::Button(GamepadButton::B),
            ButtonBinding::X => ButtonOutput::Button(GamepadButton::X),
            ButtonBinding::Y => ButtonOutput::Button(GamepadButton::Y),
            ButtonBinding::LeftBumper => ButtonOutput::Button(GamepadButton::LeftBumper),
            ButtonBinding::RightBumper => ButtonOutput::Button(GamepadButton::RightBumper),
            ButtonBinding::Back => ButtonOutput::Button(GamepadButton::Back),
            ButtonBinding::Start => ButtonOutput::Button(GamepadButton::Start),
            ButtonBinding::Guide => ButtonOutput::Button(GamepadButton::Guide),
            ButtonBinding::LeftThumb => ButtonOutput::Button(GamepadButton::LeftThumb),
            ButtonBinding::RightThumb => ButtonOutput::Button(GamepadButton::RightThumb),
            ButtonBinding::LeftTrigger => ButtonOutput::Axis(GamepadAxis::LeftTrigger),
            ButtonBinding::RightTrigger => ButtonOutput::Axis(GamepadAxis::RightTrigger),
        }
    }

    /// Every binding a settings screen may offer for a button.
    pub fn options() -> &'static [ButtonBinding] {
        &[
            ButtonBinding::A,
            ButtonBinding::B,
            ButtonBinding::X,
            ButtonBinding::Y,
            ButtonBinding::LeftBumper,
            ButtonBinding::RightBumper,
            ButtonBinding::Back,
            ButtonBinding::Start,
            ButtonBinding::Guide,
            ButtonBinding::LeftThumb,
            ButtonBinding::RightThumb,
            ButtonBinding::LeftTrigger,
            ButtonBinding::RightTrigger,
        ]
    }
}

impl GamepadAxis {
    pub fn options() -> &'static [GamepadAxis] {
        &[
            GamepadAxis::LeftX,
            GamepadAxis::LeftY,
            GamepadAxis::RightX,
            GamepadAxis::RightY,
            GamepadAxis::LeftTrigger,
            GamepadAxis::RightTrigger,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonMap {
    pub a: ButtonBinding,
    pub b: ButtonBinding,
    pub x: ButtonBinding,
    pub y: ButtonBinding,
    pub left_bumper: ButtonBinding,
    pub right_bumper: ButtonBinding,
    pub back: ButtonBinding,
    pub start: ButtonBinding,
    pub left_thumb: ButtonBinding,
    pub right_thumb: ButtonBinding,
}

impl Default for ButtonMap {
    fn default() -> Self {
        Self {
            a: ButtonBinding::A,
            b: ButtonBinding::B,
            x: ButtonBinding::X,
            y: ButtonBinding::Y,
            left_bumper: ButtonBinding::LeftBumper,
            right_bumper: ButtonBinding::RightBumper,
            back: ButtonBinding::Back,
            start: ButtonBinding::Start,
            left_thumb: ButtonBinding::LeftThumb,
            right_thumb: ButtonBinding::RightThumb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisMap {
    pub left_x: GamepadAxis,
    pub left_y: GamepadAxis,
    pub right_x: GamepadAxis,
    pub right_y: GamepadAxis,
    pub left_trigger: GamepadAxis,
    pub right_trigger: GamepadAxis,
}

impl Default for AxisMap {
    fn default() -> Self {
        Self {
            left_x: GamepadAxis::LeftX,
            left_y: GamepadAxis::LeftY,
            right_x: GamepadAxis::RightX,
            right_y: GamepadAxis::RightY,
            left_trigger: GamepadAxis::LeftTrigger,
            right_trigger: GamepadAxis::RightTrigger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    /// When false the touch overlay (virtual keys and touch regions) is off.
    pub overlay_controls_enabled: bool,
    pub axis_dead_zone: f32,
    pub buttons: ButtonMap,
    pub axes: AxisMap,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overlay_controls_enabled: true,
            axis_dead_zone: DEFAULT_DEAD_ZONE,
            buttons: ButtonMap::default(),
            axes: AxisMap::default(),
        }
    }
}

impl ControllerConfig {
    /// Load from a JSON file. A missing file yields the defaults; the dead zone
    /// is always clamped into `[0, 0.95]`.
    pub fn load(path: &Path) -> Result<Self, ControllerConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.axis_dead_zone = clamp_dead_zone(config.axis_dead_zone);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ControllerConfigError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| ControllerConfigError::Io(e.error))?;
        Ok(())
    }

    pub fn reset_to_defaults(&mut self) {
        *self = Self::default();
    }

    /// The effective dead zone, clamped even if the field was set directly.
    pub fn dead_zone(&self) -> f32 {
        clamp_dead_zone(self.axis_dead_zone)
    }
}

fn clamp_dead_zone(value: f32) -> f32 {
    if value.is_nan() {
        return DEFAULT_DEAD_ZONE;
    }
    value.clamp(0.0, MAX_DEAD_ZONE)
}
