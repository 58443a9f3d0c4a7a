use crate::controller::{ControllerConfig, GamepadButton};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read input profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse input profile: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("input profile name must not be empty")]
    EmptyName,
    #[error("rule {index}: touch region must have positive width and height")]
    EmptyRegion { index: usize },
    #[error("rule {index}: {trigger} cannot drive {action}")]
    IncompatibleRule {
        index: usize,
        trigger: String,
        action: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn code(self) -> i32 {
        match self {
            MouseButton::Left => 0,
            MouseButton::Right => 1,
            MouseButton::Middle => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Tap,
    LongPress,
    Drag,
    Scroll,
}

impl std::fmt::Display for GestureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GestureKind::Tap => write!(f, "tap"),
            GestureKind::LongPress => write!(f, "long_press"),
            GestureKind::Drag => write!(f, "drag"),
            GestureKind::Scroll => write!(f, "scroll"),
        }
    }
}

/// A host input primitive a rule matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostTrigger {
    /// Rectangle in host view pixels, origin top-left.
    TouchRegion {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    Gesture {
        gesture: GestureKind,
    },
    /// An on-screen overlay control, identified by name.
    VirtualKey {
        name: String,
    },
    /// A physical keyboard key, by host key code.
    HostKey {
        code: u32,
    },
}

impl HostTrigger {
    pub fn contains(&self, px: f32, py: f32) -> bool {
        match *self {
            HostTrigger::TouchRegion {
                x,
                y,
                width,
                height,
            } => px >= x && px < x + width && py >= y && py < y + height,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            HostTrigger::TouchRegion { .. } => "touch_region".to_owned(),
            HostTrigger::Gesture { gesture } => format!("gesture '{gesture}'"),
            HostTrigger::VirtualKey { name } => format!("virtual_key '{name}'"),
            HostTrigger::HostKey { code } => format!("host_key {code}"),
        }
    }
}

/// The synthetic hosted-input primitive a rule produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntheticAction {
    /// Hosted key code (desktop windowing-library numbering).
    Key { code: i32 },
    MouseButton { button: MouseButton },
    GamepadButton { button: GamepadButton },
    /// Relative pointer motion, host pixels multiplied by `scale`.
    PointerDelta {
        #[serde(default = "default_scale")]
        scale: f32,
    },
    /// Absolute cursor motion with the left button held, for drags.
    Cursor,
    Scroll {
        #[serde(default = "default_scale")]
        scale: f32,
    },
}

impl SyntheticAction {
    fn describe(&self) -> &'static str {
        match self {
            SyntheticAction::Key { .. } => "key",
            SyntheticAction::MouseButton { .. } => "mouse_button",
            SyntheticAction::GamepadButton { .. } => "gamepad_button",
            SyntheticAction::PointerDelta { .. } => "pointer_delta",
            SyntheticAction::Cursor => "cursor",
            SyntheticAction::Scroll { .. } => "scroll",
        }
    }

    /// Actions with a press/release pair.
    pub fn is_digital(&self) -> bool {
        matches!(
            self,
            SyntheticAction::Key { .. }
                | SyntheticAction::MouseButton { .. }
                | SyntheticAction::GamepadButton { .. }
        )
    }
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRule {
    pub trigger: HostTrigger,
    pub action: SyntheticAction,
}

/// Ordered rules from host input primitives to synthetic hosted input.
///
/// Rules are evaluated in order and the first match wins. A loaded profile is
/// never mutated; hot-swapping replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputMappingProfile {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<MappingRule>,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Default for InputMappingProfile {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            rules: Vec::new(),
            controller: ControllerConfig::default(),
        }
    }
}

impl InputMappingProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if let HostTrigger::TouchRegion { width, height, .. } = rule.trigger {
                if width <= 0.0 || height <= 0.0 {
                    return Err(ProfileError::EmptyRegion { index });
                }
            }
            let compatible = match (&rule.trigger, &rule.action) {
                (HostTrigger::Gesture { gesture }, action) => match gesture {
                    GestureKind::Tap | GestureKind::LongPress => action.is_digital(),
                    GestureKind::Drag => matches!(
                        action,
                        SyntheticAction::Cursor | SyntheticAction::PointerDelta { .. }
                    ),
                    GestureKind::Scroll => matches!(
                        action,
                        SyntheticAction::Scroll { .. } | SyntheticAction::PointerDelta { .. }
                    ),
                },
                (_, action) => action.is_digital(),
            };
            if !compatible {
                return Err(ProfileError::IncompatibleRule {
                    index,
                    trigger: rule.trigger.describe(),
                    action: rule.action.describe().to_owned(),
                });
            }
        }
        Ok(())
    }

    /// First touch-region rule containing the point.
    pub fn region_at(&self, x: f32, y: f32) -> Option<&MappingRule> {
        self.rules.iter().find(|r| r.trigger.contains(x, y))
    }

    pub fn gesture_rule(&self, kind: GestureKind) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| matches!(r.trigger, HostTrigger::Gesture { gesture } if gesture == kind))
    }

    pub fn virtual_key_rule(&self, key: &str) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| matches!(&r.trigger, HostTrigger::VirtualKey { name } if name == key))
    }

    pub fn host_key_rule(&self, key: u32) -> Option<&MappingRule> {
        self.rules
            .iter()
            .find(|r| matches!(r.trigger, HostTrigger::HostKey { code } if code == key))
    }
}

pub fn parse_profile_str(input: &str) -> Result<InputMappingProfile, ProfileError> {
    let profile: InputMappingProfile = toml::from_str(input)?;
    profile.validate()?;
    Ok(profile)
}

pub fn parse_profile_file(path: impl AsRef<Path>) -> Result<InputMappingProfile, ProfileError> {
    let content = fs::read_to_string(path)?;
    parse_profile_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
name = "touch-default"

[[rules]]
trigger = { kind = "touch_region", x = 0.0, y = 0.0, width = 100.0, height = 100.0 }
action = { kind = "key", code = 256 }

[[rules]]
trigger = { kind = "touch_region", x = 50.0, y = 50.0, width = 100.0, height = 100.0 }
action = { kind = "key", code = 69 }

[[rules]]
trigger = { kind = "gesture", gesture = "drag" }
action = { kind = "pointer_delta", scale = 2.0 }

[[rules]]
trigger = { kind = "virtual_key", name = "inventory" }
action = { kind = "key", code = 73 }

[[rules]]
trigger = { kind = "gesture", gesture = "long_press" }
action = { kind = "mouse_button", button = "right" }

[controller]
axis_dead_zone = 0.1
"#;

    #[test]
    fn parses_profile() {
        let profile = parse_profile_str(PROFILE).unwrap();
        assert_eq!(profile.name, "touch-default");
        assert_eq!(profile.rules.len(), 5);
        assert!((profile.controller.axis_dead_zone - 0.1).abs() < f32::EPSILON);
        assert!(profile.controller.enabled);
    }

    #[test]
    fn first_matching_region_wins() {
        let profile = parse_profile_str(PROFILE).unwrap();
        let rule = profile.region_at(75.0, 75.0).unwrap();
        assert_eq!(rule.action, SyntheticAction::Key { code: 256 });
        let rule = profile.region_at(120.0, 120.0).unwrap();
        assert_eq!(rule.action, SyntheticAction::Key { code: 69 });
        assert!(profile.region_at(500.0, 500.0).is_none());
    }

    #[test]
    fn lookups_by_trigger() {
        let profile = parse_profile_str(PROFILE).unwrap();
        assert!(profile.gesture_rule(GestureKind::Drag).is_some());
        assert!(profile.gesture_rule(GestureKind::Tap).is_none());
        assert_eq!(
            profile.virtual_key_rule("inventory").unwrap().action,
            SyntheticAction::Key { code: 73 }
        );
        assert!(profile.host_key_rule(4).is_none());
    }

    #[test]
    fn render_scale_belongs_to_the_session() {
        let err = parse_profile_str("name = \"x\"\nrender_scale = 0.5\n").unwrap_err();
        assert!(matches!(err, ProfileError::ParseToml(_)));
    }

    #[test]
    fn rejects_empty_region() {
        let input = r#"
name = "x"
[[rules]]
trigger = { kind = "touch_region", x = 0.0, y = 0.0, width = 0.0, height = 10.0 }
action = { kind = "key", code = 1 }
"#;
        assert!(matches!(
            parse_profile_str(input),
            Err(ProfileError::EmptyRegion { index: 0 })
        ));
    }

    #[test]
    fn rejects_incompatible_rule() {
        let input = r#"
name = "x"
[[rules]]
trigger = { kind = "virtual_key", name = "look" }
action = { kind = "pointer_delta" }
"#;
        assert!(matches!(
            parse_profile_str(input),
            Err(ProfileError::IncompatibleRule { index: 0, .. })
        ));
    }

    #[test]
    fn default_profile_is_valid() {
        InputMappingProfile::default().validate().unwrap();
    }

    #[test]
    fn region_edges_are_half_open() {
        let trigger = HostTrigger::TouchRegion {
            x: 10.0,
            y: 10.0,
            width: 10.0,
            height: 10.0,
        };
        assert!(trigger.contains(10.0, 10.0));
        assert!(!trigger.contains(20.0, 15.0));
    }
}
