//! Declarative inputs of hostbridge.
//!
//! This crate defines what the embedding application hands to the core: the TOML
//! provisioning manifest (`ProvisioningManifest`), input mapping profiles
//! (`InputMappingProfile`), the external game-controller configuration
//! (`ControllerConfig`), per-session settings (`SessionConfig`), and the identifier,
//! version and checksum types shared by every other crate.

pub mod config;
pub mod controller;
pub mod manifest;
pub mod profile;
pub mod types;

pub use config::{ConfigError, GraphicsBackend, SessionConfig};
pub use controller::{
    AxisMap, ButtonBinding, ButtonMap, ButtonOutput, ControllerConfig, ControllerConfigError,
    GamepadAxis, GamepadButton, DEFAULT_DEAD_ZONE, MAX_DEAD_ZONE,
};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, ArchiveFormat, BundleSection, ManifestEntry,
    ManifestError, ProvisioningManifest,
};
pub use profile::{
    parse_profile_file, parse_profile_str, GestureKind, HostTrigger, InputMappingProfile,
    MappingRule, MouseButton, ProfileError, SyntheticAction,
};
pub use types::{validate_bundle_id, BundleId, Checksum, TreeDigest, Version};
