//! Building the per-launch bridges from the session configuration.

use crate::CoreError;
use hostbridge_runtime::{
    AudioBridge, AudioConfig, AudioDevice, Bridges, GraphicsShim, InputBridge, InputConfig,
    NativeWindow, ShimConfig, SurfaceProvider,
};
use hostbridge_schema::{parse_profile_file, ControllerConfig, InputMappingProfile, SessionConfig};
use std::sync::Arc;
use tracing::debug;

/// The input profile named by `config`, with the external controller file applied.
///
/// Without an `input_profile` the default profile is used. A `controller_config`
/// file replaces the profile's own controller section.
pub fn load_input_profile(config: &SessionConfig) -> Result<InputMappingProfile, CoreError> {
    let mut profile = match config.input_profile {
        Some(ref path) => {
            debug!("loading input profile {}", path.display());
            parse_profile_file(path)?
        }
        None => InputMappingProfile::default(),
    };
    if let Some(ref path) = config.controller_config {
        debug!("loading controller config {}", path.display());
        profile.controller = ControllerConfig::load(path)?;
    }
    profile.validate()?;
    Ok(profile)
}

/// Start the graphics shim, input bridge and audio bridge for one launch.
///
/// `window` is attached as the first surface. Pass `None` to attach later, once
/// the host view exists.
pub fn bridges_for_session(
    config: &SessionConfig,
    profile: InputMappingProfile,
    window: Option<Box<dyn NativeWindow>>,
    provider: Option<Box<dyn SurfaceProvider>>,
    device: Arc<dyn AudioDevice>,
) -> Result<Bridges, CoreError> {
    let graphics = GraphicsShim::start(ShimConfig::from_session(config), provider)?;
    if let Some(window) = window {
        graphics.attach_surface(window);
    }
    let (input, inbox) = InputBridge::new(profile, InputConfig::from_session(config))?;
    let audio = AudioBridge::new(device, AudioConfig::from_session(config));
    Ok(Bridges::new(graphics, input, inbox, audio))
}
