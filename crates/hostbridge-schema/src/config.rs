use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read session config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse session config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid session config: {0}")]
    Invalid(String),
}

/// Which native graphics API the shim translates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    #[default]
    Gles,
    Vulkan,
}

impl std::fmt::Display for GraphicsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphicsBackend::Gles => write!(f, "gles"),
            GraphicsBackend::Vulkan => write!(f, "vulkan"),
        }
    }
}

/// Per-session settings supplied by the embedding application (`hostbridge.toml`).
///
/// Immutable for the lifetime of a hosted session; only the input profile may be
/// swapped while the runtime is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub store_root: PathBuf,
    pub graphics_backend: GraphicsBackend,
    pub render_scale: f32,
    pub input_profile: Option<PathBuf>,
    pub controller_config: Option<PathBuf>,
    pub fetch_config: Option<PathBuf>,
    pub audio_queue_buffers: usize,
    pub crash_log_lines: usize,
    pub termination_grace_ms: u64,
    pub frame_queue_depth: usize,
    pub input_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("hostbridge-store"),
            graphics_backend: GraphicsBackend::Gles,
            render_scale: 1.0,
            input_profile: None,
            controller_config: None,
            fetch_config: None,
            audio_queue_buffers: 8,
            crash_log_lines: 200,
            termination_grace_ms: 3000,
            frame_queue_depth: 2,
            input_queue_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. Relative paths inside the file resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.store_root);
        for p in [
            &mut self.input_profile,
            &mut self.controller_config,
            &mut self.fetch_config,
        ]
        .into_iter()
        .flatten()
        {
            fix(p);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.render_scale > 0.0 && self.render_scale <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "render_scale must be in (0, 1], got {}",
                self.render_scale
            )));
        }
        if self.audio_queue_buffers == 0 {
            return Err(ConfigError::Invalid(
                "audio_queue_buffers must be at least 1".to_owned(),
            ));
        }
        if self.frame_queue_depth == 0 || self.input_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "frame_queue_depth and input_queue_capacity must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn termination_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.termination_grace_ms)
    }
}
