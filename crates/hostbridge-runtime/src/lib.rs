//! Hosted runtime execution and device bridges for hostbridge.
//!
//! This crate implements everything that runs alongside the hosted runtime: the
//! pluggable `RuntimeBackend` trait with process, in-process thread and mock
//! backends, native library checks against the host ABI, the graphics
//! translation shim with its render thread, the input bridge, the audio bridge,
//! the captured log tail, and the `Boundary` that is the hosted program's only
//! contact surface with the device.

pub mod audio;
pub mod backend;
pub mod boundary;
pub mod graphics;
pub mod input;
pub mod logtail;
pub mod mock;
pub mod prereq;
pub mod process;
pub mod thread;

pub use audio::{
    AudioBridge, AudioBuffer, AudioConfig, AudioDevice, AudioStats, AudioStream, DeviceFormat,
    ManualDevice, NullDevice, RenderCallback, SampleFormat, Samples, StreamFormat,
};
pub use backend::{
    select_backend, HostedContext, HostedProcess, LaunchSpec, RuntimeBackend, Termination,
};
pub use boundary::{Boundary, Bridges, LifecycleSignal};
pub use graphics::{
    Capability, DrawCommand, Frame, FrameSubmitter, GraphicsShim, GraphicsStats, HeadlessWindow,
    NativeCommand, NativeWindow, PixelFormat, PresentError, Primitive, RecordingWindow,
    ShimConfig, SurfaceProvider, WindowEvent, WindowInfo, WindowLog,
};
pub use input::{
    ControllerAxes, ControllerKey, HostEvent, InputBridge, InputConfig, InputReceiver,
    InputSource, InputStats, KeyAction, SyntheticEvent, TouchPhase, Translation,
};
pub use logtail::LogTail;
pub use mock::{MockBackend, MockScript};
pub use prereq::{check_bundle, format_problems, host_abi, HostAbi, LibraryProblem};

pub use process::ProcessBackend;
pub use thread::{HostedProgram, ThreadBackend};

use thiserror::Error;

/// A render scale clamped to (0, 1]. Anything unusable means full size.
pub(crate) fn effective_render_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale.min(1.0)
    } else {
        1.0
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("incompatible runtime: {0}")]
    Incompatible(String),
    #[error("failed to spawn hosted runtime: {0}")]
    SpawnFailed(String),
    #[error("hosted runtime is not running")]
    NotRunning,
    #[error("invalid input profile: {0}")]
    Profile(#[from] hostbridge_schema::ProfileError),
    #[error("invalid audio buffer: {0}")]
    InvalidAudio(String),
    #[error("bridge thread failed: {0}")]
    Bridge(String),
}
