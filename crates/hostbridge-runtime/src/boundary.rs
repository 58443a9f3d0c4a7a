//! The hosted program's only contact surface with the device.
//!
//! Four primitives cross the boundary: submit a frame, push an input event,
//! push an audio buffer and report a lifecycle event. Each maps onto the bounded
//! channel or queue of its bridge, so no primitive waits on another bridge.

use crate::audio::{AudioBridge, AudioBuffer};
use crate::graphics::{Frame, FrameSubmitter, GraphicsShim};
use crate::input::{HostEvent, InputBridge, InputReceiver, SyntheticEvent};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle events the hosted program reports to its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleSignal {
    Ready,
    /// The hosted program wants to quit; its termination counts as a clean exit.
    ExitRequested,
    Message { text: String },
}

pub struct Boundary {
    frames: FrameSubmitter,
    input: Arc<InputBridge>,
    inbox: InputReceiver,
    audio: Arc<AudioBridge>,
    lifecycle: Sender<LifecycleSignal>,
}

impl Boundary {
    pub fn new(
        frames: FrameSubmitter,
        input: Arc<InputBridge>,
        inbox: InputReceiver,
        audio: Arc<AudioBridge>,
        lifecycle: Sender<LifecycleSignal>,
    ) -> Self {
        Self {
            frames,
            input,
            inbox,
            audio,
            lifecycle,
        }
    }

    /// Hand a frame to the render thread. Blocks only while the frame queue is full.
    pub fn submit_frame(&self, frame: Frame) -> bool {
        self.frames.submit(frame)
    }

    /// Generation new frames should be tagged with.
    pub fn surface_generation(&self) -> u64 {
        self.frames.generation()
    }

    /// Host side: translate and deliver one host input event. Returns the number of
    /// synthetic events delivered.
    pub fn push_input_event(&self, event: &HostEvent) -> usize {
        self.input.push_input_event(event)
    }

    /// Hosted side: the next synthetic input event, in host order.
    pub fn next_input(&self, timeout: Duration) -> Option<SyntheticEvent> {
        self.inbox.recv_timeout(timeout)
    }

    pub fn drain_input(&self) -> Vec<SyntheticEvent> {
        self.inbox.drain()
    }

    pub fn push_audio_buffer(&self, buffer: AudioBuffer) {
        self.audio.push_audio_buffer(buffer);
    }

    pub fn report_lifecycle_event(&self, signal: LifecycleSignal) {
        // The receiver is gone once the host stopped supervising.
        let _ = self.lifecycle.send(signal);
    }
}

/// The three bridges attached to one hosted runtime.
pub struct Bridges {
    pub graphics: GraphicsShim,
    pub input: Arc<InputBridge>,
    pub audio: Arc<AudioBridge>,
    inbox: InputReceiver,
}

impl Bridges {
    pub fn new(
        graphics: GraphicsShim,
        input: InputBridge,
        inbox: InputReceiver,
        audio: AudioBridge,
    ) -> Self {
        Self {
            graphics,
            input: Arc::new(input),
            audio: Arc::new(audio),
            inbox,
        }
    }

    pub fn boundary(&self, lifecycle: Sender<LifecycleSignal>) -> Boundary {
        Boundary::new(
            self.graphics.submitter(),
            Arc::clone(&self.input),
            self.inbox.clone(),
            Arc::clone(&self.audio),
            lifecycle,
        )
    }

    /// Stop the render thread and close the audio session.
    pub fn release(&mut self) {
        self.graphics.shutdown();
        self.audio.close();
    }
}
