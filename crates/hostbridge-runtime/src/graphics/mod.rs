//! Graphics translation shim.
//!
//! The hosted runtime submits frames of desktop-style draw calls tagged with the
//! surface generation they were recorded for. A dedicated render thread owns the
//! native window and the per-generation `SurfaceContext`, translates each frame
//! for the configured back end and blocks on present. The UI side only swaps
//! windows in and out; it never touches the render thread's state.
//!
//! The generation counter is the only state shared between the UI and render
//! threads. It is bumped before a new window is published, so the render thread
//! always sees the new generation no later than the new window. Frames tagged
//! with any generation other than the render thread's current one are dropped.
//!
//! A surface only counts as attached once the render thread has built a
//! `SurfaceContext` for the current generation.

pub mod translate;
pub mod window;

pub use translate::{translator_for, Translator};
pub use window::{HeadlessWindow, RecordingWindow, WindowEvent, WindowLog};

use crate::RuntimeError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hostbridge_schema::{GraphicsBackend, SessionConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Rgb565,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Failure of a native window call. Never leaves the shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentError {
    SurfaceLost,
    Device(String),
}

/// A device rendering surface.
pub trait NativeWindow: Send {
    fn info(&self) -> WindowInfo;

    fn set_buffers_geometry(&mut self, width: u32, height: u32) -> Result<(), PresentError>;

    fn execute(&mut self, commands: &[NativeCommand]) -> Result<(), PresentError>;

    /// Blocks until the frame is queued for display.
    fn present(&mut self) -> Result<(), PresentError>;
}

/// Supplies a replacement window after the current one was lost.
pub trait SurfaceProvider: Send {
    fn replacement(&mut self) -> Option<Box<dyn NativeWindow>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    DepthTest,
    CullFace,
    ScissorTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

/// Primitive modes a desktop graphics API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
    Quads,
    QuadStrip,
    Polygon,
}

/// A call issued by the hosted runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Viewport {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    ClearColor([f32; 4]),
    Clear {
        color: bool,
        depth: bool,
    },
    Enable(Capability),
    Disable(Capability),
    UseProgram(u32),
    BindTexture(u32),
    PolygonMode(PolygonMode),
    DrawArrays {
        mode: Primitive,
        first: u32,
        count: u32,
    },
    DrawElements {
        mode: Primitive,
        indices: Vec<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub program: u32,
    pub topology: Topology,
    pub blend: bool,
    pub depth_test: bool,
    pub cull_face: bool,
    pub scissor_test: bool,
}

/// A call into the device graphics API.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCommand {
    Viewport {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    ClearColor([f32; 4]),
    Clear {
        color: bool,
        depth: bool,
    },
    SetCapability {
        cap: Capability,
        enabled: bool,
    },
    UseProgram(u32),
    BindTexture(u32),
    Draw {
        topology: Topology,
        first: u32,
        count: u32,
    },
    DrawIndexed {
        topology: Topology,
        indices: Vec<u32>,
    },
    BeginRenderPass,
    EndRenderPass,
    BindPipeline(PipelineState),
}

/// One frame of hosted draw calls, ending in an implicit buffer swap.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub generation: u64,
    pub commands: Vec<DrawCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShimConfig {
    pub backend: GraphicsBackend,
    /// Clamped to (0, 1].
    pub render_scale: f32,
    pub frame_queue_depth: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            backend: GraphicsBackend::Gles,
            render_scale: 1.0,
            frame_queue_depth: 2,
        }
    }
}

impl ShimConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            backend: config.graphics_backend,
            render_scale: config.render_scale,
            frame_queue_depth: config.frame_queue_depth,
        }
    }

    fn scale(&self) -> f32 {
        crate::effective_render_scale(self.render_scale)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphicsStats {
    pub presented: u64,
    pub dropped_stale: u64,
    pub dropped_no_surface: u64,
    pub device_errors: u64,
    pub regenerations: u64,
}

#[derive(Default)]
struct Counters {
    presented: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_no_surface: AtomicU64,
    device_errors: AtomicU64,
    regenerations: AtomicU64,
}

/// Latest window handed over by the UI side, tagged with its generation.
struct Pending {
    generation: u64,
    window: Option<Box<dyn NativeWindow>>,
}

struct Shared {
    generation: AtomicU64,
    pending: Mutex<Pending>,
    /// Generation of the render thread's built context, 0 when there is none.
    ready: AtomicU64,
    stop: AtomicBool,
    counters: Counters,
}

enum RenderMsg {
    Frame(Frame),
    Flush(Sender<()>),
}

/// Hosted-side handle for submitting frames.
#[derive(Clone)]
pub struct FrameSubmitter {
    tx: Sender<RenderMsg>,
    shared: Arc<Shared>,
}

impl FrameSubmitter {
    /// Queue a frame. Blocks while the frame queue is full; returns `false` once
    /// the shim has shut down.
    pub fn submit(&self, frame: Frame) -> bool {
        self.tx.send(RenderMsg::Frame(frame)).is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }
}

pub struct GraphicsShim {
    shared: Arc<Shared>,
    tx: Sender<RenderMsg>,
    thread: Option<JoinHandle<()>>,
}

impl GraphicsShim {
    pub fn start(
        config: ShimConfig,
        provider: Option<Box<dyn SurfaceProvider>>,
    ) -> Result<Self, RuntimeError> {
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            pending: Mutex::new(Pending {
                generation: 0,
                window: None,
            }),
            ready: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let (tx, rx) = crossbeam_channel::bounded(config.frame_queue_depth.max(1));
        let render = RenderLoop {
            shared: Arc::clone(&shared),
            rx,
            provider,
            backend: config.backend,
            scale: config.scale(),
            context: None,
            context_generation: 0,
        };
        let thread = std::thread::Builder::new()
            .name("hostbridge-render".to_owned())
            .spawn(move || render.run())
            .map_err(|e| RuntimeError::Bridge(format!("render thread: {e}")))?;
        Ok(Self {
            shared,
            tx,
            thread: Some(thread),
        })
    }

    pub fn submitter(&self) -> FrameSubmitter {
        FrameSubmitter {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// UI side: a new native window exists (first creation, rotation, foreground).
    /// Returns the generation it is bound to.
    pub fn attach_surface(&self, window: Box<dyn NativeWindow>) -> u64 {
        let mut pending = lock_pending(&self.shared);
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        pending.generation = generation;
        pending.window = Some(window);
        debug!("surface attached at generation {generation}");
        generation
    }

    /// UI side: the native window is gone (backgrounded).
    pub fn detach_surface(&self) -> u64 {
        let mut pending = lock_pending(&self.shared);
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        pending.generation = generation;
        pending.window = None;
        debug!("surface detached at generation {generation}");
        generation
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Whether the render thread holds a usable context for the current generation.
    pub fn has_surface(&self) -> bool {
        let generation = self.shared.generation.load(Ordering::Acquire);
        generation != 0 && self.shared.ready.load(Ordering::Acquire) == generation
    }

    /// Let the render thread adopt the latest window, then report whether it
    /// produced a usable context.
    pub fn surface_ready(&self, timeout: Duration) -> bool {
        self.flush(timeout) && self.has_surface()
    }

    pub fn stats(&self) -> GraphicsStats {
        let c = &self.shared.counters;
        GraphicsStats {
            presented: c.presented.load(Ordering::Relaxed),
            dropped_stale: c.dropped_stale.load(Ordering::Relaxed),
            dropped_no_surface: c.dropped_no_surface.load(Ordering::Relaxed),
            device_errors: c.device_errors.load(Ordering::Relaxed),
            regenerations: c.regenerations.load(Ordering::Relaxed),
        }
    }

    /// Wait until every frame queued before this call has been handled.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self
            .tx
            .send_timeout(RenderMsg::Flush(ack_tx), timeout)
            .is_err()
        {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Stop the render thread and release the native window. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("render thread panicked");
            }
        }
        lock_pending(&self.shared).window = None;
        self.shared.ready.store(0, Ordering::Release);
    }
}

impl Drop for GraphicsShim {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_pending(shared: &Shared) -> std::sync::MutexGuard<'_, Pending> {
    // A panic while holding the slot leaves a consistent value behind.
    shared
        .pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The translated graphics context bound to one native window for one generation.
struct SurfaceContext {
    window: Box<dyn NativeWindow>,
    translator: Box<dyn Translator>,
}

impl SurfaceContext {
    fn build(
        mut window: Box<dyn NativeWindow>,
        generation: u64,
        backend: GraphicsBackend,
        scale: f32,
    ) -> Option<Self> {
        let info = window.info();
        if info.format != PixelFormat::Rgba8888 {
            warn!("using unsupported pixel format {:?}", info.format);
        }
        let width = ((info.width as f32 * scale) as u32).max(1);
        let height = ((info.height as f32 * scale) as u32).max(1);
        if let Err(e) = window.set_buffers_geometry(width, height) {
            warn!("generation {generation}: configuring {width}x{height} failed: {e:?}");
            return None;
        }
        info!("generation {generation}: {backend} context {width}x{height}");
        Some(Self {
            window,
            translator: translator_for(backend),
        })
    }
}

struct RenderLoop {
    shared: Arc<Shared>,
    rx: Receiver<RenderMsg>,
    provider: Option<Box<dyn SurfaceProvider>>,
    backend: GraphicsBackend,
    scale: f32,
    context: Option<SurfaceContext>,
    context_generation: u64,
}

impl RenderLoop {
    fn run(mut self) {
        while !self.shared.stop.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(RenderMsg::Frame(frame)) => self.render(frame),
                Ok(RenderMsg::Flush(ack)) => {
                    self.sync_surface();
                    let _ = ack.send(());
                }
                Err(RecvTimeoutError::Timeout) => self.sync_surface(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.context = None;
    }

    /// Adopt the UI side's latest window if the generation moved.
    fn sync_surface(&mut self) {
        if self.shared.generation.load(Ordering::Acquire) == self.context_generation {
            return;
        }
        let mut pending = lock_pending(&self.shared);
        if pending.generation == self.context_generation {
            return;
        }
        let generation = pending.generation;
        let window = pending.window.take();
        drop(pending);

        self.context = None;
        self.context_generation = generation;
        self.context =
            window.and_then(|w| SurfaceContext::build(w, generation, self.backend, self.scale));
        self.publish_ready();
    }

    fn publish_ready(&self) {
        let ready = if self.context.is_some() {
            self.context_generation
        } else {
            0
        };
        self.shared.ready.store(ready, Ordering::Release);
    }

    /// Present failed with a lost surface: move to a fresh generation and rebuild.
    fn regenerate(&mut self) {
        self.context = None;
        let mut pending = lock_pending(&self.shared);
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        pending.generation = generation;
        let window = pending.window.take();
        drop(pending);

        self.shared
            .counters
            .regenerations
            .fetch_add(1, Ordering::Relaxed);
        self.context_generation = generation;
        let window = window.or_else(|| self.provider.as_mut().and_then(|p| p.replacement()));
        self.context =
            window.and_then(|w| SurfaceContext::build(w, generation, self.backend, self.scale));
        self.publish_ready();
        debug!(
            "surface lost, regenerated at generation {generation} (window: {})",
            self.context.is_some()
        );
    }

    fn render(&mut self, frame: Frame) {
        self.sync_surface();
        let counters = &self.shared.counters;
        if frame.generation != self.context_generation {
            trace!(
                "dropping frame of generation {} (current {})",
                frame.generation,
                self.context_generation
            );
            counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(ctx) = self.context.as_mut() else {
            counters.dropped_no_surface.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let commands = ctx.translator.translate(&frame.commands);
        let result = ctx
            .window
            .execute(&commands)
            .and_then(|()| ctx.window.present());
        match result {
            Ok(()) => {
                counters.presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(PresentError::SurfaceLost) => {
                counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                self.regenerate();
            }
            Err(PresentError::Device(e)) => {
                warn!("present failed: {e}");
                counters.device_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn info(width: u32, height: u32) -> WindowInfo {
        WindowInfo {
            width,
            height,
            format: PixelFormat::Rgba8888,
        }
    }

    fn frame(generation: u64, program: u32) -> Frame {
        Frame {
            generation,
            commands: vec![DrawCommand::UseProgram(program)],
        }
    }

    fn presented(log: &WindowLog) -> Vec<(u32, u32)> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                WindowEvent::Presented { window, commands } => match commands.first() {
                    Some(NativeCommand::UseProgram(p)) => Some((*window, *p)),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    struct Replacements {
        next: u32,
        log: WindowLog,
    }

    impl SurfaceProvider for Replacements {
        fn replacement(&mut self) -> Option<Box<dyn NativeWindow>> {
            self.next += 1;
            Some(Box::new(RecordingWindow::new(
                self.next,
                info(1080, 2400),
                Arc::clone(&self.log),
            )))
        }
    }

    #[test]
    fn drawable_is_scaled_window_size() {
        let log = WindowLog::default();
        let shim = GraphicsShim::start(
            ShimConfig {
                render_scale: 0.5,
                ..ShimConfig::default()
            },
            None,
        )
        .unwrap();
        shim.attach_surface(Box::new(RecordingWindow::new(1, info(1920, 1080), Arc::clone(&log))));
        assert!(shim.flush(WAIT));
        assert_eq!(
            log.lock().unwrap()[0],
            WindowEvent::Configured {
                window: 1,
                width: 960,
                height: 540
            }
        );
    }

    #[test]
    fn stale_generation_frames_are_dropped() {
        let log = WindowLog::default();
        let shim = GraphicsShim::start(ShimConfig::default(), None).unwrap();
        let submit = shim.submitter();

        let g1 = shim.attach_surface(Box::new(RecordingWindow::new(1, info(800, 600), Arc::clone(&log))));
        assert!(submit.submit(frame(g1, 1)));
        let g2 = shim.attach_surface(Box::new(RecordingWindow::new(2, info(600, 800), Arc::clone(&log))));
        assert!(g2 > g1);
        assert!(submit.submit(frame(g1, 2)));
        assert!(submit.submit(frame(g2, 3)));
        assert!(shim.flush(WAIT));

        let stats = shim.stats();
        assert_eq!(stats.presented + stats.dropped_stale, 3);
        assert!(stats.dropped_stale >= 1);
        let shown = presented(&log);
        assert_eq!(shown.last(), Some(&(2, 3)));
        assert!(!shown.contains(&(2, 2)));
        assert!(!shown.contains(&(1, 2)));
    }

    #[test]
    fn surface_loss_regenerates_and_drops_in_flight_frame() {
        let log = WindowLog::default();
        let provider = Replacements {
            next: 100,
            log: Arc::clone(&log),
        };
        let shim = GraphicsShim::start(ShimConfig::default(), Some(Box::new(provider))).unwrap();
        let submit = shim.submitter();

        for id in 1..5 {
            shim.attach_surface(Box::new(RecordingWindow::new(id, info(800, 600), Arc::clone(&log))));
        }
        let g5 = shim.attach_surface(Box::new(
            RecordingWindow::new(5, info(800, 600), Arc::clone(&log)).losing_surface(1),
        ));
        assert_eq!(g5, 5);

        assert!(submit.submit(frame(5, 50)));
        assert!(shim.flush(WAIT));
        assert_eq!(shim.generation(), 6);
        assert!(shim.has_surface());
        let stats = shim.stats();
        assert_eq!(stats.presented, 0);
        assert_eq!(stats.dropped_stale, 1);
        assert_eq!(stats.regenerations, 1);

        assert!(submit.submit(frame(5, 51)));
        assert!(submit.submit(frame(6, 60)));
        assert!(shim.flush(WAIT));
        assert_eq!(presented(&log), vec![(101, 60)]);
        assert!(log
            .lock()
            .unwrap()
            .contains(&WindowEvent::Released { window: 5 }));
    }

    /// A window whose buffers can never be configured.
    struct Unconfigurable;

    impl NativeWindow for Unconfigurable {
        fn info(&self) -> WindowInfo {
            info(800, 600)
        }

        fn set_buffers_geometry(&mut self, _: u32, _: u32) -> Result<(), PresentError> {
            Err(PresentError::Device("no buffers".to_owned()))
        }

        fn execute(&mut self, _: &[NativeCommand]) -> Result<(), PresentError> {
            Ok(())
        }

        fn present(&mut self) -> Result<(), PresentError> {
            Ok(())
        }
    }

    #[test]
    fn unconfigurable_window_is_not_a_surface() {
        let shim = GraphicsShim::start(ShimConfig::default(), None).unwrap();
        let generation = shim.attach_surface(Box::new(Unconfigurable));
        assert!(!shim.surface_ready(WAIT));
        assert!(!shim.has_surface());

        assert!(shim.submitter().submit(frame(generation, 1)));
        assert!(shim.flush(WAIT));
        assert_eq!(shim.stats().dropped_no_surface, 1);

        shim.attach_surface(Box::new(HeadlessWindow::new(800, 600)));
        assert!(shim.surface_ready(WAIT));
    }

    #[test]
    fn frames_without_surface_are_dropped() {
        let shim = GraphicsShim::start(ShimConfig::default(), None).unwrap();
        let submit = shim.submitter();
        let generation = shim.detach_surface();
        assert!(!shim.has_surface());
        assert!(submit.submit(frame(generation, 1)));
        assert!(shim.flush(WAIT));
        assert_eq!(shim.stats().dropped_no_surface, 1);
    }

    #[test]
    fn shutdown_releases_window_and_rejects_frames() {
        let log = WindowLog::default();
        let mut shim = GraphicsShim::start(ShimConfig::default(), None).unwrap();
        let submit = shim.submitter();
        shim.attach_surface(Box::new(RecordingWindow::new(9, info(10, 10), Arc::clone(&log))));
        assert!(shim.flush(WAIT));
        shim.shutdown();
        assert!(log
            .lock()
            .unwrap()
            .contains(&WindowEvent::Released { window: 9 }));
        assert!(!submit.submit(frame(1, 1)));
    }

    #[test]
    fn generation_is_monotonic() {
        let shim = GraphicsShim::start(ShimConfig::default(), None).unwrap();
        let mut last = shim.generation();
        for i in 0..20 {
            let g = if i % 3 == 0 {
                shim.detach_surface()
            } else {
                shim.attach_surface(Box::new(HeadlessWindow::new(4, 4)))
            };
            assert!(g > last);
            last = g;
        }
    }
}
