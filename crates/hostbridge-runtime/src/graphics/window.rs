use super::{NativeCommand, NativeWindow, PixelFormat, PresentError, WindowInfo};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Off-screen window: accepts everything and shows nothing.
pub struct HeadlessWindow {
    info: WindowInfo,
    frame_interval: Option<Duration>,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            info: WindowInfo {
                width,
                height,
                format: PixelFormat::Rgba8888,
            },
            frame_interval: None,
        }
    }

    /// Block every present for `interval`, like a display refresh.
    #[must_use]
    pub fn with_vsync(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }
}

impl NativeWindow for HeadlessWindow {
    fn info(&self) -> WindowInfo {
        self.info
    }

    fn set_buffers_geometry(&mut self, _width: u32, _height: u32) -> Result<(), PresentError> {
        Ok(())
    }

    fn execute(&mut self, _commands: &[NativeCommand]) -> Result<(), PresentError> {
        Ok(())
    }

    fn present(&mut self) -> Result<(), PresentError> {
        if let Some(interval) = self.frame_interval {
            std::thread::sleep(interval);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    Configured { window: u32, width: u32, height: u32 },
    Presented { window: u32, commands: Vec<NativeCommand> },
    Released { window: u32 },
}

/// Shared, ordered log of what recording windows saw.
pub type WindowLog = Arc<Mutex<Vec<WindowEvent>>>;

/// Window that records every call into a shared log, for tests.
pub struct RecordingWindow {
    id: u32,
    info: WindowInfo,
    log: WindowLog,
    pending: Vec<NativeCommand>,
    lose_on_present: usize,
}

impl RecordingWindow {
    pub fn new(id: u32, info: WindowInfo, log: WindowLog) -> Self {
        Self {
            id,
            info,
            log,
            pending: Vec::new(),
            lose_on_present: 0,
        }
    }

    /// The next `count` presents fail with a lost surface.
    #[must_use]
    pub fn losing_surface(mut self, count: usize) -> Self {
        self.lose_on_present = count;
        self
    }

    fn record(&self, event: WindowEvent) {
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }
}

impl NativeWindow for RecordingWindow {
    fn info(&self) -> WindowInfo {
        self.info
    }

    fn set_buffers_geometry(&mut self, width: u32, height: u32) -> Result<(), PresentError> {
        self.record(WindowEvent::Configured {
            window: self.id,
            width,
            height,
        });
        Ok(())
    }

    fn execute(&mut self, commands: &[NativeCommand]) -> Result<(), PresentError> {
        self.pending.extend_from_slice(commands);
        Ok(())
    }

    fn present(&mut self) -> Result<(), PresentError> {
        let commands = std::mem::take(&mut self.pending);
        if self.lose_on_present > 0 {
            self.lose_on_present -= 1;
            return Err(PresentError::SurfaceLost);
        }
        self.record(WindowEvent::Presented {
            window: self.id,
            commands,
        });
        Ok(())
    }
}

impl Drop for RecordingWindow {
    fn drop(&mut self) {
        self.record(WindowEvent::Released { window: self.id });
    }
}
