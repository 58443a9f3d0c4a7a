//! Audio bridge.
//!
//! The hosted program pushes buffers at its own pace. Each buffer is converted
//! to the device format on the pushing thread, with resampling carried across
//! buffers for the life of the route, and placed in a bounded lock-free queue; when the queue is full the oldest queued buffer is dropped. The device
//! pull callback only pops from that queue and never blocks, filling silence
//! when it runs dry.
//!
//! A route change builds a fresh session with an empty queue and a fresh
//! converter, so buffers queued for the old device are discarded and the hosted
//! side never sees an error.

pub mod convert;

use crate::RuntimeError;
use convert::Converter;
use crossbeam_queue::ArrayQueue;
use hostbridge_schema::SessionConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::I16(s) => s.len(),
            Samples::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            Samples::I16(_) => SampleFormat::I16,
            Samples::F32(_) => SampleFormat::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample: SampleFormat,
}

/// Interleaved PCM produced by the hosted program.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    format: StreamFormat,
    samples: Samples,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Samples) -> Result<Self, RuntimeError> {
        if !(1..=2).contains(&channels) {
            return Err(RuntimeError::InvalidAudio(format!(
                "{channels} channels, expected 1 or 2"
            )));
        }
        if sample_rate == 0 {
            return Err(RuntimeError::InvalidAudio("sample rate is zero".to_owned()));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(RuntimeError::InvalidAudio(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            format: StreamFormat {
                sample_rate,
                channels,
                sample: samples.format(),
            },
            samples,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels)
    }
}

/// What the device plays: interleaved `f32` at this rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl std::fmt::Display for DeviceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz x{}", self.sample_rate, self.channels)
    }
}

/// Pull callback: fill the slice with interleaved samples. Runs on the device's
/// real-time thread.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// An open output stream. Dropping it stops playback.
pub trait AudioStream: Send {
    fn format(&self) -> DeviceFormat;
}

/// The device audio engine.
pub trait AudioDevice: Send + Sync {
    fn name(&self) -> &str;

    fn default_format(&self) -> DeviceFormat;

    fn open(
        &self,
        format: DeviceFormat,
        callback: RenderCallback,
    ) -> Result<Box<dyn AudioStream>, RuntimeError>;
}

struct OpenStream {
    format: DeviceFormat,
}

impl AudioStream for OpenStream {
    fn format(&self) -> DeviceFormat {
        self.format
    }
}

/// Accepts any format and never pulls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl AudioDevice for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn default_format(&self) -> DeviceFormat {
        DeviceFormat {
            sample_rate: 48_000,
            channels: 2,
        }
    }

    fn open(
        &self,
        format: DeviceFormat,
        _callback: RenderCallback,
    ) -> Result<Box<dyn AudioStream>, RuntimeError> {
        Ok(Box::new(OpenStream { format }))
    }
}

#[derive(Default)]
struct ManualState {
    callback: Option<RenderCallback>,
    format: Option<DeviceFormat>,
    rejected: Vec<DeviceFormat>,
    fail_all: bool,
    opens: usize,
}

/// A device whose callback is driven by hand. Used by tests and benchmarks.
pub struct ManualDevice {
    name: String,
    default: DeviceFormat,
    state: Mutex<ManualState>,
}

impl ManualDevice {
    pub fn new(name: &str, default: DeviceFormat) -> Self {
        Self {
            name: name.to_owned(),
            default,
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Opening with this format fails.
    pub fn reject(&self, format: DeviceFormat) {
        self.lock().rejected.push(format);
    }

    /// Every open fails.
    pub fn fail_all(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Format of the stream currently open, if any.
    pub fn current_format(&self) -> Option<DeviceFormat> {
        self.lock().format
    }

    /// Run the callback for `frames` frames, as the device thread would.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut state = self.lock();
        let channels = usize::from(state.format.map_or(self.default.channels, |f| f.channels));
        let mut out = vec![0.0; frames * channels];
        if let Some(callback) = state.callback.as_mut() {
            callback(&mut out);
        }
        out
    }

    /// Forget the open stream, as if the device went away.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.callback = None;
        state.format = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioDevice for ManualDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_format(&self) -> DeviceFormat {
        self.default
    }

    fn open(
        &self,
        format: DeviceFormat,
        callback: RenderCallback,
    ) -> Result<Box<dyn AudioStream>, RuntimeError> {
        let mut state = self.lock();
        state.opens += 1;
        if state.fail_all || state.rejected.contains(&format) {
            return Err(RuntimeError::Bridge(format!(
                "{}: cannot open {format}",
                self.name
            )));
        }
        state.callback = Some(callback);
        state.format = Some(format);
        Ok(Box::new(OpenStream { format }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Converted buffers held for the device before the oldest is dropped.
    pub queue_buffers: usize,
    /// `None` uses the device's default format.
    pub preferred: Option<DeviceFormat>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            queue_buffers: 8,
            preferred: None,
        }
    }
}

impl AudioConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            queue_buffers: config.audio_queue_buffers,
            preferred: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStats {
    pub pushed: u64,
    pub dropped_oldest: u64,
    pub discarded: u64,
    pub underruns: u64,
    pub route_changes: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    dropped_oldest: AtomicU64,
    discarded: AtomicU64,
    underruns: AtomicU64,
    route_changes: AtomicU64,
}

/// One open output route. `converter` is `None` when no stream could be opened.
struct AudioSession {
    queue: Arc<ArrayQueue<Vec<f32>>>,
    /// Held while a converted buffer is queued, so queue order is stream order.
    converter: Option<Mutex<Converter>>,
    stream: Mutex<Option<Box<dyn AudioStream>>>,
}

impl AudioSession {
    fn silent() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(1)),
            converter: None,
            stream: Mutex::new(None),
        }
    }

    fn format(&self) -> Option<DeviceFormat> {
        let converter = self.converter.as_ref()?;
        Some(converter.lock().unwrap_or_else(PoisonError::into_inner).target())
    }

    fn stop(&self) {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Builds the non-blocking pull callback over `queue`.
fn pull_callback(queue: Arc<ArrayQueue<Vec<f32>>>, counters: Arc<Counters>) -> RenderCallback {
    let mut carry: Vec<f32> = Vec::new();
    let mut pos = 0;
    Box::new(move |out: &mut [f32]| {
        let mut written = 0;
        while written < out.len() {
            if pos >= carry.len() {
                match queue.pop() {
                    Some(next) => {
                        carry = next;
                        pos = 0;
                        continue;
                    }
                    None => {
                        out[written..].fill(0.0);
                        counters.underruns.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            let n = (carry.len() - pos).min(out.len() - written);
            out[written..written + n].copy_from_slice(&carry[pos..pos + n]);
            pos += n;
            written += n;
        }
    })
}

pub struct AudioBridge {
    config: AudioConfig,
    device: RwLock<Arc<dyn AudioDevice>>,
    session: RwLock<Arc<AudioSession>>,
    focus: AtomicBool,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl AudioBridge {
    /// Open a session on `device`. Never fails: a device that refuses to open
    /// leaves the bridge discarding buffers until the next route change.
    pub fn new(device: Arc<dyn AudioDevice>, config: AudioConfig) -> Self {
        let counters = Arc::new(Counters::default());
        let session = open_session(device.as_ref(), &config, &counters);
        Self {
            config,
            device: RwLock::new(device),
            session: RwLock::new(Arc::new(session)),
            focus: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    fn session(&self) -> Arc<AudioSession> {
        let guard = self.session.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Queue a buffer for playback. Never fails and never waits on the device.
    pub fn push_audio_buffer(&self, buffer: AudioBuffer) {
        if !self.focus.load(Ordering::Acquire) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let session = self.session();
        let Some(ref converter) = session.converter else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mut converter = converter.lock().unwrap_or_else(PoisonError::into_inner);
        let converted = converter.convert(&buffer);
        // A buffer shorter than the resampler's hold-back yields nothing yet.
        if !converted.is_empty() && session.queue.force_push(converted).is_some() {
            self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Device audio focus. Buffers pushed while focus is lost are discarded.
    pub fn set_focus(&self, focused: bool) {
        self.focus.store(focused, Ordering::Release);
        debug!("audio focus {}", if focused { "gained" } else { "lost" });
    }

    /// The output device changed. Queued buffers for the old route are dropped.
    pub fn route_changed(&self, device: Arc<dyn AudioDevice>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.session().stop();
        let session = Arc::new(open_session(device.as_ref(), &self.config, &self.counters));

        let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
        // `close` may have run while the new route was opening.
        if self.closed.load(Ordering::Acquire) {
            drop(current);
            session.stop();
            debug!("audio bridge closed during route change to '{}'", device.name());
            return;
        }
        self.counters.route_changes.fetch_add(1, Ordering::Relaxed);
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
        let old = std::mem::replace(&mut *current, session);
        drop(current);
        old.stop();
    }

    /// Stop output for good. Later pushes are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let old = std::mem::replace(
            &mut *self.session.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(AudioSession::silent()),
        );
        old.stop();
    }

    /// Format of the open stream, `None` while there is no output.
    pub fn output_format(&self) -> Option<DeviceFormat> {
        self.session().format()
    }

    pub fn device_name(&self) -> String {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
            .to_owned()
    }

    pub fn queued(&self) -> usize {
        self.session().queue.len()
    }

    pub fn stats(&self) -> AudioStats {
        let c = &self.counters;
        AudioStats {
            pushed: c.pushed.load(Ordering::Relaxed),
            dropped_oldest: c.dropped_oldest.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            route_changes: c.route_changes.load(Ordering::Relaxed),
        }
    }
}

/// Open the preferred format, then the device default once, then give up.
fn open_session(
    device: &dyn AudioDevice,
    config: &AudioConfig,
    counters: &Arc<Counters>,
) -> AudioSession {
    let default = device.default_format();
    let attempts = [config.preferred.unwrap_or(default), default];

    for (i, format) in attempts.into_iter().enumerate() {
        let queue = Arc::new(ArrayQueue::new(config.queue_buffers.max(1)));
        let callback = pull_callback(Arc::clone(&queue), Arc::clone(counters));
        match device.open(format, callback) {
            Ok(stream) => {
                info!("audio output on '{}' at {format}", device.name());
                return AudioSession {
                    queue,
                    converter: Some(Mutex::new(Converter::new(stream.format()))),
                    stream: Mutex::new(Some(stream)),
                };
            }
            Err(e) if i == 0 => {
                warn!("opening '{}' at {format} failed, retrying: {e}", device.name());
            }
            Err(e) => {
                warn!("audio output disabled until the next route change: {e}");
            }
        }
    }
    AudioSession::silent()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO_48K: DeviceFormat = DeviceFormat {
        sample_rate: 48_000,
        channels: 2,
    };

    fn stereo(samples: &[f32]) -> AudioBuffer {
        AudioBuffer::new(48_000, 2, Samples::F32(samples.to_vec())).unwrap()
    }

    fn bridge(queue_buffers: usize) -> (Arc<ManualDevice>, AudioBridge) {
        let device = Arc::new(ManualDevice::new("speaker", STEREO_48K));
        let bridge = AudioBridge::new(
            device.clone(),
            AudioConfig {
                queue_buffers,
                preferred: None,
            },
        );
        (device, bridge)
    }

    #[test]
    fn rejects_bad_channel_counts() {
        assert!(matches!(
            AudioBuffer::new(48_000, 6, Samples::I16(vec![0; 6])),
            Err(RuntimeError::InvalidAudio(_))
        ));
        assert!(AudioBuffer::new(48_000, 2, Samples::I16(vec![0; 3])).is_err());
    }

    #[test]
    fn pull_carries_partial_buffers_and_fills_silence() {
        let (device, bridge) = bridge(4);
        bridge.push_audio_buffer(stereo(&[0.1, 0.1, 0.2, 0.2, 0.3, 0.3]));
        assert_eq!(device.pull(2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(device.pull(2), vec![0.3, 0.3, 0.0, 0.0]);
        assert_eq!(bridge.stats().underruns, 1);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (device, bridge) = bridge(2);
        bridge.push_audio_buffer(stereo(&[0.1, 0.1]));
        bridge.push_audio_buffer(stereo(&[0.2, 0.2]));
        bridge.push_audio_buffer(stereo(&[0.3, 0.3]));
        assert_eq!(bridge.stats().dropped_oldest, 1);
        assert_eq!(device.pull(2), vec![0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn converts_to_device_format() {
        let (device, bridge) = bridge(4);
        let buffer = AudioBuffer::new(48_000, 1, Samples::I16(vec![16384])).unwrap();
        bridge.push_audio_buffer(buffer);
        assert_eq!(device.pull(1), vec![0.5, 0.5]);
    }

    #[test]
    fn focus_loss_discards() {
        let (device, bridge) = bridge(4);
        bridge.set_focus(false);
        bridge.push_audio_buffer(stereo(&[0.5, 0.5]));
        assert_eq!(bridge.stats().discarded, 1);
        bridge.set_focus(true);
        assert_eq!(device.pull(1), vec![0.0, 0.0]);
    }

    #[test]
    fn route_change_discards_in_flight_buffers() {
        let (old, bridge) = bridge(4);
        bridge.push_audio_buffer(stereo(&[0.7, 0.7]));
        let headset = Arc::new(ManualDevice::new(
            "headset",
            DeviceFormat {
                sample_rate: 44_100,
                channels: 1,
            },
        ));
        bridge.route_changed(headset.clone());
        assert_eq!(bridge.device_name(), "headset");
        assert_eq!(bridge.queued(), 0);
        assert_eq!(headset.pull(1), vec![0.0]);

        let buffer = AudioBuffer::new(44_100, 2, Samples::F32(vec![0.2, 0.4])).unwrap();
        bridge.push_audio_buffer(buffer);
        let out = headset.pull(1);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert_eq!(old.open_count(), 1);
        assert_eq!(bridge.stats().route_changes, 1);
    }

    #[test]
    fn route_change_falls_back_to_default_format() {
        let (_, bridge) = {
            let device = Arc::new(ManualDevice::new("speaker", STEREO_48K));
            let preferred = DeviceFormat {
                sample_rate: 96_000,
                channels: 2,
            };
            let bridge = AudioBridge::new(
                device.clone(),
                AudioConfig {
                    queue_buffers: 4,
                    preferred: Some(preferred),
                },
            );
            (device, bridge)
        };
        let usb = Arc::new(ManualDevice::new("usb", STEREO_48K));
        usb.reject(DeviceFormat {
            sample_rate: 96_000,
            channels: 2,
        });
        bridge.route_changed(usb.clone());
        assert_eq!(usb.open_count(), 2);
        assert_eq!(bridge.output_format(), Some(STEREO_48K));
    }

    #[test]
    fn failed_route_runs_silent_until_next_change() {
        let (_, bridge) = bridge(4);
        let broken = Arc::new(ManualDevice::new("broken", STEREO_48K));
        broken.fail_all(true);
        bridge.route_changed(broken.clone());
        assert_eq!(broken.open_count(), 2);
        assert_eq!(bridge.output_format(), None);
        bridge.push_audio_buffer(stereo(&[0.1, 0.1]));
        assert_eq!(bridge.stats().discarded, 1);

        let fixed = Arc::new(ManualDevice::new("fixed", STEREO_48K));
        bridge.route_changed(fixed.clone());
        bridge.push_audio_buffer(stereo(&[0.1, 0.1]));
        assert_eq!(fixed.pull(1), vec![0.1, 0.1]);
    }

    #[test]
    fn close_silences_output() {
        let (_, bridge) = bridge(4);
        bridge.close();
        bridge.push_audio_buffer(stereo(&[0.1, 0.1]));
        assert_eq!(bridge.output_format(), None);
        assert_eq!(bridge.stats().discarded, 1);
    }

    #[test]
    fn resampling_carries_across_pushes() {
        let device = Arc::new(ManualDevice::new(
            "speaker",
            DeviceFormat {
                sample_rate: 44_100,
                channels: 1,
            },
        ));
        let bridge = AudioBridge::new(
            device.clone(),
            AudioConfig {
                queue_buffers: 128,
                preferred: None,
            },
        );
        for _ in 0..100 {
            let buffer = AudioBuffer::new(48_000, 1, Samples::F32(vec![0.5; 256])).unwrap();
            bridge.push_audio_buffer(buffer);
        }
        // 25 600 frames at 48 kHz play as exactly 23 520 at 44.1 kHz.
        let out = device.pull(23_520);
        assert!(out.iter().all(|v| (v - 0.5).abs() < 1e-6));
        assert_eq!(bridge.stats().underruns, 0);
        assert_eq!(device.pull(1), vec![0.0]);
    }

    /// Closes the bridge from inside `open`, as a concurrent `close` would.
    struct ClosingDevice {
        inner: ManualDevice,
        bridge: Mutex<Option<Arc<AudioBridge>>>,
    }

    impl AudioDevice for ClosingDevice {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn default_format(&self) -> DeviceFormat {
            self.inner.default_format()
        }

        fn open(
            &self,
            format: DeviceFormat,
            callback: RenderCallback,
        ) -> Result<Box<dyn AudioStream>, RuntimeError> {
            if let Some(bridge) = self.bridge.lock().unwrap().take() {
                bridge.close();
            }
            self.inner.open(format, callback)
        }
    }

    #[test]
    fn close_during_route_change_stays_closed() {
        let (_, bridge) = bridge(4);
        let bridge = Arc::new(bridge);
        let device = Arc::new(ClosingDevice {
            inner: ManualDevice::new("usb", STEREO_48K),
            bridge: Mutex::new(Some(Arc::clone(&bridge))),
        });
        bridge.route_changed(device.clone());

        assert_eq!(device.inner.open_count(), 1);
        assert_eq!(bridge.output_format(), None);
        assert_eq!(bridge.device_name(), "speaker");
        assert_eq!(bridge.stats().route_changes, 0);
        bridge.push_audio_buffer(stereo(&[0.1, 0.1]));
        assert_eq!(bridge.stats().discarded, 1);
    }
}
