//! Sample format, channel layout and sample rate conversion to the device format.
//!
//! Everything works on interleaved `f32` in `[-1, 1]`.

use super::{AudioBuffer, DeviceFormat, Samples};

pub fn to_f32(samples: &Samples) -> Vec<f32> {
    match samples {
        Samples::I16(s) => s.iter().map(|&v| f32::from(v) / 32768.0).collect(),
        Samples::F32(s) => s.iter().map(|&v| v.clamp(-1.0, 1.0)).collect(),
    }
}

/// Mono is duplicated onto both channels; stereo is averaged down to mono.
pub fn remix(interleaved: &[f32], from: u16, to: u16) -> Vec<f32> {
    match (from, to) {
        (1, 2) => interleaved.iter().flat_map(|&s| [s, s]).collect(),
        (2, 1) => interleaved
            .chunks_exact(2)
            .map(|f| (f[0] + f[1]) * 0.5)
            .collect(),
        _ => interleaved.to_vec(),
    }
}

/// Streaming linear resampler for one output route.
///
/// The read position is kept in exact units of `1 / to_rate` input frames, and
/// the last frame of each buffer is kept to interpolate across the boundary
/// with the next one. Output length therefore follows the rate ratio over the
/// whole stream, not per buffer, at the cost of holding back at most one frame.
#[derive(Debug, Clone)]
pub struct Resampler {
    channels: usize,
    to_rate: u32,
    from_rate: u32,
    /// Next output position relative to the first frame of the next buffer.
    /// Negative positions fall between `last` and that first frame.
    pos: i64,
    last: Option<Vec<f32>>,
}

impl Resampler {
    pub fn new(channels: u16, to_rate: u32) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            to_rate,
            from_rate: to_rate,
            pos: 0,
            last: None,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.last = None;
    }

    /// Resample one interleaved buffer recorded at `from_rate`. A change of
    /// source rate restarts the stream.
    pub fn process(&mut self, interleaved: &[f32], from_rate: u32) -> Vec<f32> {
        if from_rate != self.from_rate {
            self.from_rate = from_rate;
            self.reset();
        }
        if from_rate == self.to_rate || from_rate == 0 || self.to_rate == 0 {
            return interleaved.to_vec();
        }
        let channels = self.channels;
        let frames_in = interleaved.len() / channels;
        if frames_in == 0 {
            return Vec::new();
        }

        let unit = i64::from(self.to_rate);
        let step = i64::from(from_rate);
        // The frame before `idx + 1` must exist, so the final frame waits.
        let limit = (frames_in as i64 - 1) * unit;
        let last = self.last.as_deref().unwrap_or(&interleaved[..channels]);

        let estimate = ((limit - self.pos).max(0) / step + 1) as usize;
        let mut out = Vec::with_capacity(estimate * channels);
        let mut pos = self.pos;
        while pos < limit {
            let idx = pos.div_euclid(unit);
            let frac = pos.rem_euclid(unit) as f32 / unit as f32;
            let a = frame(interleaved, last, channels, idx);
            let b = frame(interleaved, last, channels, idx + 1);
            out.extend(a.iter().zip(b).map(|(&a, &b)| a + (b - a) * frac));
            pos += step;
        }

        self.pos = pos - frames_in as i64 * unit;
        let tail = (frames_in - 1) * channels;
        self.last = Some(interleaved[tail..tail + channels].to_vec());
        out
    }
}

/// Frame `idx` of the buffer, where `-1` is the previous buffer's last frame.
fn frame<'a>(interleaved: &'a [f32], last: &'a [f32], channels: usize, idx: i64) -> &'a [f32] {
    match usize::try_from(idx) {
        Ok(idx) => &interleaved[idx * channels..(idx + 1) * channels],
        Err(_) => last,
    }
}

/// Converts hosted buffers to one device format, carrying resampler state
/// from buffer to buffer.
#[derive(Debug, Clone)]
pub struct Converter {
    target: DeviceFormat,
    resampler: Resampler,
}

impl Converter {
    pub fn new(target: DeviceFormat) -> Self {
        Self {
            target,
            resampler: Resampler::new(target.channels, target.sample_rate),
        }
    }

    pub fn target(&self) -> DeviceFormat {
        self.target
    }

    /// Convert a hosted buffer into interleaved samples in the device's format.
    pub fn convert(&mut self, buffer: &AudioBuffer) -> Vec<f32> {
        let format = buffer.format();
        let samples = to_f32(buffer.samples());
        let samples = remix(&samples, format.channels, self.target.channels);
        self.resampler.process(&samples, format.sample_rate)
    }
}
