//! Offline audio graph
//!
//! An explicit list of scheduled sources rendered in one pass: each source
//! produces mono samples (synth voice or decoded buffer), runs through its
//! filter/effect chain, and is mixed into the stereo sums with equal-power
//! panning. No realtime callbacks; the caller polls progress and may abort
//! between sources.

use std::sync::Arc;

use super::synth::SynthModel;

/// Lowpass cutoffs below this are clamped up to avoid total muffling
pub const LPF_FLOOR_HZ: f64 = 1000.0;

/// Minimum event gain so output is never inaudible
pub const GAIN_FLOOR: f64 = 0.3;

/// What a scheduled source plays
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// A decoded sample buffer (mono), played at rate 1.0
    Buffer {
        samples: Arc<Vec<f32>>,
        sample_rate: u32,
    },
    /// A synthesized voice
    Synth(SynthModel),
}

/// One event on the graph timeline
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub start_sec: f64,
    pub kind: SourceKind,
    pub gain: f64,
    /// -1 (left) .. +1 (right)
    pub pan: f64,
    pub lpf: Option<f64>,
    pub hpf: Option<f64>,
    /// 0..1 reverb send
    pub room: f64,
    /// 0..1 feedback-echo send
    pub delay: f64,
}

/// RBJ biquad, used for the lowpass/highpass event filters
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    const Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn lowpass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = std::f64::consts::TAU * (cutoff / sample_rate).min(0.49);
        let alpha = w0.sin() / (2.0 * Self::Q);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    fn highpass(cutoff: f64, sample_rate: f64) -> Self {
        let w0 = std::f64::consts::TAU * (cutoff / sample_rate).min(0.49);
        let alpha = w0.sin() / (2.0 * Self::Q);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    fn process(&mut self, buf: &mut [f32]) {
        for sample in buf {
            let x = *sample as f64;
            let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;
            self.x2 = self.x1;
            self.x1 = x;
            self.y2 = self.y1;
            self.y1 = y;
            *sample = y as f32;
        }
    }
}

/// Feedback echo; time fixed, mix/feedback scale with the send level
fn apply_delay(buf: &mut [f32], send: f64, sample_rate: u32) {
    let delay_frames = (0.25 * sample_rate as f64) as usize;
    if delay_frames == 0 || delay_frames >= buf.len() {
        return;
    }
    let feedback = (send * 0.5).min(0.7) as f32;
    for i in delay_frames..buf.len() {
        buf[i] += buf[i - delay_frames] * feedback;
    }
}

/// Early-reflection taps standing in for a room
fn apply_room(buf: &mut [f32], send: f64, sample_rate: u32) {
    const TAPS_MS: [f64; 4] = [29.0, 37.0, 41.0, 53.0];
    let len = buf.len();
    for (t, ms) in TAPS_MS.iter().enumerate() {
        let offset = (ms / 1000.0 * sample_rate as f64) as usize;
        if offset == 0 || offset >= len {
            continue;
        }
        let level = (send * 0.4 / (t + 1) as f64) as f32;
        for i in (offset..len).rev() {
            buf[i] += buf[i - offset] * level;
        }
    }
}

/// Rendering was aborted through the cancellation callback
#[derive(Debug, PartialEq, Eq)]
pub struct RenderAborted;

/// Offline rendering context for one job
pub struct OfflineGraph {
    sample_rate: u32,
    channels: u16,
    frames: usize,
    sources: Vec<ScheduledSource>,
}

impl OfflineGraph {
    pub fn new(sample_rate: u32, channels: u16, duration_sec: f64) -> Self {
        Self {
            sample_rate,
            channels,
            frames: (duration_sec * sample_rate as f64).round() as usize,
            sources: Vec::new(),
        }
    }

    pub fn schedule(&mut self, source: ScheduledSource) {
        self.sources.push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Render every scheduled source into an interleaved buffer
    ///
    /// `keep_going` is polled between sources; returning false aborts. The
    /// progress argument is the fraction of sources mixed so far.
    pub fn render<F>(&self, mut keep_going: F) -> Result<Vec<f32>, RenderAborted>
    where
        F: FnMut(f64) -> bool,
    {
        let mut left = vec![0.0f32; self.frames];
        let mut right = vec![0.0f32; self.frames];

        for (index, source) in self.sources.iter().enumerate() {
            if !keep_going(index as f64 / self.sources.len().max(1) as f64) {
                return Err(RenderAborted);
            }
            self.mix_source(source, &mut left, &mut right);
        }
        if !keep_going(1.0) {
            return Err(RenderAborted);
        }

        // Interleave; mono folds the stereo sums down
        let mut out = Vec::with_capacity(self.frames * self.channels as usize);
        match self.channels {
            1 => {
                for i in 0..self.frames {
                    out.push(((left[i] + right[i]) * 0.5).clamp(-1.0, 1.0));
                }
            }
            _ => {
                for i in 0..self.frames {
                    out.push(left[i].clamp(-1.0, 1.0));
                    out.push(right[i].clamp(-1.0, 1.0));
                }
            }
        }
        Ok(out)
    }

    fn mix_source(&self, source: &ScheduledSource, left: &mut [f32], right: &mut [f32]) {
        let mut mono = match &source.kind {
            SourceKind::Synth(model) => model.render(self.sample_rate),
            SourceKind::Buffer {
                samples,
                sample_rate,
            } => {
                if *sample_rate == self.sample_rate {
                    samples.as_ref().clone()
                } else {
                    // Sample-rate conversion only; playback rate stays 1.0
                    resample_linear(samples, *sample_rate, self.sample_rate)
                }
            }
        };

        // Give echoes and reflections room to land past the voice itself
        if source.delay > 0.0 {
            mono.resize(mono.len() + self.sample_rate as usize, 0.0);
        } else if source.room > 0.0 {
            mono.resize(mono.len() + self.sample_rate as usize / 8, 0.0);
        }

        if let Some(cutoff) = source.lpf {
            Biquad::lowpass(cutoff.max(LPF_FLOOR_HZ), self.sample_rate as f64).process(&mut mono);
        }
        if let Some(cutoff) = source.hpf {
            Biquad::highpass(cutoff.max(1.0), self.sample_rate as f64).process(&mut mono);
        }
        if source.delay > 0.0 {
            apply_delay(&mut mono, source.delay, self.sample_rate);
        }
        if source.room > 0.0 {
            apply_room(&mut mono, source.room, self.sample_rate);
        }

        // Equal-power pan
        let angle = (source.pan.clamp(-1.0, 1.0) + 1.0) * std::f64::consts::FRAC_PI_4;
        let gain_l = (angle.cos() * source.gain) as f32;
        let gain_r = (angle.sin() * source.gain) as f32;

        let start = (source.start_sec * self.sample_rate as f64).round() as isize;
        for (i, &sample) in mono.iter().enumerate() {
            let frame = start + i as isize;
            if frame < 0 {
                continue;
            }
            let frame = frame as usize;
            if frame >= self.frames {
                break;
            }
            left[frame] += sample * gain_l;
            right[frame] += sample * gain_r;
        }
    }
}

fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}
