//! Offline synthesis primitives
//!
//! Envelope-shaped oscillator + noise models. These render note events and
//! stand in for missing samples via the built-in instrument table.

/// ADSR envelope; times in seconds, sustain as a level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adsr {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.05,
            sustain: 0.7,
            release: 0.1,
        }
    }
}

impl Adsr {
    /// Envelope level at time `t` of an event lasting `duration` seconds
    ///
    /// The release phase starts at `duration`; total rendered length is
    /// `duration + release`.
    pub fn level(&self, t: f64, duration: f64) -> f64 {
        if t < 0.0 {
            return 0.0;
        }
        if t < self.attack {
            return t / self.attack.max(1e-6);
        }
        let after_attack = t - self.attack;
        if after_attack < self.decay {
            let frac = after_attack / self.decay.max(1e-6);
            return 1.0 - (1.0 - self.sustain) * frac;
        }
        if t < duration {
            return self.sustain;
        }
        let into_release = t - duration;
        if into_release < self.release {
            return self.sustain * (1.0 - into_release / self.release.max(1e-6));
        }
        0.0
    }

    pub fn total_length(&self, duration: f64) -> f64 {
        duration + self.release
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Square,
    Saw,
    Noise,
}

impl Waveform {
    /// One sample at phase `p` in [0, 1)
    fn sample(&self, p: f64, noise: &mut NoiseState) -> f64 {
        match self {
            Waveform::Sine => (p * std::f64::consts::TAU).sin(),
            Waveform::Triangle => {
                if p < 0.5 {
                    4.0 * p - 1.0
                } else {
                    3.0 - 4.0 * p
                }
            }
            Waveform::Square => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Saw => 2.0 * p - 1.0,
            Waveform::Noise => noise.next(),
        }
    }
}

/// Deterministic white noise (xorshift), so renders are reproducible
struct NoiseState {
    state: u64,
}

impl NoiseState {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> f64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x as f64 / u64::MAX as f64) * 2.0 - 1.0
    }
}

/// An envelope-modulated oscillator+noise voice
#[derive(Debug, Clone, PartialEq)]
pub struct SynthModel {
    pub waveform: Waveform,
    /// Fundamental in Hz
    pub frequency: f64,
    pub env: Adsr,
    /// 0..1 blend of white noise over the oscillator
    pub noise_mix: f64,
    /// Exponential frequency decay rate (per second); kick-style pitch drop
    pub pitch_drop: f64,
    /// Seconds before the release phase
    pub duration: f64,
}

impl SynthModel {
    /// Render the voice to mono samples
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let total = self.env.total_length(self.duration);
        let frames = (total * sample_rate as f64).ceil() as usize;
        let mut out = Vec::with_capacity(frames);
        let mut noise = NoiseState::new(0x5d_eb_e6_2d);
        let dt = 1.0 / sample_rate as f64;
        let mut phase = 0.0f64;

        for i in 0..frames {
            let t = i as f64 * dt;
            let freq = if self.pitch_drop > 0.0 {
                self.frequency * (-t * self.pitch_drop).exp()
            } else {
                self.frequency
            };
            phase = (phase + freq * dt).fract();

            let osc = self.waveform.sample(phase, &mut noise);
            let mixed = if self.noise_mix > 0.0 {
                osc * (1.0 - self.noise_mix) + noise.next() * self.noise_mix
            } else {
                osc
            };
            out.push((mixed * self.env.level(t, self.duration)) as f32);
        }

        out
    }
}

/// Built-in instrument table for samples the cache cannot provide
///
/// Parameters are chosen per conventional drum-machine names; anything
/// unrecognized falls back to a plain triangle pluck.
pub fn fallback_model(sample_name: &str) -> SynthModel {
    match sample_name {
        "bd" | "kick" => SynthModel {
            waveform: Waveform::Sine,
            frequency: 120.0,
            env: Adsr {
                attack: 0.002,
                decay: 0.12,
                sustain: 0.0,
                release: 0.05,
            },
            noise_mix: 0.05,
            pitch_drop: 18.0,
            duration: 0.12,
        },
        "sd" | "snare" => SynthModel {
            waveform: Waveform::Triangle,
            frequency: 180.0,
            env: Adsr {
                attack: 0.001,
                decay: 0.1,
                sustain: 0.0,
                release: 0.08,
            },
            noise_mix: 0.6,
            pitch_drop: 6.0,
            duration: 0.1,
        },
        "hh" | "hat" => SynthModel {
            waveform: Waveform::Noise,
            frequency: 8000.0,
            env: Adsr {
                attack: 0.001,
                decay: 0.03,
                sustain: 0.0,
                release: 0.02,
            },
            noise_mix: 1.0,
            pitch_drop: 0.0,
            duration: 0.03,
        },
        "oh" => SynthModel {
            waveform: Waveform::Noise,
            frequency: 8000.0,
            env: Adsr {
                attack: 0.001,
                decay: 0.2,
                sustain: 0.0,
                release: 0.15,
            },
            noise_mix: 1.0,
            pitch_drop: 0.0,
            duration: 0.2,
        },
        "cp" | "clap" => SynthModel {
            waveform: Waveform::Noise,
            frequency: 1500.0,
            env: Adsr {
                attack: 0.001,
                decay: 0.08,
                sustain: 0.0,
                release: 0.05,
            },
            noise_mix: 1.0,
            pitch_drop: 0.0,
            duration: 0.08,
        },
        "rim" | "rs" => SynthModel {
            waveform: Waveform::Square,
            frequency: 450.0,
            env: Adsr {
                attack: 0.001,
                decay: 0.03,
                sustain: 0.0,
                release: 0.02,
            },
            noise_mix: 0.2,
            pitch_drop: 2.0,
            duration: 0.03,
        },
        _ => SynthModel {
            waveform: Waveform::Triangle,
            frequency: 220.0,
            env: Adsr {
                attack: 0.005,
                decay: 0.08,
                sustain: 0.2,
                release: 0.1,
            },
            noise_mix: 0.0,
            pitch_drop: 0.0,
            duration: 0.15,
        },
    }
}

/// Model for a note event, ADSR params taken from the event when present
pub fn note_model(frequency: f64, duration: f64, adsr: Adsr) -> SynthModel {
    SynthModel {
        waveform: Waveform::Triangle,
        frequency,
        env: adsr,
        noise_mix: 0.0,
        pitch_drop: 0.0,
        duration,
    }
}
