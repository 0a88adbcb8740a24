//! Event values and control overlays

use serde::{Deserialize, Serialize};

/// The sound an event triggers plus its per-event parameters
///
/// Exactly one of `sample` / `note` is set by the evaluator; controls are
/// layered on by chained ops and default to None so the renderer can apply
/// its own defaults (gain 0.5, center pan, no filters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(default)]
    pub sample_index: usize,
    /// MIDI note number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pan: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lpf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hpf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sustain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<f64>,
}

impl EventValue {
    pub fn sample(name: impl Into<String>, index: usize) -> Self {
        Self {
            sample: Some(name.into()),
            sample_index: index,
            ..Default::default()
        }
    }

    pub fn note(midi: f64) -> Self {
        Self {
            note: Some(midi),
            ..Default::default()
        }
    }

    /// Note frequency in Hz (A4 = 440, MIDI 69)
    pub fn frequency(&self) -> Option<f64> {
        self.note.map(|n| 440.0 * 2f64.powf((n - 69.0) / 12.0))
    }
}

/// A single chained control, e.g. `.gain(0.8)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Gain(f64),
    Pan(f64),
    Lpf(f64),
    Hpf(f64),
    Room(f64),
    Delay(f64),
    Attack(f64),
    Decay(f64),
    Sustain(f64),
    Release(f64),
}

impl Control {
    /// Overlay this control onto an event value
    pub fn apply(&self, value: &mut EventValue) {
        match *self {
            Control::Gain(x) => value.gain = Some(x),
            Control::Pan(x) => value.pan = Some(x),
            Control::Lpf(x) => value.lpf = Some(x),
            Control::Hpf(x) => value.hpf = Some(x),
            Control::Room(x) => value.room = Some(x),
            Control::Delay(x) => value.delay = Some(x),
            Control::Attack(x) => value.attack = Some(x),
            Control::Decay(x) => value.decay = Some(x),
            Control::Sustain(x) => value.sustain = Some(x),
            Control::Release(x) => value.release = Some(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_of_a4() {
        let a4 = EventValue::note(69.0);
        assert!((a4.frequency().unwrap() - 440.0).abs() < 1e-9);

        let a5 = EventValue::note(81.0);
        assert!((a5.frequency().unwrap() - 880.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_value_has_no_frequency() {
        let bd = EventValue::sample("bd", 0);
        assert_eq!(bd.frequency(), None);
        assert_eq!(bd.sample.as_deref(), Some("bd"));
    }

    #[test]
    fn test_control_overlay() {
        let mut value = EventValue::sample("sd", 0);
        Control::Gain(0.9).apply(&mut value);
        Control::Pan(-0.5).apply(&mut value);
        Control::Lpf(800.0).apply(&mut value);

        assert_eq!(value.gain, Some(0.9));
        assert_eq!(value.pan, Some(-0.5));
        assert_eq!(value.lpf, Some(800.0));
        assert_eq!(value.hpf, None);
    }
}
