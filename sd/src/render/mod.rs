//! Render pipeline: pattern evaluation, offline audio synthesis, WAV
//! encoding

mod engine;
mod graph;
pub mod pattern;
mod samples;
mod synth;
mod validate;
pub mod wav;

pub use engine::{RenderEngine, RenderEngineConfig};
pub use graph::{OfflineGraph, RenderAborted, ScheduledSource, SourceKind, GAIN_FLOOR, LPF_FLOOR_HZ};
pub use samples::{SampleBuffer, SampleCache, SampleError};
pub use synth::{fallback_model, note_model, Adsr, SynthModel, Waveform};
pub use validate::{source_hash, ValidationOutcome, Validator};
