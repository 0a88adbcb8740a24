//! Render pipeline engine
//!
//! Drives a render job from `queued` through `validating` and `rendering`
//! to a terminal state: evaluate the pattern, query its events, schedule
//! them on the offline graph, render with progress 10-90%, encode to WAV,
//! and persist the result. The offline render and the encode are wrapped in
//! individual timeouts; cancellation is checked between event batches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{AudioMetadata, JobId, JobStatus, RenderJob, RenderResult, RenderTiming};
use crate::error::{ErrorCode, JobError, JobFailure};
use crate::events::{JobEvent, ProgressBus};
use crate::sched::{ExecutionResult, JobExecutor};
use crate::store::JobStore;

use super::graph::{OfflineGraph, ScheduledSource, SourceKind, GAIN_FLOOR};
use super::pattern::{self, Fraction};
use super::samples::SampleCache;
use super::synth::{fallback_model, note_model, Adsr};
use super::validate::Validator;
use super::wav;

/// Render engine tuning
#[derive(Debug, Clone)]
pub struct RenderEngineConfig {
    pub max_pattern_length: usize,
    pub render_timeout: Duration,
    pub encode_timeout: Duration,
}

impl Default for RenderEngineConfig {
    fn default() -> Self {
        Self {
            max_pattern_length: 50_000,
            render_timeout: Duration::from_secs(60),
            encode_timeout: Duration::from_secs(10),
        }
    }
}

/// Executor for the render job family
pub struct RenderEngine {
    store: JobStore,
    bus: Arc<ProgressBus>,
    samples: Arc<SampleCache>,
    validator: Validator,
    config: RenderEngineConfig,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RenderEngine {
    pub fn new(store: JobStore, bus: Arc<ProgressBus>, samples: Arc<SampleCache>, config: RenderEngineConfig) -> Self {
        let validator = Validator::new(store.clone(), config.max_pattern_length);
        Self {
            store,
            bus,
            samples,
            validator,
            config,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the job with the given error, persisting best-effort
    async fn settle_failed(&self, mut job: RenderJob, status: JobStatus, error: JobError) -> ExecutionResult {
        let failure = error.into_failure();
        job.error = Some(failure.clone());
        if !job.meta.set_status(status) {
            warn!(id = %job.meta.id, from = %job.meta.status, to = %status, "illegal terminal transition");
        }
        if let Err(e) = self.store.put_render(&job).await {
            warn!(id = %job.meta.id, error = %e, "failed persisting terminal render state");
        }
        ExecutionResult::Terminal(JobEvent::failed(status, failure))
    }

    async fn run(&self, job_id: &JobId) -> ExecutionResult {
        let total_start = Instant::now();

        let Ok(Some(mut job)) = self.store.get_render(job_id).await else {
            return ExecutionResult::Dropped;
        };
        if job.meta.status != JobStatus::Queued {
            debug!(id = %job_id, status = %job.meta.status, "render job not in queued state, dropping");
            return ExecutionResult::Dropped;
        }

        // --- Validation phase ---
        job.meta.set_status(JobStatus::Validating);
        if let Err(e) = self.store.put_render(&job).await {
            return self.settle_failed(job, JobStatus::Failed, e).await;
        }
        self.bus
            .emit(job_id.as_str(), JobEvent::progress(JobStatus::Validating, 5));

        let validate_start = Instant::now();
        let outcome = self.validator.validate(&job.code).await;
        let validate_ms = validate_start.elapsed().as_millis() as u64;
        job.validation = Some(outcome.report.clone());

        if let Some(error) = outcome.error {
            return self.settle_failed(job, JobStatus::Failed, error).await;
        }

        // --- Rendering phase ---
        job.meta.set_status(JobStatus::Rendering);
        job.meta.set_progress(10);
        if let Err(e) = self.store.put_render(&job).await {
            return self.settle_failed(job, JobStatus::Failed, e).await;
        }
        self.bus
            .emit(job_id.as_str(), JobEvent::progress(JobStatus::Rendering, 10));

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .await
            .insert(job_id.as_str().to_string(), cancel.clone());

        let result = self.render_job(&job, &cancel).await;
        self.cancels.lock().await.remove(job_id.as_str());

        match result {
            Ok((audio_base64, metadata, render_ms, encode_ms)) => {
                let timing = RenderTiming {
                    validate_ms,
                    render_ms,
                    encode_ms,
                    total_ms: total_start.elapsed().as_millis() as u64,
                };
                job.result = Some(RenderResult {
                    audio_base64,
                    metadata,
                    timing,
                });
                job.meta.set_status(JobStatus::Completed);
                if let Err(e) = self.store.put_render(&job).await {
                    return self.settle_failed(job, JobStatus::Failed, e).await;
                }
                let payload = serde_json::to_value(job.result.as_ref()).unwrap_or_default();
                ExecutionResult::Terminal(JobEvent::completed(payload))
            }
            Err(RenderStop::Cancelled) => {
                job.meta.set_status(JobStatus::Cancelled);
                if let Err(e) = self.store.put_render(&job).await {
                    warn!(id = %job_id, error = %e, "failed persisting cancelled render");
                }
                ExecutionResult::Terminal(JobEvent::Terminal {
                    status: JobStatus::Cancelled,
                    result: None,
                    error: None,
                })
            }
            Err(RenderStop::Error(error)) => self.settle_failed(job, JobStatus::Failed, error).await,
        }
    }

    async fn render_job(
        &self,
        job: &RenderJob,
        cancel: &Arc<AtomicBool>,
    ) -> Result<(String, AudioMetadata, u64, u64), RenderStop> {
        let options = &job.options;
        let cps = options.tempo.map(|t| t / 120.0).unwrap_or(0.5);
        let duration = options.duration;

        let evaluated = pattern::evaluate(&job.code)
            .map_err(|e| RenderStop::Error(JobError::user(ErrorCode::RenderError, e.to_string())))?;

        // Query every event in the requested window of cycle time
        let arc_end = Fraction::from_f64(duration * cps);
        let haps = evaluated.query_arc(Fraction::ZERO, arc_end);

        let mut graph = OfflineGraph::new(options.sample_rate, options.channels, duration);
        for hap in haps.iter().filter(|h| h.has_onset()) {
            if cancel.load(Ordering::Relaxed) {
                return Err(RenderStop::Cancelled);
            }

            let onset_sec = hap.whole.begin.to_f64() / cps;
            if onset_sec >= duration {
                continue;
            }
            let event_sec = (hap.whole.duration().to_f64() / cps).max(0.01);
            let value = &hap.value;

            let kind = if let Some(name) = &value.sample {
                match self.samples.get(name, value.sample_index).await {
                    Ok(buffer) => SourceKind::Buffer {
                        samples: Arc::new(buffer.samples.clone()),
                        sample_rate: buffer.sample_rate,
                    },
                    Err(e) => {
                        // Degrade to the synthesized instrument table
                        debug!(sample = %name, error = %e, "sample unavailable, using synthesized fallback");
                        SourceKind::Synth(fallback_model(name))
                    }
                }
            } else if let Some(freq) = value.frequency() {
                let adsr = Adsr {
                    attack: value.attack.unwrap_or(0.01),
                    decay: value.decay.unwrap_or(0.05),
                    sustain: value.sustain.unwrap_or(0.7),
                    release: value.release.unwrap_or(0.1),
                };
                SourceKind::Synth(note_model(freq, event_sec, adsr))
            } else {
                continue;
            };

            graph.schedule(ScheduledSource {
                start_sec: onset_sec,
                kind,
                gain: value.gain.unwrap_or(0.5).max(GAIN_FLOOR),
                pan: value.pan.unwrap_or(0.0).clamp(-1.0, 1.0),
                lpf: value.lpf,
                hpf: value.hpf,
                room: value.room.unwrap_or(0.0).clamp(0.0, 1.0),
                delay: value.delay.unwrap_or(0.0).clamp(0.0, 1.0),
            });
        }

        // --- Offline render, under its own deadline ---
        let render_start = Instant::now();
        let abort = Arc::new(AtomicBool::new(false));
        let samples = {
            let graph_cancel = cancel.clone();
            let graph_abort = abort.clone();
            let bus = self.bus.clone();
            let job_id = job.meta.id.as_str().to_string();
            let last_emitted = Arc::new(AtomicU8::new(10));

            let handle = tokio::task::spawn_blocking(move || {
                graph.render(|fraction| {
                    // Map source progress onto the 10..=90 band
                    let pct = (10.0 + fraction * 80.0) as u8;
                    let last = last_emitted.load(Ordering::Relaxed);
                    if pct >= last + 5 {
                        last_emitted.store(pct, Ordering::Relaxed);
                        bus.emit(&job_id, JobEvent::progress(JobStatus::Rendering, pct));
                    }
                    !(graph_cancel.load(Ordering::Relaxed) || graph_abort.load(Ordering::Relaxed))
                })
            });

            match tokio::time::timeout(self.config.render_timeout, handle).await {
                Ok(Ok(Ok(samples))) => samples,
                Ok(Ok(Err(_aborted))) => {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(RenderStop::Cancelled);
                    }
                    return Err(RenderStop::Error(JobError::deadline("render aborted")));
                }
                Ok(Err(join_err)) => {
                    return Err(RenderStop::Error(JobError::fatal(
                        ErrorCode::RenderError,
                        join_err.to_string(),
                    )));
                }
                Err(_elapsed) => {
                    // Let the blocking task notice and unwind
                    abort.store(true, Ordering::Relaxed);
                    return Err(RenderStop::Error(JobError::deadline(format!(
                        "offline render exceeded {:?}",
                        self.config.render_timeout
                    ))));
                }
            }
        };
        let render_ms = render_start.elapsed().as_millis() as u64;

        // --- Encode, under its own deadline ---
        let encode_start = Instant::now();
        let sample_rate = options.sample_rate;
        let channels = options.channels;
        let encode_handle =
            tokio::task::spawn_blocking(move || {
                let bytes = wav::encode(&samples, sample_rate, channels);
                let encoded = BASE64.encode(&bytes);
                (encoded, bytes.len())
            });
        let (audio_base64, file_size) = match tokio::time::timeout(self.config.encode_timeout, encode_handle).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(join_err)) => {
                return Err(RenderStop::Error(JobError::fatal(
                    ErrorCode::RenderError,
                    join_err.to_string(),
                )));
            }
            Err(_elapsed) => {
                return Err(RenderStop::Error(JobError::deadline(format!(
                    "wav encode exceeded {:?}",
                    self.config.encode_timeout
                ))));
            }
        };
        let encode_ms = encode_start.elapsed().as_millis() as u64;

        self.bus
            .emit(job.meta.id.as_str(), JobEvent::progress(JobStatus::Rendering, 95));

        let metadata = AudioMetadata {
            duration,
            sample_rate,
            channels,
            format: "wav".to_string(),
            file_size,
        };
        Ok((audio_base64, metadata, render_ms, encode_ms))
    }
}

enum RenderStop {
    Cancelled,
    Error(JobError),
}

#[async_trait]
impl JobExecutor for RenderEngine {
    async fn execute(&self, job_id: &JobId) -> ExecutionResult {
        self.run(job_id).await
    }

    async fn cancel(&self, job_id: &JobId) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(job_id.as_str()) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, RenderOptions};
    use kvstore::MemoryKv;

    fn engine_with(config: RenderEngineConfig) -> (Arc<RenderEngine>, JobStore, Arc<ProgressBus>) {
        let store = JobStore::new(Arc::new(MemoryKv::new()));
        let bus = Arc::new(ProgressBus::new());
        let dir = std::env::temp_dir().join("studiod-test-samples-none");
        // Unroutable sample repo: every sample miss exercises the synthesized
        // fallback
        let samples = Arc::new(SampleCache::new("http://127.0.0.1:1/samples", dir));
        let engine = Arc::new(RenderEngine::new(store.clone(), bus.clone(), samples, config));
        (engine, store, bus)
    }

    async fn queued_job(store: &JobStore, code: &str, options: RenderOptions) -> JobId {
        let mut job = RenderJob::new("u1", code, options, Priority::default());
        job.meta.set_status(JobStatus::Queued);
        store.put_render(&job).await.unwrap();
        job.meta.id.clone()
    }

    #[tokio::test]
    async fn test_successful_render() {
        let (engine, store, _bus) = engine_with(RenderEngineConfig::default());
        let id = queued_job(&store, "s(\"bd sd bd sd\")", RenderOptions::new(4.0, 22050, 2)).await;

        let result = engine.execute(&id).await;
        let ExecutionResult::Terminal(event) = result else {
            panic!("expected terminal result");
        };
        assert!(matches!(
            event,
            JobEvent::Terminal {
                status: JobStatus::Completed,
                ..
            }
        ));

        let job = store.get_render(&id).await.unwrap().unwrap();
        assert_eq!(job.meta.status, JobStatus::Completed);
        assert_eq!(job.meta.progress, 100);

        let result = job.result.unwrap();
        assert_eq!(result.metadata.duration, 4.0);
        assert_eq!(result.metadata.sample_rate, 22050);
        assert!(result.metadata.file_size > wav::HEADER_BYTES);
        assert!(!result.audio_base64.is_empty());

        // The payload decodes back to the advertised WAV
        let bytes = BASE64.decode(&result.audio_base64).unwrap();
        assert_eq!(bytes.len(), result.metadata.file_size);
        let decoded = wav::decode(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.samples.len(), (4.0 * 22050.0) as usize * 2);
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_with_syntax_error() {
        let (engine, store, _bus) = engine_with(RenderEngineConfig::default());
        let id = queued_job(&store, "s(\"bd\" &&", RenderOptions::new(1.0, 22050, 1)).await;

        let ExecutionResult::Terminal(event) = engine.execute(&id).await else {
            panic!("expected terminal result");
        };
        let JobEvent::Terminal { status, error, .. } = event else {
            panic!("expected terminal event");
        };
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.unwrap().code, ErrorCode::SyntaxError);

        let job = store.get_render(&id).await.unwrap().unwrap();
        assert_eq!(job.meta.status, JobStatus::Failed);
        assert!(!job.validation.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_render_timeout_fails_with_timeout_error() {
        let config = RenderEngineConfig {
            render_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let (engine, store, _bus) = engine_with(config);
        // Enough scheduled events to keep the renderer busy past 1ms
        let id = queued_job(
            &store,
            "s(\"bd*16 sd*16 hh*16 oh*16\")",
            RenderOptions::new(60.0, 96000, 2),
        )
        .await;

        let ExecutionResult::Terminal(event) = engine.execute(&id).await else {
            panic!("expected terminal result");
        };
        let JobEvent::Terminal { status, error, .. } = event else {
            panic!("expected terminal event");
        };
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(error.unwrap().code, ErrorCode::TimeoutError);
    }

    #[tokio::test]
    async fn test_cancel_during_render() {
        let (engine, store, _bus) = engine_with(RenderEngineConfig::default());
        let id = queued_job(
            &store,
            "s(\"bd*16 sd*16 hh*16 oh*16\")",
            RenderOptions::new(120.0, 96000, 2),
        )
        .await;

        let runner = engine.clone();
        let run_id = id.clone();
        let handle = tokio::spawn(async move { runner.execute(&run_id).await });

        // Wait for the cancel flag to register, then flip it
        let mut cancelled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.cancel(&id).await {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled, "cancel flag never registered");

        let ExecutionResult::Terminal(event) = handle.await.unwrap() else {
            panic!("expected terminal result");
        };
        let JobEvent::Terminal { status, .. } = event else {
            panic!("expected terminal event");
        };
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_events_cover_render_band() {
        let (engine, store, bus) = engine_with(RenderEngineConfig::default());
        let id = queued_job(&store, "s(\"bd*8 sd*8\")", RenderOptions::new(4.0, 22050, 2)).await;
        let mut rx = bus.subscribe(id.as_str());

        engine.execute(&id).await;

        let mut progresses = Vec::new();
        let mut saw_terminal = false;
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Progress { progress, .. } => progresses.push(progress),
                JobEvent::Terminal { .. } => {
                    saw_terminal = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_terminal);
        // Ordered and within the documented bands
        assert!(progresses.windows(2).all(|w| w[0] <= w[1]));
        assert!(progresses.contains(&10));
    }

    #[tokio::test]
    async fn test_dropped_when_not_queued() {
        let (engine, store, _bus) = engine_with(RenderEngineConfig::default());
        let mut job = RenderJob::new("u1", "s(\"bd\")", RenderOptions::new(1.0, 22050, 1), Priority::default());
        job.meta.set_status(JobStatus::Queued);
        job.meta.set_status(JobStatus::Cancelled);
        store.put_render(&job).await.unwrap();

        assert!(matches!(
            engine.execute(&job.meta.id).await,
            ExecutionResult::Dropped
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_false() {
        let (engine, _store, _bus) = engine_with(RenderEngineConfig::default());
        assert!(!engine.cancel(&JobId::from("render-nope")).await);
    }
}
