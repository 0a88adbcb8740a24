//! Sample Cache
//!
//! Read-through cache of decoded sample buffers keyed by `(name, index)`.
//! Lookup order: in-memory map, file cache under a temp directory, remote
//! sample repository. Concurrent misses for one key coalesce through a
//! per-key once-cell so exactly one fetch-and-decode runs no matter how
//! many callers wait. The in-memory map has no eviction; the set is bounded
//! by the sound library.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use super::wav;

/// Embedded sound-library mapping: sample name to file count
///
/// Files live at `<base>/<name>/<index>.wav`; an out-of-range index wraps,
/// matching the pattern language's `:n` convention.
const SOUND_LIBRARY: [(&str, usize); 20] = [
    ("bd", 24),
    ("sd", 20),
    ("hh", 13),
    ("oh", 4),
    ("cp", 2),
    ("rim", 4),
    ("arpy", 11),
    ("casio", 3),
    ("jazz", 8),
    ("metal", 10),
    ("perc", 6),
    ("tabla", 26),
    ("east", 9),
    ("crow", 4),
    ("insect", 3),
    ("wind", 10),
    ("jvbass", 13),
    ("bass", 4),
    ("drum", 6),
    ("glitch", 8),
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A decoded, mono sample ready for the graph
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Error)]
pub enum SampleError {
    #[error("sample '{0}' is not in the sound library")]
    UnknownSample(String),

    #[error("fetch failed for {path}: {reason}")]
    Fetch { path: String, reason: String },

    #[error("decode failed for {path}: {reason}")]
    Decode { path: String, reason: String },
}

type Key = (String, usize);

/// Read-through sample cache
pub struct SampleCache {
    client: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
    cells: Mutex<HashMap<Key, Arc<OnceCell<Arc<SampleBuffer>>>>>,
    fetches: AtomicU64,
}

impl SampleCache {
    pub fn new(base_url: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_dir,
            cells: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Whether the static mapping knows this sample name (synchronous)
    pub fn has_sample(name: &str) -> bool {
        SOUND_LIBRARY.iter().any(|(n, _)| *n == name)
    }

    /// Remote fetches performed so far (one per cold key)
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetch-or-load the buffer for `(name, index)`
    ///
    /// All concurrent callers for one key share a single load; the winner's
    /// buffer (or error) is what everyone sees. Errors are not cached, so a
    /// later call retries.
    pub async fn get(&self, name: &str, index: usize) -> Result<Arc<SampleBuffer>, SampleError> {
        let count = SOUND_LIBRARY
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, count)| *count)
            .ok_or_else(|| SampleError::UnknownSample(name.to_string()))?;
        let index = index % count.max(1);
        let key = (name.to_string(), index);

        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let buffer = cell
            .get_or_try_init(|| self.load(name, index))
            .await?
            .clone();
        Ok(buffer)
    }

    async fn load(&self, name: &str, index: usize) -> Result<Arc<SampleBuffer>, SampleError> {
        let rel_path = format!("{}/{}.wav", name, index);

        // File cache first
        let cached = self.cache_dir.join(format!("{}_{}.wav", name, index));
        if let Ok(bytes) = tokio::fs::read(&cached).await {
            debug!(%rel_path, "sample file-cache hit");
            return decode_mono(&bytes, &rel_path).map(Arc::new);
        }

        // Remote repository
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), rel_path);
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(%url, "fetching sample");

        let response = self
            .client
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SampleError::Fetch {
                path: rel_path.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(SampleError::Fetch {
                path: rel_path.clone(),
                reason: format!("status {}", response.status()),
            });
        }
        let bytes = response.bytes().await.map_err(|e| SampleError::Fetch {
            path: rel_path.clone(),
            reason: e.to_string(),
        })?;

        let buffer = decode_mono(&bytes, &rel_path)?;

        // Persist to the file cache, best effort
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            warn!(error = %e, "could not create sample cache dir");
        } else if let Err(e) = tokio::fs::write(&cached, &bytes).await {
            warn!(error = %e, path = %cached.display(), "could not persist sample to file cache");
        }

        Ok(Arc::new(buffer))
    }
}

/// Decode WAV bytes and fold to mono
fn decode_mono(bytes: &[u8], path: &str) -> Result<SampleBuffer, SampleError> {
    let decoded = wav::decode(bytes).map_err(|e| SampleError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    let samples = if decoded.channels <= 1 {
        decoded.samples
    } else {
        let ch = decoded.channels as usize;
        decoded
            .samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    };

    Ok(SampleBuffer {
        samples,
        sample_rate: decoded.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_cache(dir: &tempfile::TempDir) -> SampleCache {
        // Unroutable base URL: any remote fetch in tests fails fast rather
        // than hitting the network
        SampleCache::new("http://127.0.0.1:1/samples", dir.path().to_path_buf())
    }

    fn seed_file(dir: &tempfile::TempDir, name: &str, index: usize, value: f32) {
        let bytes = wav::encode(&[value; 64], 44100, 1);
        std::fs::write(dir.path().join(format!("{}_{}.wav", name, index)), bytes).unwrap();
    }

    #[test]
    fn test_has_sample_answers_from_static_mapping() {
        assert!(SampleCache::has_sample("bd"));
        assert!(SampleCache::has_sample("tabla"));
        assert!(!SampleCache::has_sample("no-such-sample"));
    }

    #[tokio::test]
    async fn test_unknown_sample_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);
        assert!(matches!(
            cache.get("no-such-sample", 0).await,
            Err(SampleError::UnknownSample(_))
        ));
    }

    #[tokio::test]
    async fn test_file_cache_hit_avoids_fetch() {
        let dir = tempfile::tempdir().unwrap();
        seed_file(&dir, "bd", 0, 0.25);
        let cache = seeded_cache(&dir);

        let buffer = cache.get("bd", 0).await.unwrap();
        assert_eq!(buffer.sample_rate, 44100);
        assert_eq!(buffer.samples.len(), 64);
        assert_eq!(cache.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_cache_returns_same_buffer() {
        let dir = tempfile::tempdir().unwrap();
        seed_file(&dir, "sd", 0, 0.5);
        let cache = seeded_cache(&dir);

        let first = cache.get("sd", 0).await.unwrap();
        // Remove the file; the second get must come from memory
        std::fs::remove_file(dir.path().join("sd_0.wav")).unwrap();
        let second = cache.get("sd", 0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_index_wraps_at_library_count() {
        let dir = tempfile::tempdir().unwrap();
        // cp has 2 files; index 5 wraps to 1
        seed_file(&dir, "cp", 1, 0.1);
        let cache = seeded_cache(&dir);

        let buffer = cache.get("cp", 5).await.unwrap();
        assert_eq!(buffer.samples.len(), 64);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce_to_one_load() {
        let dir = tempfile::tempdir().unwrap();
        seed_file(&dir, "hh", 0, 0.3);
        let cache = Arc::new(seeded_cache(&dir));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("hh", 0).await }));
        }

        let mut buffers = Vec::new();
        for handle in handles {
            buffers.push(handle.await.unwrap().unwrap());
        }
        // Every waiter got the very same allocation
        for buffer in &buffers[1..] {
            assert!(Arc::ptr_eq(&buffers[0], buffer));
        }
        assert_eq!(cache.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_transient_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir);

        // No file cached and the remote is unroutable
        let err = cache.get("bd", 1).await.unwrap_err();
        assert!(matches!(err, SampleError::Fetch { .. }));
        let fetches_after_first = cache.fetch_count();
        assert!(fetches_after_first >= 1);

        // A later call retries rather than serving a cached error
        let _ = cache.get("bd", 1).await.unwrap_err();
        assert!(cache.fetch_count() > fetches_after_first);
    }

    #[test]
    fn test_decode_mono_folds_stereo() {
        let stereo = wav::encode(&[1.0, 0.0, 1.0, 0.0], 44100, 2);
        let buffer = decode_mono(&stereo, "x").unwrap();
        assert_eq!(buffer.samples.len(), 2);
        assert!((buffer.samples[0] - 0.5).abs() < 1e-3);
    }
}
