//! Progress Bus - per-job fan-out of queue/progress/terminal events
//!
//! Unlike a plain broadcast channel, the registry keeps the terminal
//! snapshot per job so a subscriber arriving after completion still receives
//! exactly one terminal event before its stream closes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use super::JobEvent;

/// Events buffered per subscriber before oldest-first drops of non-terminal
/// events
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct JobChannel {
    subscribers: Vec<mpsc::Sender<JobEvent>>,
    terminal: Option<JobEvent>,
}

/// In-process per-job event fan-out
///
/// Delivery is ordered per job: emit holds the registry lock while pushing
/// into subscriber buffers, so no two events for one job can interleave.
pub struct ProgressBus {
    channels: Mutex<HashMap<String, JobChannel>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a job's event stream
    ///
    /// If the job already reached a terminal state, the stored terminal
    /// snapshot is delivered immediately and the stream closes after it.
    pub fn subscribe(&self, job_id: &str) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels.entry(job_id.to_string()).or_default();

        if let Some(terminal) = &channel.terminal {
            // Late subscriber: replay the snapshot, then drop the sender so
            // the stream closes after the terminal event
            let _ = tx.try_send(terminal.clone());
            debug!(%job_id, "late subscriber received terminal snapshot");
        } else {
            channel.subscribers.push(tx);
        }

        rx
    }

    /// Emit an event to every subscriber of the job
    ///
    /// A terminal event is recorded as the job's snapshot, delivered once,
    /// and closes all subscriber streams. Emitting anything after the
    /// terminal event is ignored, preserving the exactly-one-terminal
    /// guarantee.
    pub fn emit(&self, job_id: &str, event: JobEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels.entry(job_id.to_string()).or_default();

        if channel.terminal.is_some() {
            debug!(%job_id, event_type = event.event_type(), "dropping event after terminal");
            return;
        }

        let is_terminal = event.is_terminal();

        // Buffers are sized for bursts; a slow subscriber loses intermediate
        // progress (at-least-once progress is not per-event) but terminal
        // delivery is handled below
        channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%job_id, "subscriber buffer full, dropping event for it");
                !is_terminal
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if is_terminal {
            channel.terminal = Some(event);
            // Dropping the senders closes every subscriber stream
            channel.subscribers.clear();
        }
    }

    /// Whether the bus already holds a terminal snapshot for the job
    pub fn is_terminal(&self, job_id: &str) -> bool {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(job_id).is_some_and(|c| c.terminal.is_some())
    }

    /// Drop a job's registry entry (after TTL eviction of its record)
    pub fn forget(&self, job_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(job_id);
    }

    /// Number of live subscribers across all jobs
    pub fn subscriber_count(&self) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.values().map(|c| c.subscribers.len()).sum()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
