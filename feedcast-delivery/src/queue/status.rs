use std::time::SystemTime;

use serde::Serialize;

/// Point-in-time view of one destination queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub destination: String,
    /// Committed entries in the spool, including any in flight
    pub pending: usize,
    pub in_flight: usize,
    pub failed: bool,
    /// Whether the destination is still inside its backoff pause
    pub backing_off: bool,
    pub resume_at: Option<SystemTime>,
    /// Consecutive failures since the last success
    pub failures: u32,
    pub last_error: Option<String>,
}

impl QueueStatus {
    /// Seconds until the destination may be retried, if it is paused.
    #[must_use]
    pub fn resume_in_secs(&self, now: SystemTime) -> Option<u64> {
        if !self.backing_off {
            return None;
        }

        self.resume_at
            .and_then(|resume_at| resume_at.duration_since(now).ok())
            .map(|wait| wait.as_secs())
    }
}
