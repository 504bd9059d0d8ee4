//! Per-destination fairness window.
//!
//! A worker delivers for one destination until it has handled
//! `fair_file_limit` entries or spent `fair_time_limit_ms`, whichever comes
//! first, then yields so other destinations get a turn.

use std::time::{Duration, SystemTime};

use crate::snapshot::Timers;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FairnessWindow {
    files: u32,
    started: Option<SystemTime>,
}

impl FairnessWindow {
    /// Open a new window at `now`.
    pub fn start(&mut self, now: SystemTime) {
        self.files = 0;
        self.started = Some(now);
    }

    pub fn close(&mut self) {
        self.started = None;
    }

    pub const fn record_file(&mut self) {
        self.files = self.files.saturating_add(1);
    }

    #[must_use]
    pub const fn files(&self) -> u32 {
        self.files
    }

    #[must_use]
    pub const fn started(&self) -> Option<SystemTime> {
        self.started
    }

    /// Whether the worker holding this window should yield.
    ///
    /// A window that was never opened counts as exhausted.
    #[must_use]
    pub fn exhausted(&self, timers: &Timers, now: SystemTime) -> bool {
        let Some(started) = self.started else {
            return true;
        };

        if self.files >= timers.fair_file_limit {
            return true;
        }

        now.duration_since(started)
            .is_ok_and(|spent| spent >= Duration::from_millis(timers.fair_time_limit_ms))
    }
}
