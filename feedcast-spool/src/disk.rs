//! Free-disk backpressure for the ingest path.
//!
//! Delivery keeps draining the spool regardless of free space; only the
//! acceptance of new files is gated here.

use std::{ffi::CString, os::unix::ffi::OsStrExt, path::Path};

use feedcast_common::internal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolError, ValidationError};

const fn default_free_disk_start() -> f64 {
    0.05
}

const fn default_free_disk_stop() -> f64 {
    0.2
}

/// Free-space hysteresis band, as fractions of the filesystem size.
///
/// Ingest stops once the free fraction drops below `free_disk_start` and
/// resumes once it climbs above `free_disk_stop`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskThresholds {
    #[serde(default = "default_free_disk_start")]
    pub free_disk_start: f64,
    #[serde(default = "default_free_disk_stop")]
    pub free_disk_stop: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            free_disk_start: default_free_disk_start(),
            free_disk_stop: default_free_disk_stop(),
        }
    }
}

impl DiskThresholds {
    /// # Errors
    /// If either fraction is outside `0.0..=1.0` or the band is inverted.
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);

        if !in_range(self.free_disk_start) || !in_range(self.free_disk_stop) {
            return Err(ValidationError::InvalidThresholds(format!(
                "fractions must lie in 0.0..=1.0 (start {}, stop {})",
                self.free_disk_start, self.free_disk_stop
            ))
            .into());
        }

        if self.free_disk_start > self.free_disk_stop {
            return Err(ValidationError::InvalidThresholds(format!(
                "free_disk_start {} exceeds free_disk_stop {}",
                self.free_disk_start, self.free_disk_stop
            ))
            .into());
        }

        Ok(())
    }
}

#[derive(Debug)]
struct MonitorState {
    thresholds: DiskThresholds,
    accepting: bool,
    last_free: Option<f64>,
}

/// Tracks whether the node should accept new files.
#[derive(Debug)]
pub struct DiskMonitor {
    state: Mutex<MonitorState>,
}

impl DiskMonitor {
    #[must_use]
    pub fn new(thresholds: DiskThresholds) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                thresholds,
                accepting: true,
                last_free: None,
            }),
        }
    }

    /// Feed one free-space observation through the hysteresis band and return
    /// the resulting acceptance state.
    pub fn observe(&self, free_fraction: f64) -> bool {
        let mut state = self.state.lock();
        state.last_free = Some(free_fraction);

        let DiskThresholds {
            free_disk_start,
            free_disk_stop,
        } = state.thresholds;

        if state.accepting && free_fraction < free_disk_start {
            state.accepting = false;
            internal!(
                level = WARN,
                "Free disk {:.1}% below {:.1}%, refusing new files",
                free_fraction * 100.0,
                free_disk_start * 100.0
            );
        } else if !state.accepting && free_fraction > free_disk_stop {
            state.accepting = true;
            internal!(
                level = INFO,
                "Free disk {:.1}% above {:.1}%, accepting new files again",
                free_fraction * 100.0,
                free_disk_stop * 100.0
            );
        }

        state.accepting
    }

    /// Measure the filesystem holding `path` and observe the result.
    ///
    /// # Errors
    /// If the filesystem cannot be queried.
    pub fn check(&self, path: &Path) -> Result<bool> {
        let free = free_fraction(path)?;
        Ok(self.observe(free))
    }

    pub fn accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn last_free_fraction(&self) -> Option<f64> {
        self.state.lock().last_free
    }

    pub fn thresholds(&self) -> DiskThresholds {
        self.state.lock().thresholds
    }

    /// Swap in new thresholds; the acceptance state is re-evaluated on the
    /// next observation.
    pub fn set_thresholds(&self, thresholds: DiskThresholds) {
        self.state.lock().thresholds = thresholds;
    }
}

impl Default for DiskMonitor {
    fn default() -> Self {
        Self::new(DiskThresholds::default())
    }
}

/// Fraction of the filesystem at `path` available to unprivileged writers.
///
/// # Errors
/// If `statvfs` fails or the path contains a NUL byte.
pub fn free_fraction(path: &Path) -> Result<f64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SpoolError::InvalidName(path.display().to_string()))?;

    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` points to
    // writable memory large enough for a `statvfs`.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // SAFETY: statvfs returned 0, so the struct was fully initialised.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::cast_precision_loss, clippy::unnecessary_cast)]
    let (available, total) = (stat.f_bavail as f64, stat.f_blocks as f64);

    if total <= 0.0 {
        return Ok(1.0);
    }

    Ok(available / total)
}
