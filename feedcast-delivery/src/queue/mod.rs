//! Per-destination delivery queue
//!
//! A [`DeliveryQueue`] owns one destination's spool directory and the
//! destination-wide retry state. The spool directory is the queue: entries are
//! rescanned on demand and attempted oldest first. A failure pauses the whole
//! destination, because a destination that is down is down for every pending
//! file, and redelivery after the pause starts again from the oldest entry.
//!
//! State is guarded by a lock scoped to this destination and never held
//! across an await point. Outcomes recorded for an entry that is no longer in
//! flight (it was cancelled meanwhile) are ignored.

pub mod status;

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use ahash::AHashSet;
use feedcast_common::{
    audit::{self, ExpiryReason},
    internal, time,
};
use feedcast_spool::{PublishId, SpoolEntry, SpoolStore};
use feedcast_tracing::traced;
use parking_lot::Mutex;

pub use self::status::QueueStatus;
use crate::{
    destination::DestinationInfo,
    error::{DeliveryError, SystemError, TransientError},
    policy::{BackoffPolicy, FairnessWindow},
    redirect::RedirectCache,
    snapshot::{ProvisioningSnapshot, SnapshotHandle},
    task::{DeliveryTask, relay_base},
};

#[derive(Debug, Default)]
struct QueueState {
    failed: bool,
    resume_at: Option<SystemTime>,
    /// Consecutive failures since the last success.
    failures: u32,
    /// Pause applied after the most recent failure.
    fail_delay_ms: u64,
    last_error: Option<String>,
    fairness: FairnessWindow,
    /// Scheduler turn in which a worker last handed this queue back; 0 if
    /// never served.
    last_turn: u64,
    in_flight: AHashSet<SpoolEntry>,
}

impl QueueState {
    fn backing_off(&self, now: SystemTime) -> bool {
        self.failed && self.resume_at.is_some_and(|resume_at| now < resume_at)
    }
}

/// Delivery queue for one destination
#[derive(Debug)]
pub struct DeliveryQueue {
    name: String,
    spool: SpoolStore,
    snapshot: SnapshotHandle,
    redirects: Arc<RedirectCache>,
    state: Mutex<QueueState>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        spool: SpoolStore,
        snapshot: SnapshotHandle,
        redirects: Arc<RedirectCache>,
    ) -> Self {
        Self {
            name: name.into(),
            spool,
            snapshot,
            redirects,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Destination name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn spool(&self) -> &SpoolStore {
        &self.spool
    }

    /// The destination as currently provisioned.
    #[must_use]
    pub fn destination(&self) -> Option<Arc<DestinationInfo>> {
        self.snapshot.load().destination(&self.name).cloned()
    }

    /// Whether the destination is paused after a failure.
    #[must_use]
    pub fn is_backing_off(&self, now: SystemTime) -> bool {
        self.state.lock().backing_off(now)
    }

    /// The oldest entry that could be attempted now, without side effects.
    ///
    /// Returns `None` while the destination is backing off, when the spool is
    /// empty, or when it cannot be read.
    pub async fn peek_next(&self, now: SystemTime) -> Option<SpoolEntry> {
        if self.is_backing_off(now) {
            return None;
        }

        let pending = self.scan().await?;
        let state = self.state.lock();
        pending
            .into_iter()
            .find(|entry| !state.in_flight.contains(entry))
    }

    /// Build the task for the oldest eligible entry and mark it in flight.
    ///
    /// Entries past the expiration timer are removed and reported on the way.
    /// Entries whose sidecar has vanished or cannot be decoded are skipped.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(destination = %self.name)), timing(precision = "ms"))]
    pub async fn get_next(&self, now: SystemTime) -> Option<DeliveryTask> {
        if self.is_backing_off(now) {
            return None;
        }

        let snapshot = self.snapshot.load();
        let destination = snapshot.destination(&self.name).cloned()?;
        let timers = snapshot.timers();

        for entry in self.scan().await? {
            if self.state.lock().in_flight.contains(&entry) {
                continue;
            }

            let metadata = match self.spool.read_metadata(&entry).await {
                Ok(metadata) => metadata,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    internal!(
                        level = WARN,
                        "Skipping {entry} in {}: unreadable metadata: {e}",
                        self.name
                    );
                    continue;
                }
            };

            let age_ms = time::millis_between(time::from_millis(metadata.received_at_ms), now);
            if age_ms > timers.expiration_timer_ms {
                self.drop_entry(&entry, ExpiryReason::Expired, age_ms).await;
                continue;
            }

            let primary = Self::primary_base(&snapshot, &destination);
            let target = if destination.flags.follow_redirects {
                self.redirects
                    .lookup(destination.redirect_key(), &primary, now)
            } else {
                primary.clone()
            };

            if !self.state.lock().in_flight.insert(entry.clone()) {
                continue;
            }

            // A cancel between the scan and the in-flight mark has already
            // removed the files.
            if !self.spool.contains(&entry).await {
                self.state.lock().in_flight.remove(&entry);
                continue;
            }

            let attempt = {
                let mut state = self.state.lock();
                state.fairness.record_file();
                state.failures.saturating_add(1)
            };

            return Some(DeliveryTask::new(
                entry,
                destination,
                metadata,
                attempt,
                primary,
                target,
            ));
        }

        None
    }

    /// Relayed URL for node destinations with a next hop, otherwise the
    /// provisioned URL.
    fn primary_base(snapshot: &ProvisioningSnapshot, destination: &DestinationInfo) -> String {
        let Some(via) = destination
            .relay_node()
            .and_then(|node| snapshot.routes().next_hop(node))
        else {
            return destination.url.clone();
        };

        relay_base(&destination.url, via).unwrap_or_else(|| {
            internal!(
                level = WARN,
                "Cannot relay {} through {via}, delivering directly",
                destination.name
            );
            destination.url.clone()
        })
    }

    /// The destination accepted the file.
    ///
    /// Returns `false` if the entry was cancelled while in flight.
    pub async fn record_success(
        &self,
        task: &DeliveryTask,
        status: u16,
        elapsed: Duration,
    ) -> bool {
        if !self.release(task) {
            return false;
        }

        if let Err(e) = self.spool.remove(task.entry()).await {
            internal!(
                level = ERROR,
                "Delivered {} to {} but could not remove it from the spool: {e}",
                task.entry(),
                self.name
            );
        }

        {
            let mut state = self.state.lock();
            if state.failed {
                internal!(level = INFO, "Destination {} recovered", self.name);
            }
            state.failed = false;
            state.resume_at = None;
            state.failures = 0;
            state.fail_delay_ms = 0;
            state.last_error = None;
        }

        audit::log_delivery_success(
            task.publish_id().as_str(),
            &self.name,
            &task.target_url(),
            status,
            elapsed.as_millis(),
        );

        true
    }

    /// The destination answered with a redirect to `location`.
    ///
    /// Learns the redirect and returns the task to retry immediately against
    /// the new target. The failure counter is left alone.
    ///
    /// # Errors
    /// The failure to record instead when the destination does not follow
    /// redirects, the chain is longer than `max_redirects`, the location does
    /// not name this file, or the entry was cancelled meanwhile.
    pub async fn follow_redirect(
        &self,
        task: &DeliveryTask,
        status: u16,
        location: &str,
        max_redirects: u32,
        now: SystemTime,
    ) -> Result<DeliveryTask, DeliveryError> {
        if !self.state.lock().in_flight.contains(task.entry()) {
            return Err(SystemError::Cancelled(task.publish_id().to_string()).into());
        }

        let destination = task.destination();
        if !destination.flags.follow_redirects {
            return Err(DeliveryError::from_status(status));
        }

        if task.redirects() >= max_redirects {
            return Err(TransientError::TooManyRedirects(task.redirects().saturating_add(1)).into());
        }

        let Some(base) = task.redirect_base(location) else {
            return Err(TransientError::UnusableRedirect(location.to_string()).into());
        };

        if let Err(e) = self
            .redirects
            .redirect(destination.redirect_key(), task.primary_base(), &base, now)
            .await
        {
            internal!(level = WARN, "Redirect for {} not persisted: {e}", self.name);
        }

        Ok(task.redirected_to(base))
    }

    /// The attempt failed.
    ///
    /// A permanent rejection by a non-retryable destination drops the entry.
    /// Anything else pauses the destination under backoff and leaves the entry
    /// where it is. Returns `false` if the entry was cancelled while in flight.
    pub async fn record_failure(
        &self,
        task: &DeliveryTask,
        error: &DeliveryError,
        now: SystemTime,
    ) -> bool {
        if !self.release(task) {
            return false;
        }

        let destination = task.destination();
        let forgotten = if task.from_redirect() {
            self.redirects
                .forget(destination.redirect_key(), task.primary_base())
                .await
        } else {
            Ok(false)
        };
        if let Err(e) = forgotten {
            internal!(level = WARN, "Forgotten redirect for {} not persisted: {e}", self.name);
        }

        if error.is_permanent() && !destination.retryable {
            let age_ms = time::millis_between(time::from_millis(task.metadata().received_at_ms), now);
            self.drop_entry(task.entry(), ExpiryReason::NotRetryable, age_ms)
                .await;
            return true;
        }

        let policy = BackoffPolicy::from(self.snapshot.load().timers());
        let (failures, resume_in_ms) = {
            let mut state = self.state.lock();
            let delay_ms = policy.next_delay_ms(state.fail_delay_ms);
            let resume_at = policy.resume_at(now, delay_ms);

            state.failures = state.failures.saturating_add(1);
            state.fail_delay_ms = delay_ms;
            state.failed = true;
            state.resume_at = Some(resume_at);
            state.last_error = Some(error.to_string());

            (state.failures, time::millis_between(now, resume_at))
        };

        audit::log_delivery_failure(
            task.publish_id().as_str(),
            &self.name,
            &task.target_url(),
            &error.to_string(),
            failures,
            resume_in_ms,
        );

        true
    }

    /// Give up on an in-flight task without recording an outcome. Whatever is
    /// left of the entry stays spooled.
    pub fn abandon(&self, task: &DeliveryTask) {
        self.release(task);
    }

    /// Remove every pending entry with the given publish id.
    ///
    /// Safe to call while one of them is in flight: that attempt's outcome
    /// is then ignored. Returns how many entries were removed.
    pub async fn cancel_task(&self, publish_id: &PublishId) -> usize {
        let entries = match self.spool.find(publish_id).await {
            Ok(entries) => entries,
            Err(e) => {
                internal!(
                    level = ERROR,
                    "Cannot cancel {publish_id} for {}: {e}",
                    self.name
                );
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries {
            self.state.lock().in_flight.remove(&entry);

            match self.spool.remove(&entry).await {
                Ok(true) => {
                    removed += 1;
                    audit::log_delivery_cancelled(publish_id.as_str(), &self.name);
                }
                Ok(false) => {}
                Err(e) => internal!(
                    level = ERROR,
                    "Cannot remove cancelled {entry} for {}: {e}",
                    self.name
                ),
            }
        }

        removed
    }

    /// Clear the backoff pause and the failure history.
    pub fn reset_queue(&self) {
        let mut state = self.state.lock();
        state.failed = false;
        state.resume_at = None;
        state.failures = 0;
        state.fail_delay_ms = 0;
    }

    /// Open a fairness window for a worker turn starting at `now`.
    pub fn start_turn(&self, now: SystemTime) {
        self.state.lock().fairness.start(now);
    }

    /// Whether the worker holding this queue should hand it back.
    #[must_use]
    pub fn should_yield(&self, now: SystemTime) -> bool {
        let timers = *self.snapshot.load().timers();
        self.state.lock().fairness.exhausted(&timers, now)
    }

    /// Close the fairness window and remember `turn` as the last one in which
    /// this queue was served.
    pub fn end_turn(&self, turn: u64) {
        let mut state = self.state.lock();
        state.fairness.close();
        state.last_turn = turn;
    }

    /// Turn in which this queue was last served; 0 if never.
    #[must_use]
    pub fn last_turn(&self) -> u64 {
        self.state.lock().last_turn
    }

    /// Snapshot of this queue for operators.
    pub async fn status(&self, now: SystemTime) -> QueueStatus {
        let pending = self.scan().await.map_or(0, |entries| entries.len());
        let state = self.state.lock();

        QueueStatus {
            destination: self.name.clone(),
            pending,
            in_flight: state.in_flight.len(),
            failed: state.failed,
            backing_off: state.backing_off(now),
            resume_at: state.resume_at,
            failures: state.failures,
            last_error: state.last_error.clone(),
        }
    }

    async fn scan(&self) -> Option<Vec<SpoolEntry>> {
        match self.spool.list_pending().await {
            Ok(entries) => Some(entries),
            Err(e) => {
                internal!(
                    level = ERROR,
                    "Cannot scan spool {} for {}: {e}",
                    self.spool.path().display(),
                    self.name
                );
                None
            }
        }
    }

    async fn drop_entry(&self, entry: &SpoolEntry, reason: ExpiryReason, age_ms: u64) {
        match self.spool.remove(entry).await {
            Ok(true) => {
                audit::log_delivery_expired(
                    entry.publish_id().as_str(),
                    &self.name,
                    reason,
                    age_ms,
                );
            }
            Ok(false) => {}
            Err(e) => internal!(
                level = ERROR,
                "Cannot remove {reason} {entry} for {}: {e}",
                self.name
            ),
        }
    }

    /// Clear the in-flight mark; `false` if it was already gone.
    fn release(&self, task: &DeliveryTask) -> bool {
        self.state.lock().in_flight.remove(task.entry())
    }
}
