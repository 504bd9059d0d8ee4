//! Worker turns: drain one queue, one attempt at a time.

use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use dashmap::DashSet;
use feedcast_common::{audit, internal};
use feedcast_spool::SpoolError;
use feedcast_tracing::traced;

use super::Scheduler;
use crate::{
    error::{DeliveryError, TransientError},
    queue::DeliveryQueue,
    task::DeliveryTask,
    transport::{AttemptOutcome, DeliveryRequest, RequestBody},
};

/// Marks a destination as owned by a worker until dropped, including when the
/// worker is aborted.
pub(super) struct BusyGuard {
    busy: Arc<DashSet<String>>,
    name: String,
}

impl BusyGuard {
    pub(super) fn new(busy: Arc<DashSet<String>>, name: &str) -> Self {
        Self {
            busy,
            name: name.to_string(),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.name);
    }
}

impl Scheduler {
    /// One worker turn over `queue`, bounded by its fairness window.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(destination = %queue.name())), timing(precision = "ms"))]
    pub(super) async fn drain(&self, queue: &DeliveryQueue) {
        queue.start_turn(SystemTime::now());

        let mut delivered = 0_u32;
        loop {
            let now = SystemTime::now();
            if queue.should_yield(now) {
                internal!(
                    level = DEBUG,
                    "Yielding {} after {delivered} attempts",
                    queue.name()
                );
                break;
            }

            let Some(task) = queue.get_next(now).await else {
                break;
            };

            self.attempt(queue, task).await;
            delivered = delivered.saturating_add(1);
        }

        queue.end_turn(self.finish_turn());
    }

    /// Deliver one task, following redirects, and record the outcome.
    async fn attempt(&self, queue: &DeliveryQueue, mut task: DeliveryTask) {
        loop {
            audit::log_delivery_attempt(
                task.publish_id().as_str(),
                queue.name(),
                &task.target_url(),
                task.attempt(),
            );

            let started = Instant::now();
            let Some(outcome) = self.transfer(queue, &task).await else {
                internal!(
                    level = INFO,
                    "{} left the spool of {} before it was sent",
                    task.entry(),
                    queue.name()
                );
                queue.abandon(&task);
                break;
            };

            let next = match outcome {
                AttemptOutcome::Delivered { status } => {
                    queue.record_success(&task, status, started.elapsed()).await;
                    None
                }
                AttemptOutcome::Redirected { status, location } => {
                    match queue
                        .follow_redirect(
                            &task,
                            status,
                            &location,
                            self.config.max_redirects,
                            SystemTime::now(),
                        )
                        .await
                    {
                        Ok(next) => Some(next),
                        Err(e) => {
                            queue.record_failure(&task, &e, SystemTime::now()).await;
                            None
                        }
                    }
                }
                AttemptOutcome::Failed(e) => {
                    queue.record_failure(&task, &e, SystemTime::now()).await;
                    None
                }
            };

            match next {
                Some(next) => task = next,
                None => break,
            }
        }
    }

    /// Send the entry and bound the whole exchange by the request timeout
    /// whatever the transport.
    ///
    /// Returns `None` when the payload is no longer in the spool, which
    /// happens when the entry was cancelled after it was picked.
    async fn transfer(&self, queue: &DeliveryQueue, task: &DeliveryTask) -> Option<AttemptOutcome> {
        let payload = match Self::payload(queue, task).await {
            Ok(payload) => payload,
            Err(e) if e.is_not_found() => return None,
            Err(e) => return Some(AttemptOutcome::Failed(e.into())),
        };

        let request = match DeliveryRequest::for_task(task, payload) {
            Ok(request) => request,
            Err(e) => return Some(AttemptOutcome::Failed(e)),
        };

        let timeout = self.config.request_timeout();
        let outcome = tokio::time::timeout(timeout, self.transport.deliver(request))
            .await
            .unwrap_or_else(|_| {
                AttemptOutcome::Failed(DeliveryError::from(TransientError::Timeout(format!(
                    "no response within {}s",
                    timeout.as_secs()
                ))))
            });
        Some(outcome)
    }

    /// The body for `task`: nothing, the inflatable payload in memory, or a
    /// reference to the spooled file.
    async fn payload(queue: &DeliveryQueue, task: &DeliveryTask) -> Result<RequestBody, SpoolError> {
        let spool = queue.spool();
        if task.destination().flags.metadata_only {
            Ok(RequestBody::Empty)
        } else if task.inflates() {
            Ok(RequestBody::Bytes(spool.read_payload(task.entry()).await?))
        } else {
            Ok(RequestBody::File {
                len: spool.payload_len(task.entry()).await?,
                path: spool.payload_path(task.entry()),
            })
        }
    }
}
