//! Delivery scheduling
//!
//! The [`Scheduler`] keeps one [`DeliveryQueue`] per provisioned destination
//! and runs a bounded pool of workers over them. On every poll tick each idle
//! queue with an eligible entry gets a worker, privileged destinations first
//! and, within each class, the queue served longest ago first. A worker drains
//! its queue until the fairness window closes, the queue runs dry or the
//! destination starts backing off, then hands the queue back to the end of the
//! line.

mod worker;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use dashmap::{DashMap, DashSet};
use feedcast_common::{Signal, internal};
use feedcast_spool::{PublishId, SpoolStore};
use feedcast_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinSet,
    time::MissedTickBehavior,
};

use crate::{
    error::DeliveryError,
    queue::{DeliveryQueue, QueueStatus},
    redirect::RedirectCache,
    snapshot::{ProvisioningSnapshot, SnapshotHandle},
    transport::Transport,
};

fn default_max_concurrent_deliveries() -> usize {
    num_cpus::get()
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_request_timeout_secs() -> u64 {
    60
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_continue_timeout_ms() -> u64 {
    1_000
}

const fn default_max_redirects() -> u32 {
    5
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound on destinations being delivered to at once
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// How often idle queues are polled for new entries (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on one transfer, from connect to the last response byte
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long a destination using `100-continue` has to refuse a file
    /// before its body is sent anyway (in milliseconds)
    #[serde(default = "default_continue_timeout_ms")]
    pub continue_timeout_ms: u64,

    /// Redirects followed for one entry before the attempt counts as failed
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// How long shutdown waits for in-flight transfers
    ///
    /// Entries still in flight when this runs out stay spooled and are
    /// delivered after the next start.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            continue_timeout_ms: default_continue_timeout_ms(),
            max_redirects: default_max_redirects(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn continue_timeout(&self) -> Duration {
        Duration::from_millis(self.continue_timeout_ms)
    }
}

/// Drives every destination queue with a bounded pool of workers
#[derive(Debug)]
pub struct Scheduler {
    config: DeliveryConfig,
    spool_root: PathBuf,
    snapshot: SnapshotHandle,
    redirects: Arc<RedirectCache>,
    transport: Arc<dyn Transport>,
    queues: DashMap<String, Arc<DeliveryQueue>>,
    /// Destinations that currently have a worker
    busy: Arc<DashSet<String>>,
    /// Worker turns completed so far
    turns: AtomicU64,
}

impl Scheduler {
    /// Create a scheduler and open a queue for every provisioned destination.
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        spool_root: impl Into<PathBuf>,
        snapshot: SnapshotHandle,
        redirects: Arc<RedirectCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let scheduler = Self {
            config,
            spool_root: spool_root.into(),
            snapshot,
            redirects,
            transport,
            queues: DashMap::new(),
            busy: Arc::new(DashSet::new()),
            turns: AtomicU64::new(0),
        };
        scheduler.sync_queues();
        scheduler
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub fn spool_root(&self) -> &Path {
        &self.spool_root
    }

    #[must_use]
    pub const fn snapshot(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    /// Bring the queue set in line with the active snapshot.
    ///
    /// Queues are opened for new destinations, dropped for removed ones and
    /// reopened when a destination's spool directory moved. A spool directory
    /// that cannot be opened leaves that destination without a queue.
    pub fn sync_queues(&self) {
        let snapshot = self.snapshot.load();

        self.queues
            .retain(|name, _| snapshot.destination(name).is_some());

        for destination in snapshot.destinations() {
            let path = destination.spool_path(&self.spool_root);
            let current = self
                .queues
                .get(&destination.name)
                .is_some_and(|queue| queue.spool().path() == path.as_path());
            if current {
                continue;
            }

            match SpoolStore::open(path.clone()) {
                Ok(spool) => {
                    internal!(
                        level = INFO,
                        "Opened queue for {} at {}",
                        destination.name,
                        path.display()
                    );
                    self.queues.insert(
                        destination.name.clone(),
                        Arc::new(DeliveryQueue::new(
                            destination.name.clone(),
                            spool,
                            self.snapshot.clone(),
                            Arc::clone(&self.redirects),
                        )),
                    );
                }
                Err(e) => internal!(
                    level = ERROR,
                    "Cannot open spool {} for {}: {e}",
                    path.display(),
                    destination.name
                ),
            }
        }
    }

    /// Activate `snapshot` and drop every queue's stale backoff.
    pub fn reload(&self, snapshot: ProvisioningSnapshot) {
        self.snapshot.store(snapshot);
        self.refresh();
    }

    /// Re-read the active snapshot after it was swapped elsewhere.
    pub fn refresh(&self) {
        self.sync_queues();
        for queue in &self.queues {
            queue.reset_queue();
        }
        internal!(
            level = INFO,
            "Delivery using provisioning generation {} with {} queues",
            self.snapshot.generation(),
            self.queues.len()
        );
    }

    #[must_use]
    pub fn queue(&self, destination: &str) -> Option<Arc<DeliveryQueue>> {
        self.queues
            .get(destination)
            .map(|queue| Arc::clone(queue.value()))
    }

    /// Remove `publish_id` from one destination's spool. Returns the number of
    /// entries removed; an unknown destination removes nothing.
    pub async fn cancel(&self, destination: &str, publish_id: &PublishId) -> usize {
        match self.queue(destination) {
            Some(queue) => queue.cancel_task(publish_id).await,
            None => 0,
        }
    }

    /// Status of every queue, by destination name.
    pub async fn statuses(&self, now: SystemTime) -> Vec<QueueStatus> {
        let mut queues: Vec<_> = self
            .queues
            .iter()
            .map(|queue| Arc::clone(queue.value()))
            .collect();
        queues.sort_by(|a, b| a.name().cmp(b.name()));

        let mut statuses = Vec::with_capacity(queues.len());
        for queue in queues {
            statuses.push(queue.status(now).await);
        }
        statuses
    }

    /// Number for the turn a worker is finishing now.
    fn finish_turn(&self) -> u64 {
        self.turns.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// Idle queues with something to deliver: privileged destinations first,
    /// then least recently served, then by name.
    async fn eligible(&self, now: SystemTime) -> Vec<Arc<DeliveryQueue>> {
        let mut candidates: Vec<(bool, u64, Arc<DeliveryQueue>)> = self
            .queues
            .iter()
            .filter(|queue| !self.busy.contains(queue.key()))
            .filter(|queue| !queue.is_backing_off(now))
            .map(|queue| {
                let privileged = queue
                    .destination()
                    .is_some_and(|destination| destination.flags.privileged);
                (privileged, queue.last_turn(), Arc::clone(queue.value()))
            })
            .collect();

        candidates.sort_by(|(a_priv, a_turn, a), (b_priv, b_turn, b)| {
            b_priv
                .cmp(a_priv)
                .then_with(|| a_turn.cmp(b_turn))
                .then_with(|| a.name().cmp(b.name()))
        });

        let mut eligible = Vec::new();
        for (_, _, queue) in candidates {
            if queue.peek_next(now).await.is_some() {
                eligible.push(queue);
            }
        }
        eligible
    }

    /// Hand eligible queues to workers until the pool is full.
    async fn dispatch_round(self: &Arc<Self>, workers: &mut JoinSet<()>) -> usize {
        let limit = self.config.max_concurrent_deliveries.max(1);
        let mut dispatched = 0;

        for queue in self.eligible(SystemTime::now()).await {
            if workers.len() >= limit {
                break;
            }

            if !self.busy.insert(queue.name().to_string()) {
                continue;
            }

            let guard = worker::BusyGuard::new(Arc::clone(&self.busy), queue.name());
            let scheduler = Arc::clone(self);
            workers.spawn(async move {
                scheduler.drain(&queue).await;
                drop(guard);
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            internal!(
                level = DEBUG,
                "Dispatched {dispatched} queues ({} workers busy)",
                workers.len()
            );
        }

        dispatched
    }

    /// Run a single scheduling round to completion.
    ///
    /// Used by tests and tools that need deterministic progress; a running
    /// node uses [`Scheduler::serve`].
    pub async fn run_once(self: &Arc<Self>) -> usize {
        let mut workers = JoinSet::new();
        let dispatched = self.dispatch_round(&mut workers).await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                internal!(level = ERROR, "Delivery worker failed: {e}");
            }
        }
        dispatched
    }

    /// Run until a shutdown signal arrives.
    ///
    /// ## Graceful Shutdown
    ///
    /// On [`Signal::Shutdown`] no further queues are dispatched and running
    /// workers get `shutdown_timeout_secs` to finish. Workers still running
    /// after that are aborted; their entries stay spooled.
    ///
    /// [`Signal::Reload`] re-reads the active snapshot and resets backoff.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for fatal scheduler
    /// errors.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(
        self: Arc<Self>,
        mut signals: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!(
            level = INFO,
            "Scheduler starting with {} queues and up to {} workers",
            self.queues.len(),
            self.config.max_concurrent_deliveries
        );

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.dispatch_round(&mut workers).await;
                }
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = result {
                        internal!(level = ERROR, "Delivery worker failed: {e}");
                    }
                }
                signal = signals.recv() => {
                    match signal {
                        Ok(Signal::Reload) => self.refresh(),
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(RecvError::Closed) => {
                            internal!(level = INFO, "Scheduler received shutdown signal");
                            break;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            internal!(level = WARN, "Scheduler missed {missed} signals");
                        }
                    }
                }
            }
        }

        self.shutdown(workers).await;
        Ok(())
    }

    async fn shutdown(&self, mut workers: JoinSet<()>) {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let waited = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            internal!(
                level = WARN,
                "Shutdown timeout exceeded, {} in-flight deliveries will be retried on restart",
                workers.len()
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        } else {
            internal!(level = INFO, "All in-flight deliveries completed");
        }

        internal!(level = INFO, "Scheduler shutdown complete");
    }
}
