use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use feedcast_common::{Signal, audit, internal, logging};
use feedcast_delivery::{HttpTransport, RedirectCache, Scheduler, SnapshotHandle};
use feedcast_spool::DiskMonitor;
use feedcast_tracing::traced;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
    time::MissedTickBehavior,
};

use crate::{config::NodeConfig, provisioning};

/// A running distribution node: one scheduler over every provisioned
/// destination, plus the free-disk monitor the ingest side consults.
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    scheduler: Arc<Scheduler>,
    redirects: Arc<RedirectCache>,
    disk: Arc<DiskMonitor>,
    signals: broadcast::Sender<Signal>,
}

/// Initialise logging and audit, start the node and run it until shutdown.
///
/// # Errors
///
/// If the node cannot be started; see [`Node::start`].
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    if let Err(e) = logging::init(&config.logging) {
        internal!(level = DEBUG, "Keeping the log subscriber already installed: {e}");
    }
    audit::init(config.audit.clone());

    Node::start(config)?.serve().await
}

impl Node {
    /// Load provisioning, open the redirect log and build the scheduler.
    ///
    /// # Errors
    ///
    /// If the spool root cannot be created, the provisioning file is unusable,
    /// the redirect log cannot be opened, or the HTTP client cannot be built.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "ms"))]
    pub fn start(config: NodeConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.spool_root).with_context(|| {
            format!("Failed to create spool root {}", config.spool_root.display())
        })?;

        let snapshot = provisioning::load(&config.provisioning, &config.node)?;
        let disk = Arc::new(DiskMonitor::new(*snapshot.disk()));

        let redirects = Arc::new(
            RedirectCache::open(
                config.redirect_log(),
                config.redirect_ttl(),
                config.redirects.compact_threshold,
                SystemTime::now(),
            )
            .with_context(|| {
                format!(
                    "Failed to open redirect log {}",
                    config.redirect_log().display()
                )
            })?,
        );

        let transport = HttpTransport::new(
            config.delivery.connect_timeout(),
            config.delivery.request_timeout(),
        )?
        .with_continue_timeout(config.delivery.continue_timeout());

        let scheduler = Arc::new(Scheduler::new(
            config.delivery.clone(),
            config.spool_root.clone(),
            SnapshotHandle::new(snapshot),
            Arc::clone(&redirects),
            Arc::new(transport),
        ));

        let (signals, _receiver) = broadcast::channel(64);

        internal!(level = INFO, "Node {} started", config.node);

        Ok(Self {
            config,
            scheduler,
            redirects,
            disk,
            signals,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub const fn redirects(&self) -> &Arc<RedirectCache> {
        &self.redirects
    }

    /// Whether new files should be accepted, as of the last disk check.
    #[must_use]
    pub fn accepting(&self) -> bool {
        self.disk.accepting()
    }

    /// Sender for the node's control signals.
    #[must_use]
    pub fn signals(&self) -> broadcast::Sender<Signal> {
        self.signals.clone()
    }

    /// Re-read the provisioning file and swap it in.
    ///
    /// A file that fails to load leaves the active provisioning untouched.
    ///
    /// # Errors
    ///
    /// If the provisioning file cannot be read or is rejected.
    pub fn reload(&self) -> anyhow::Result<()> {
        let snapshot = provisioning::load(&self.config.provisioning, &self.config.node)?;

        self.disk.set_thresholds(*snapshot.disk());
        self.scheduler.reload(snapshot);

        Ok(())
    }

    /// Sample free space under the spool root. Returns the acceptance state.
    pub fn check_disk(&self) -> bool {
        match self.disk.check(&self.config.spool_root) {
            Ok(accepting) => accepting,
            Err(e) => {
                internal!(
                    level = WARN,
                    "Unable to check free space under {}: {e}",
                    self.config.spool_root.display()
                );
                self.disk.accepting()
            }
        }
    }

    /// Run until the scheduler has shut down.
    ///
    /// # Errors
    ///
    /// If a process signal handler cannot be installed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn serve(self) -> anyhow::Result<()> {
        internal!("Controller running");

        let node = Arc::new(self);

        let disk = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.watch_disk().await })
        };

        let ret = tokio::select! {
            r = Arc::clone(&node.scheduler).serve(node.signals.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = node.handle_signals() => {
                r
            }
        };

        disk.abort();
        let _ = node.signals.send(Signal::Finalised);

        internal!("Shutting down...");

        ret
    }

    async fn watch_disk(&self) {
        let interval = self.config.disk_check_interval().max(Duration::from_secs(1));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            self.check_disk();
        }
    }

    /// Reload on SIGHUP; shut down on CTRL+C or SIGTERM. A second CTRL+C after
    /// shutdown has started stops waiting for in-flight deliveries.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    async fn handle_signals(&self) -> anyhow::Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    internal!("CTRL+C entered -- Enter it again to force shutdown");
                    break;
                }
                _ = terminate.recv() => {
                    internal!("Terminate Signal received, shutting down");
                    break;
                }
                _ = hangup.recv() => {
                    internal!(level = INFO, "Hangup received, reloading provisioning");
                    if let Err(e) = self.reload() {
                        internal!(level = ERROR, "Reload failed, keeping current provisioning: {e:#}");
                    }
                }
            }
        }

        self.signals
            .send(Signal::Shutdown)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

        tokio::signal::ctrl_c().await?;
        internal!(level = WARN, "Forced shutdown");

        Ok(())
    }
}
