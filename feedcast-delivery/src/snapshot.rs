//! Provisioning snapshot and its atomically swapped handle.
//!
//! A snapshot is built once from the provisioning file and never mutated.
//! Reload builds a new one and swaps it into the [`SnapshotHandle`], so a
//! reader sees either the old or the new snapshot in full.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use arc_swap::ArcSwap;
use feedcast_common::internal;
use feedcast_spool::DiskThresholds;
use serde::{Deserialize, Serialize};

use crate::{
    destination::DestinationInfo,
    error::ConfigError,
    route::{Hop, RouteError, RouteResolver},
};

mod defaults {
    pub const fn init_failure_timer_ms() -> u64 {
        10_000
    }

    pub const fn max_failure_timer_ms() -> u64 {
        3_600_000 // 1 hour
    }

    pub const fn backoff_multiplier() -> f64 {
        2.0
    }

    pub const fn expiration_timer_ms() -> u64 {
        86_400_000 // 24 hours
    }

    pub const fn fair_file_limit() -> u32 {
        100
    }

    pub const fn fair_time_limit_ms() -> u64 {
        60_000
    }
}

/// Per-node delivery timers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timers {
    /// Pause after the first failure of a destination
    #[serde(default = "defaults::init_failure_timer_ms")]
    pub init_failure_timer_ms: u64,

    /// Ceiling for the pause after repeated failures
    #[serde(default = "defaults::max_failure_timer_ms")]
    pub max_failure_timer_ms: u64,

    /// Growth factor of the pause per consecutive failure
    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Entries older than this are dropped undelivered
    #[serde(default = "defaults::expiration_timer_ms")]
    pub expiration_timer_ms: u64,

    /// Entries one worker delivers for a destination before yielding
    #[serde(default = "defaults::fair_file_limit")]
    pub fair_file_limit: u32,

    /// Time one worker spends on a destination before yielding
    #[serde(default = "defaults::fair_time_limit_ms")]
    pub fair_time_limit_ms: u64,

    /// Randomise each pause by up to ±this fraction
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            init_failure_timer_ms: defaults::init_failure_timer_ms(),
            max_failure_timer_ms: defaults::max_failure_timer_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
            expiration_timer_ms: defaults::expiration_timer_ms(),
            fair_file_limit: defaults::fair_file_limit(),
            fair_time_limit_ms: defaults::fair_time_limit_ms(),
            jitter_factor: 0.0,
        }
    }
}

/// The provisioning file as written by the provisioning service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provisioning {
    /// Every node name in the mesh
    #[serde(default)]
    pub nodes: Vec<String>,

    #[serde(default)]
    pub hops: Vec<Hop>,

    #[serde(default)]
    pub destinations: Vec<DestinationInfo>,

    #[serde(default)]
    pub timers: Timers,

    #[serde(default)]
    pub disk: DiskThresholds,
}

/// Validated, immutable provisioning state.
#[derive(Debug, Default)]
pub struct ProvisioningSnapshot {
    local_node: String,
    destinations: Vec<Arc<DestinationInfo>>,
    by_name: AHashMap<String, usize>,
    routes: RouteResolver,
    route_errors: Vec<RouteError>,
    timers: Timers,
    disk: DiskThresholds,
}

impl ProvisioningSnapshot {
    /// Validate `provisioning` for the node `local_node`.
    ///
    /// Bad hops are dropped and reported through [`Self::route_errors`]; every
    /// other problem rejects the snapshot.
    ///
    /// # Errors
    /// - A destination name is empty or declared twice
    /// - A destination URL does not parse as an absolute http(s) URL
    /// - `local_node` is not in the node list (when a node list is given)
    /// - The disk thresholds are inverted or out of range
    /// - The backoff multiplier is below 1.0
    pub fn build(local_node: &str, provisioning: Provisioning) -> Result<Self, ConfigError> {
        let Provisioning {
            nodes,
            hops,
            destinations,
            timers,
            disk,
        } = provisioning;

        if !nodes.is_empty() && !nodes.iter().any(|n| n == local_node) {
            return Err(ConfigError::UnknownLocalNode(local_node.to_string()));
        }

        if timers.backoff_multiplier.is_nan() || timers.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(timers.backoff_multiplier));
        }

        disk.validate()
            .map_err(|e| ConfigError::InvalidThresholds(e.to_string()))?;

        let mut by_name = AHashMap::with_capacity(destinations.len());
        for (index, destination) in destinations.iter().enumerate() {
            if destination.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(destination.url.clone()));
            }

            if by_name.insert(destination.name.clone(), index).is_some() {
                return Err(ConfigError::DuplicateDestination(destination.name.clone()));
            }

            validate_url(destination)?;
        }

        let (routes, route_errors) = RouteResolver::build(local_node, nodes.as_slice(), &hops);

        internal!(
            level = INFO,
            "Provisioning for {local_node}: {} destinations, {} routes, {} route errors",
            destinations.len(),
            routes.len(),
            route_errors.len()
        );

        Ok(Self {
            local_node: local_node.to_string(),
            destinations: destinations.into_iter().map(Arc::new).collect(),
            by_name,
            routes,
            route_errors,
            timers,
            disk,
        })
    }

    /// A snapshot with no destinations, used before provisioning is loaded.
    #[must_use]
    pub fn empty(local_node: &str) -> Self {
        Self {
            local_node: local_node.to_string(),
            routes: RouteResolver::build::<&str>(local_node, &[], &[]).0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    #[must_use]
    pub fn destination(&self, name: &str) -> Option<&Arc<DestinationInfo>> {
        self.by_name
            .get(name)
            .and_then(|&index| self.destinations.get(index))
    }

    /// Destinations in provisioning order.
    #[must_use]
    pub fn destinations(&self) -> &[Arc<DestinationInfo>] {
        &self.destinations
    }

    #[must_use]
    pub const fn routes(&self) -> &RouteResolver {
        &self.routes
    }

    #[must_use]
    pub fn route_errors(&self) -> &[RouteError] {
        &self.route_errors
    }

    #[must_use]
    pub const fn timers(&self) -> &Timers {
        &self.timers
    }

    #[must_use]
    pub const fn disk(&self) -> &DiskThresholds {
        &self.disk
    }
}

fn validate_url(destination: &DestinationInfo) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        destination: destination.name.clone(),
        reason,
    };

    let url = reqwest::Url::parse(&destination.url).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }

    Ok(())
}

/// Shared handle to the active snapshot.
///
/// Cloning the handle shares the same slot; [`SnapshotHandle::load`] is
/// lock-free and [`SnapshotHandle::store`] replaces the snapshot atomically.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<ProvisioningSnapshot>>,
    generation: Arc<AtomicU64>,
}

impl SnapshotHandle {
    #[must_use]
    pub fn new(snapshot: ProvisioningSnapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The snapshot in effect right now.
    #[must_use]
    pub fn load(&self) -> Arc<ProvisioningSnapshot> {
        self.current.load_full()
    }

    /// Replace the active snapshot.
    pub fn store(&self, snapshot: ProvisioningSnapshot) {
        self.current.store(Arc::new(snapshot));
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of swaps since creation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
