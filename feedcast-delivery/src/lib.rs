//! Delivery engine for spooled files
//!
//! This crate provides:
//! - Per-destination queues over spool directories, with backoff and expiry
//! - Redirect learning, persisted across restarts
//! - Relay routing through peer nodes
//! - A bounded worker pool that keeps destinations fair to each other

mod destination;
mod error;
pub mod policy;
mod processor;
pub mod queue;
mod redirect;
mod route;
mod snapshot;
mod task;
pub mod transport;

pub use destination::{
    Credentials, DeliveryMethod, DestinationFlags, DestinationInfo, DestinationKind,
};
pub use error::{
    ConfigError, DeliveryError, PermanentError, RedirectError, SystemError, TransientError,
};
pub use policy::{BackoffPolicy, FairnessWindow};
pub use processor::{DeliveryConfig, Scheduler};
pub use queue::{DeliveryQueue, QueueStatus};
pub use redirect::{RedirectCache, RedirectConfig, RedirectEntry};
pub use route::{Hop, RouteError, RouteResolver};
pub use snapshot::{Provisioning, ProvisioningSnapshot, SnapshotHandle, Timers};
pub use task::DeliveryTask;
pub use transport::{AttemptOutcome, DeliveryRequest, HttpTransport, RequestBody, Transport};
