//! Per-destination disk spool.
//!
//! Every destination owns one directory of `(payload, metadata)` pairs named
//! `<sequenceToken>.<publishId>` and `<sequenceToken>.<publishId>.M`. The
//! spool is the only durable state of a delivery: an entry stays on disk
//! until it is delivered, expired or cancelled.

pub mod disk;
pub mod error;
pub mod metadata;
pub mod store;
pub mod types;

pub use disk::{DiskMonitor, DiskThresholds};
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use metadata::SpoolMetadata;
pub use store::{SpoolStore, StagedEntry};
pub use types::{PublishId, SequenceGenerator, SpoolEntry};
