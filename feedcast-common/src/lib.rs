pub mod audit;
pub mod logging;
pub mod time;

pub use tracing;

/// Process-wide control signal, broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting work, drain in-flight work, exit.
    Shutdown,
    /// Provisioning has been swapped; queues should drop stale backoff state.
    Reload,
    /// Sent once shutdown has completed.
    Finalised,
}
