//! Log macros and subscriber setup
//!
//! Everything the node logs goes through [`internal!`] (bookkeeping on this
//! node) or [`outgoing!`] (traffic to destinations and relay peers). Each
//! record is emitted inside a span named after its direction, so the two can
//! be filtered apart.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer,
    filter::FilterFn,
    fmt::time::ChronoUtc,
    prelude::__tracing_subscriber_SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Environment variable that overrides the configured level.
pub const LEVEL_ENV: &str = "LOG_LEVEL";

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Traffic leaving this node (transfers to subscribers and relay peers).
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Node-internal bookkeeping (spool scans, queue state, provisioning).
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

const fn default_ansi() -> bool {
    true
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `LOG_LEVEL` is not set, e.g. `"info"`
    #[serde(default)]
    pub level: Option<String>,

    /// Colour the output
    #[serde(default = "default_ansi")]
    pub ansi: bool,

    /// Prefix each record with its source file and line
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: default_ansi(),
            source_location: false,
        }
    }
}

/// The first level that parses out of `LOG_LEVEL` and the configured level,
/// or TRACE for debug builds and INFO for release builds.
fn resolve_level(from_env: Option<&str>, configured: Option<&str>) -> LevelFilter {
    let fallback = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    [from_env, configured]
        .into_iter()
        .flatten()
        .find_map(|level| {
            LevelFilter::from_str(level)
                .inspect_err(|_| eprintln!("Ignoring invalid log level {level}"))
                .ok()
        })
        .unwrap_or(fallback)
}

/// Install the global subscriber for `feedcast*` targets.
///
/// # Errors
///
/// If a global subscriber is already installed. The installed one stays in
/// place.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let level = resolve_level(
        std::env::var(LEVEL_ENV).ok().as_deref(),
        config.level.as_deref(),
    );

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("feedcast")
                })),
        )
        .try_init()
}
