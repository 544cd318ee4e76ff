//! Tracing setup tailored to this library.
//!
//! Applications should call one of the init functions once at startup to
//! install a subscriber. Library modules use `crate::tracing::prelude::*`
//! for the `trace!()`, `debug!()`, `info!()`, `warn!()` and `error!()`
//! macros; every event carries structured fields rather than formatted
//! strings so log consumers can filter on pin/bus/chip.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            init_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        init_stdout();
    }
}

/// Log to stdout, filtering according to the `RUST_LOG` environment
/// variable with a default level of INFO.
pub fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true),
        )
        .init();
}

// Timestamps in local time, to the nearest second. The default timer is
// UTC with sub-second precision, which is noise for hardware bring-up
// logs.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?,
        )
    }
}
