//! Logging setup for the binaries.
//!
//! Library code logs through the `log` macros; this installs a tracing
//! subscriber on stderr and bridges `log::` call sites into it. stderr is
//! the right sink for agent servers — the supervisor inherits the child's
//! stderr precisely so crashes and logs stay visible.
//!
//! Verbosity comes from `RUST_LOG` (default `info`).

/// Initialise the tracing subscriber. Safe to call more than once.
pub fn init() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .try_init()
        .ok();

    // Forward all log:: macro call sites into the tracing pipeline.
    tracing_log::LogTracer::init().ok();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "tinycrab logging ready");
}
