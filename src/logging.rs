//! Developer diagnostics.
//!
//! Task actions and errors shown to users go through `ExecutionContext`'s
//! print helpers. This module only configures `tracing` output, which is
//! controlled by `RUST_LOG` and goes to stderr.

use crate::runner::Verbosity;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v` enables debug output for this
/// crate and everything else stays at `warn`.
pub fn init(verbosity: Verbosity) {
    let default = if verbosity >= Verbosity::Verbose {
        "warn,rpoe=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A subscriber may already be installed when running inside tests
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
