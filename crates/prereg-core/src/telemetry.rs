//! Tracing setup for the `prereg` binary.
//!
//! Logs go to stderr; stdout is reserved for the disclosed report.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter from `RUST_LOG`, falling back to `level`.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. `json` selects newline-delimited JSON
/// lines. Later calls are ignored.
pub fn init_tracing(json: bool, level: Level) {
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(filter(level))
        .with(json_layer)
        .with(text_layer)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
