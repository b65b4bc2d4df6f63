//! # Logging
//!
//! Library code only emits `tracing` events and spans. The `plugintest`
//! binary installs the subscriber configured here.
//!
//! - Filtering follows `RUST_LOG`, defaulting to `info`.
//! - Output goes to stderr. In `serve` mode stdout carries the plugin
//!   handshake line and nothing else.
//! - `--log-json` switches from the human-readable formatter to JSON lines.
//!
//! ```bash
//! RUST_LOG=reattach_server=debug plugintest run -- terraform apply
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .with_current_span(true)
    });

    let pretty_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}
