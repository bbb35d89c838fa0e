pub mod config;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod intelligence;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod polymarket;
pub mod services;

/// Install the global tracing subscriber. `RUST_LOG` filters (default `info`);
/// `format == "json"` switches to structured JSON lines.
pub fn init_tracing(format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
