use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter and register all engine metrics. With an
/// address, the exporter serves the scrape endpoint itself; without one, only the
/// recorder is installed.
pub fn init_metrics(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let builder = PrometheusBuilder::new();
    match addr {
        Some(addr) => builder.with_http_listener(addr).install()?,
        None => {
            builder.install_recorder()?;
        }
    }

    // Pre-register counters so they appear even before the first increment.
    for source in ["chain", "stream", "poll"] {
        counter!("signals_received_total", "source" => source).absolute(0);
        counter!("decode_errors_total", "source" => source).absolute(0);
    }
    counter!("signals_duplicate_total").absolute(0);
    counter!("reorg_dropped_total").absolute(0);
    counter!("entries_filled_total").absolute(0);
    counter!("entries_rejected_total").absolute(0);
    counter!("exits_total").absolute(0);

    gauge!("cash_balance").set(0.0);
    gauge!("open_positions").set(0.0);
    gauge!("current_exposure").set(0.0);

    histogram!("cycle_latency_seconds").record(0.0);

    Ok(())
}
