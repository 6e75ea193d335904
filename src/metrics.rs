use std::net::{Ipv4Addr, SocketAddr};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and register all pipeline metrics. With a
/// port, the exporter also serves `/metrics` on it.
pub fn init_metrics(port: Option<u16>) -> anyhow::Result<()> {
    let builder = PrometheusBuilder::new();
    match port {
        Some(port) => {
            builder
                .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .install()?;
            tracing::info!(port, "Prometheus exporter listening");
        }
        None => {
            builder.install_recorder()?;
        }
    }

    // Pre-register counters so they appear even before the first increment.
    counter!("blocks_processed_total").absolute(0);
    counter!("trades_decoded_total").absolute(0);
    counter!("decode_skipped_total").absolute(0);
    counter!("orders_emitted_total").absolute(0);

    gauge!("cursor_block").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("pipeline_cycle_seconds").record(0.0);

    Ok(())
}
