use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;

    tracing::info!(port, "prometheus exporter listening on /metrics");
    metrics::gauge!("depthsync_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(_port: u16) -> anyhow::Result<()> {
    Ok(())
}

// Metric names, kept in one place so dashboards and code agree.
pub const RESYNCS_TOTAL: &str = "depthsync_resyncs_total";
pub const GAPS_TOTAL: &str = "depthsync_gaps_total";
pub const DIFFS_APPLIED_TOTAL: &str = "depthsync_diffs_applied_total";
pub const LAST_UPDATE_ID: &str = "depthsync_last_update_id";
pub const RECONNECTS_TOTAL: &str = "depthsync_reconnects_total";
pub const HEARTBEAT_EXPIRED_TOTAL: &str = "depthsync_heartbeat_expired_total";
pub const CIRCUIT_OPEN_TOTAL: &str = "depthsync_circuit_open_total";
