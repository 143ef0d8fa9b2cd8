use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::warn;

/// Install the global Prometheus recorder without an HTTP listener; the
/// scrape endpoint is opt-in via [`start_metrics_server`].
pub fn init_prometheus_exporter() {
    if let Err(e) = PrometheusBuilder::new().install_recorder() {
        // A second install (tests, embedded use) keeps the first recorder.
        warn!(error = %e, "prometheus recorder already installed");
    }
}

/// Serve `GET /metrics` on `addr`.
pub fn start_metrics_server(addr: SocketAddr) {
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(error = %e, addr = %addr, "metrics listener failed to start");
    }
}
