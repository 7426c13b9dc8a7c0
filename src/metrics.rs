//! Process-wide ingress counters, exposed in Prometheus text format.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

/// Install the Prometheus recorder and return the render handle for the
/// metrics endpoint. Returns `None` if a recorder is already installed
/// (tests, embedders with their own exporter).
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    }
}

pub fn inc_request(provider: &str) {
    counter!("hookrelay_requests_total", "provider" => provider.to_string()).increment(1);
}

pub fn inc_parse_error(provider: &str) {
    counter!("hookrelay_parse_errors_total", "provider" => provider.to_string()).increment(1);
}

pub fn inc_publish_error(driver: &str) {
    counter!("hookrelay_publish_errors_total", "driver" => driver.to_string()).increment(1);
}
