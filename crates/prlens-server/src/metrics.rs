//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Open SSE session streams (gauge).
pub const HTTP_SSE_STREAMS_ACTIVE: &str = "http_sse_streams_active";

/// Install the global Prometheus recorder. Call once, before anything
/// records.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Keeps [`HTTP_SSE_STREAMS_ACTIVE`] in step with open streams.
pub(crate) struct StreamGauge;

impl StreamGauge {
    pub(crate) fn open() -> Self {
        metrics::gauge!(HTTP_SSE_STREAMS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        metrics::gauge!(HTTP_SSE_STREAMS_ACTIVE).decrement(1.0);
    }
}
