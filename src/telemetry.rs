use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use tracing_subscriber::{fmt, EnvFilter};

/// JSON logs filtered by `RUST_LOG`, `info` when unset. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).json().try_init();
}

/// Adds request metrics and a `/metrics` endpoint. Installs the global recorder, so call
/// it once per process.
pub fn with_metrics(app: Router) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    app.route(
        "/metrics",
        get(move || async move { metrics_handle.render() }),
    )
    .layer(prometheus_layer)
}
