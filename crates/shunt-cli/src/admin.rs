//! Admin HTTP listener: `/metrics`, and `/upload` when signed uploads are enabled

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use shunt_proxy::MetricsRegistry;
use shunt_signed::{upload_router, UploadState};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn admin_router(metrics: Arc<MetricsRegistry>, upload: Option<UploadState>) -> Router {
    let mut router = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(metrics);

    if let Some(state) = upload {
        router = router.merge(upload_router(state));
    }

    router.layer(TraceLayer::new_for_http())
}

async fn serve_metrics(State(metrics): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], metrics.render())
}
