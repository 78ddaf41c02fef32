//! 指标端点
//!
//! - `GET /metrics`：Prometheus 文本格式，按需拉取
//! - `GET /health`：存活检查
//!
use crate::error::WorkerResult;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use ils_eventing::metrics::EventingMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn metrics_router(metrics: Arc<EventingMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<EventingMetrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render_prometheus(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// 在 `addr` 上提供路由，直至 `token` 取消
pub async fn serve(addr: SocketAddr, router: Router, token: CancellationToken) -> WorkerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
