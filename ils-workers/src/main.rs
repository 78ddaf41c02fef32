use anyhow::Result as AnyResult;
use ils_eventing::eventing::{EventHandler, FnHandler};
use ils_workers::telemetry::init_tracing;
use ils_workers::{Registration, WorkerRuntime, WorkersConfig, http};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认处理器：仅记录收到的事件
fn logging_handler() -> Arc<dyn EventHandler> {
    FnHandler::arc("log", |event, payload, attempt| async move {
        info!(
            event = %event,
            entry_id = %attempt.entry_id,
            consumer = %attempt.consumer,
            delivery_count = attempt.delivery_count,
            reclaimed = attempt.reclaimed,
            payload = %payload,
            "event received"
        );
        Ok::<_, anyhow::Error>(())
    })
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    init_tracing();

    let config = WorkersConfig::from_env()?;
    info!(backend = %config.backend, streams = ?config.reclaim_streams, "starting ils-workers");

    let registrations = config
        .reclaim_streams
        .iter()
        .map(|stream| Registration::new(stream.clone(), logging_handler()))
        .collect();
    let runtime = WorkerRuntime::start(&config, registrations).await?;

    let token = CancellationToken::new();
    let server = runtime
        .metrics_router()
        .map(|router| tokio::spawn(http::serve(config.metrics_addr, router, token.clone())));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    token.cancel();
    if let Some(server) = server {
        match server.await {
            Ok(Err(err)) => warn!(error = %err, "metrics server failed"),
            Err(err) => warn!(error = %err, "metrics server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    runtime.shutdown().await;
    Ok(())
}
