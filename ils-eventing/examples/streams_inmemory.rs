/// 消费者组总线（内存流日志）示例
/// 展示 publish -> 处理失败留在 PEL -> 回收重试 -> 超过上限进入死信 的闭环
use anyhow::Result as AnyResult;
use ils_eventing::backend::MemoryStreamLog;
use ils_eventing::eventing::{
    BusConfig, EventBus, FnHandler, PelSampler, Reclaimer, ReclaimerConfig,
};
use ils_eventing::metrics::EventingMetrics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ils_eventing=debug".into()),
        )
        .init();

    let metrics = Arc::new(EventingMetrics::new());
    let log = Arc::new(MemoryStreamLog::new());
    let bus = EventBus::with_stream_log(log, &BusConfig::default(), metrics.clone());

    // "O-2" 永远失败，其余订单成功
    let handler = FnHandler::arc("order-mailer", |_, payload, attempt| async move {
        if payload["orderId"] == "O-2" {
            anyhow::bail!("template missing (attempt {})", attempt.delivery_count);
        }
        println!("mailed {} (attempt {})", payload["orderId"], attempt.delivery_count);
        Ok(())
    });
    bus.subscribe("order.submitted", handler).await?;

    for id in ["O-1", "O-2", "O-3"] {
        bus.publish("order.submitted", &json!({ "orderId": id })).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let Some(streams) = bus.streams().cloned() else {
        anyhow::bail!("streams backend expected");
    };
    let dead_letters = bus.dead_letters().ok_or_else(|| anyhow::anyhow!("no dlq"))?;

    let config = ReclaimerConfig::builder()
        .min_idle(Duration::from_millis(100))
        .max_deliveries(3)
        .build();
    let reclaimer = Reclaimer::builder()
        .backend(streams.clone())
        .dead_letters(Arc::new(dead_letters.clone()))
        .metrics(metrics.clone())
        .config(config.clone())
        .build();
    let sampler = PelSampler::new(&streams, &config.streams, metrics.clone());

    for round in 1..=3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        sampler.sample_once().await;
        println!(
            "round {round}: pending={:?} {:?}",
            metrics.pending("order.submitted", streams.group()),
            reclaimer.run_once().await
        );
    }

    for (id, letter) in dead_letters.list("order.submitted", 10).await? {
        println!(
            "dlq {id}: original={} reason={}",
            letter.original_event_id(),
            letter.failure_reason()
        );
    }
    println!("{}", metrics.render_prometheus());

    bus.shutdown().await;
    Ok(())
}
