//! 事件总线（EventBus）
//!
//! 与后端无关的发布/订阅门面：进程启动时按 `BusConfig` 选定并独占一个后端，
//! 生命周期内不可切换。
//! - `publish`：写入持久条目并返回条目 id，仅在传输错误时失败；
//! - `subscribe`：写入分发表并启动该事件名的消费循环；
//! - `shutdown`：取消全部消费循环，处理中的条目保持待确认。
//!
use super::{DeadLetterQueue, EventHandler, HandlerRegistry};
use crate::backend::{
    Backend, BackendKind, DeliveryOptions, ReclaimReport, StreamLog, StreamsBackend,
};
use crate::consumer::ConsumerName;
use crate::error::{EventingError, EventingResult};
use crate::metrics::EventingMetrics;
use bon::Builder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_GROUP: &str = "ils_group";
pub const DEFAULT_CONSUMER_PREFIX: &str = "ils";
pub const DEFAULT_DLQ_SUFFIX: &str = ":dlq";

/// 总线配置；启动时读取一次
#[derive(Debug, Clone, Builder)]
pub struct BusConfig {
    #[builder(default)]
    pub backend: BackendKind,
    #[builder(into)]
    pub redis_url: Option<String>,
    #[builder(into, default = DEFAULT_GROUP.to_string())]
    pub group: String,
    #[builder(default = ConsumerName::generate(DEFAULT_CONSUMER_PREFIX))]
    pub consumer: ConsumerName,
    #[builder(default)]
    pub delivery: DeliveryOptions,
    #[builder(default = 16)]
    pub pool_size: usize,
    #[builder(into, default = DEFAULT_DLQ_SUFFIX.to_string())]
    pub dlq_suffix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct EventBus {
    backend: Backend,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<EventingMetrics>,
    dlq_suffix: String,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    /// 按配置连接后端（不做连通性检查，见 `ping`）
    pub async fn connect(config: &BusConfig, metrics: Arc<EventingMetrics>) -> EventingResult<Self> {
        let registry = Arc::new(HandlerRegistry::new());
        let backend = Backend::connect(config, registry.clone(), metrics.clone()).await?;
        info!(
            backend = %backend.kind(),
            group = %config.group,
            consumer = %config.consumer,
            "event bus connected"
        );

        Ok(Self::from_parts(backend, registry, metrics, config))
    }

    /// 以给定流日志构造消费者组总线，如 `MemoryStreamLog`
    pub fn with_stream_log(
        log: Arc<dyn StreamLog>,
        config: &BusConfig,
        metrics: Arc<EventingMetrics>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let backend = Backend::streams(log, config, registry.clone(), metrics.clone());
        Self::from_parts(backend, registry, metrics, config)
    }

    fn from_parts(
        backend: Backend,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<EventingMetrics>,
        config: &BusConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            metrics,
            dlq_suffix: config.dlq_suffix.clone(),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn metrics(&self) -> &Arc<EventingMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// 传输是否可达
    pub async fn ping(&self) -> EventingResult<()> {
        self.backend.ping().await
    }

    pub async fn publish(&self, event_name: &str, payload: &Value) -> EventingResult<String> {
        self.backend.publish(event_name, payload).await
    }

    /// 注册处理器并启动消费循环；同一事件名只能订阅一次
    pub async fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> EventingResult<()> {
        self.registry.register(event_name, handler.clone())?;

        let spawned = match self
            .backend
            .subscribe(event_name, handler.clone(), self.token.child_token())
            .await
        {
            Ok(spawned) => spawned,
            Err(err) => {
                self.registry.remove(event_name);
                return Err(err);
            }
        };

        debug!(
            event = event_name,
            handler = handler.handler_name(),
            loops = spawned.len(),
            "subscribed"
        );
        self.tasks.lock().await.extend(spawned);
        Ok(())
    }

    /// 消费者组后端（仅 `redis-streams` 或自带流日志时存在）
    pub fn streams(&self) -> Option<&Arc<StreamsBackend>> {
        self.backend.as_streams()
    }

    pub async fn reclaim_and_process(
        &self,
        stream: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> EventingResult<ReclaimReport> {
        let streams = self.streams().ok_or(EventingError::Unsupported {
            operation: "reclaim_and_process",
            backend: self.kind().as_str(),
        })?;

        streams.reclaim_and_process(stream, min_idle, max_count).await
    }

    /// 与本总线共用流日志的死信队列
    pub fn dead_letters(&self) -> Option<DeadLetterQueue> {
        self.streams()
            .map(|s| DeadLetterQueue::new(s.log().clone(), self.dlq_suffix.clone()))
    }

    /// 取消全部消费循环并等待退出
    pub async fn shutdown(&self) {
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for t in tasks {
            let _ = t.await;
        }
        debug!(backend = %self.kind(), "event bus stopped");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStreamLog;
    use crate::eventing::FnHandler;
    use serde_json::json;

    #[test]
    fn default_config_uses_memory_backend() {
        let config = BusConfig::default();
        assert_eq!(config.backend, BackendKind::InMemory);
        assert_eq!(config.group, "ils_group");
        assert_eq!(config.dlq_suffix, ":dlq");
        assert_eq!(config.pool_size, 16);
    }

    #[tokio::test]
    async fn reclaim_is_unsupported_without_consumer_groups() {
        let bus = EventBus::connect(&BusConfig::default(), Arc::new(EventingMetrics::new()))
            .await
            .unwrap();

        let err = bus
            .reclaim_and_process("order.submitted", Duration::ZERO, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EventingError::Unsupported { .. }));
        assert!(bus.dead_letters().is_none());
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_rejected() {
        let log = Arc::new(MemoryStreamLog::new());
        let bus = EventBus::with_stream_log(
            log,
            &BusConfig::default(),
            Arc::new(EventingMetrics::new()),
        );
        let h = FnHandler::arc("noop", |_, _, _| async { Ok::<_, anyhow::Error>(()) });

        bus.subscribe("order.submitted", h.clone()).await.unwrap();
        let err = bus.subscribe("order.submitted", h).await.unwrap_err();

        assert!(matches!(err, EventingError::AlreadySubscribed { .. }));
        assert_eq!(bus.registry().len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_counts_entries() {
        let metrics = Arc::new(EventingMetrics::new());
        let bus = EventBus::with_stream_log(
            Arc::new(MemoryStreamLog::new()),
            &BusConfig::default(),
            metrics.clone(),
        );

        let id = bus
            .publish("order.submitted", &json!({"orderId": "O-1"}))
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(metrics.snapshot().published_total, 1);
    }
}
