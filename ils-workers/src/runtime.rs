//! 进程装配（WorkerRuntime）
//!
//! 按配置构造指标与总线，连通性检查后决定是否注册处理器；
//! 对消费者组后端额外启动回收器与 PEL 采样器。`RuntimeHandle::shutdown`
//! 先停周期任务再停消费循环，处理中的条目留在 PEL。
//!
use crate::config::WorkersConfig;
use crate::error::WorkerResult;
use crate::http;
use axum::Router;
use ils_eventing::eventing::{EventBus, EventHandler, PelSampler, Reclaimer, TaskHandle};
use ils_eventing::metrics::EventingMetrics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 事件名与其处理器
pub struct Registration {
    pub event: String,
    pub handler: Arc<dyn EventHandler>,
}

impl Registration {
    pub fn new(event: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            event: event.into(),
            handler,
        }
    }
}

pub struct WorkerRuntime;

impl WorkerRuntime {
    pub async fn start(
        config: &WorkersConfig,
        registrations: Vec<Registration>,
    ) -> WorkerResult<RuntimeHandle> {
        let metrics = Arc::new(EventingMetrics::new());
        let bus = EventBus::connect(&config.bus_config(), metrics).await?;
        Self::start_with_bus(config, Arc::new(bus), registrations).await
    }

    /// 以已构造的总线启动
    pub async fn start_with_bus(
        config: &WorkersConfig,
        bus: Arc<EventBus>,
        registrations: Vec<Registration>,
    ) -> WorkerResult<RuntimeHandle> {
        let connected = match bus.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(backend = %bus.kind(), error = %err, "transport unreachable");
                false
            }
        };
        let workers_enabled = config.workers_enabled.unwrap_or(connected);
        let sampled = sampled_streams(&config.reclaim_streams, &registrations);

        if workers_enabled {
            for r in registrations {
                bus.subscribe(&r.event, r.handler).await?;
            }
        } else {
            info!(backend = %bus.kind(), "workers disabled, no handlers subscribed");
        }

        let mut tasks = TaskHandle::new(CancellationToken::new());
        if let Some(streams) = bus.streams() {
            let metrics = bus.metrics().clone();

            let sampler = PelSampler::new(streams, &sampled, metrics.clone());
            tasks.spawn(Arc::new(sampler), config.sampler_interval);

            if workers_enabled {
                if let Some(dead_letters) = bus.dead_letters() {
                    let reclaimer = Reclaimer::builder()
                        .backend(streams.clone())
                        .dead_letters(Arc::new(dead_letters))
                        .metrics(metrics)
                        .config(config.reclaimer_config()?)
                        .build();
                    tasks.spawn(Arc::new(reclaimer), config.reclaim_interval);
                }
            }
        }

        info!(
            backend = %bus.kind(),
            workers_enabled,
            scheduled = tasks.len(),
            "worker runtime started"
        );

        Ok(RuntimeHandle {
            bus,
            tasks,
            workers_enabled,
            metrics_enabled: config.metrics_enabled,
        })
    }
}

/// 回收流与订阅流的并集，保持首次出现的顺序
fn sampled_streams(reclaim: &[String], registrations: &[Registration]) -> Vec<String> {
    let mut streams: Vec<String> = Vec::new();
    for s in reclaim.iter().chain(registrations.iter().map(|r| &r.event)) {
        if !streams.contains(s) {
            streams.push(s.clone());
        }
    }
    streams
}

pub struct RuntimeHandle {
    bus: Arc<EventBus>,
    tasks: TaskHandle,
    workers_enabled: bool,
    metrics_enabled: bool,
}

impl RuntimeHandle {
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<EventingMetrics> {
        self.bus.metrics()
    }

    pub fn workers_enabled(&self) -> bool {
        self.workers_enabled
    }

    /// 仅在 `METRICS_ENABLED=true` 时挂载
    pub fn metrics_router(&self) -> Option<Router> {
        self.metrics_enabled
            .then(|| http::metrics_router(self.metrics().clone()))
    }

    pub async fn shutdown(self) {
        self.tasks.shutdown();
        self.tasks.join().await;
        self.bus.shutdown().await;
        info!("worker runtime stopped");
    }
}
