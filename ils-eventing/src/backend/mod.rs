//! 后端适配器
//!
//! 三种传输实现组成封闭枚举 `Backend`，进程启动时经 `Backend::connect` 选定一次：
//! - `InMemory`：单进程、非持久；
//! - `RedisList`：Redis 列表，无消费者组；
//! - `Streams`：消费者组 + PEL + 认领，至少一次投递。
//!
use crate::error::{EventingError, EventingResult};
use crate::eventing::{BusConfig, EventHandler, HandlerRegistry};
use crate::metrics::EventingMetrics;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod list;
pub mod memory_log;
#[cfg(feature = "redis")]
pub mod redis_log;
pub mod stream_log;
pub mod streams;

pub use inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use list::RedisListBackend;
pub use memory_log::MemoryStreamLog;
#[cfg(feature = "redis")]
pub use redis_log::{RedisStreamLog, create_pool};
pub use stream_log::StreamLog;
pub use streams::{DeliveryOptions, FailedEntry, ReclaimReport, StreamsBackend};

/// 后端种类（`WORKERS_QUEUE_BACKEND`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    InMemory,
    RedisList,
    RedisStreams,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::InMemory => "in-memory",
            BackendKind::RedisList => "redis-list",
            BackendKind::RedisStreams => "redis-streams",
        }
    }

    pub fn needs_transport(&self) -> bool {
        !matches!(self, BackendKind::InMemory)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in-memory" | "inmemory" | "memory" => Ok(BackendKind::InMemory),
            "redis-list" | "list" => Ok(BackendKind::RedisList),
            "redis-streams" | "streams" => Ok(BackendKind::RedisStreams),
            other => Err(format!("invalid queue backend: {other}")),
        }
    }
}

/// 选定的传输实现
pub enum Backend {
    InMemory(InMemoryBackend),
    #[cfg(feature = "redis")]
    RedisList(RedisListBackend),
    Streams(Arc<StreamsBackend>),
}

impl Backend {
    /// 工厂：按配置构造唯一的后端实例
    pub async fn connect(
        config: &BusConfig,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<EventingMetrics>,
    ) -> EventingResult<Self> {
        match config.backend {
            BackendKind::InMemory => Ok(Backend::InMemory(InMemoryBackend::new(
                config.delivery.channel_capacity,
                config.consumer.clone(),
                metrics,
            ))),
            #[cfg(feature = "redis")]
            BackendKind::RedisList => {
                let pool = create_pool(redis_url(config)?, config.pool_size)?;
                Ok(Backend::RedisList(RedisListBackend::new(
                    pool,
                    config.consumer.clone(),
                    metrics,
                    config.delivery,
                )))
            }
            #[cfg(feature = "redis")]
            BackendKind::RedisStreams => {
                let log = RedisStreamLog::connect(redis_url(config)?, config.pool_size)?;
                Ok(Backend::streams(Arc::new(log), config, registry, metrics))
            }
            #[cfg(not(feature = "redis"))]
            kind => {
                let _ = registry;
                Err(EventingError::Unsupported {
                    operation: "connect",
                    backend: kind.as_str(),
                })
            }
        }
    }

    /// 以任意 `StreamLog` 构造消费者组后端
    pub fn streams(
        log: Arc<dyn StreamLog>,
        config: &BusConfig,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<EventingMetrics>,
    ) -> Self {
        Backend::Streams(Arc::new(
            StreamsBackend::builder()
                .log(log)
                .group(config.group.clone())
                .consumer(config.consumer.clone())
                .registry(registry)
                .metrics(metrics)
                .options(config.delivery)
                .build(),
        ))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::InMemory(_) => BackendKind::InMemory,
            #[cfg(feature = "redis")]
            Backend::RedisList(_) => BackendKind::RedisList,
            Backend::Streams(_) => BackendKind::RedisStreams,
        }
    }

    pub async fn ping(&self) -> EventingResult<()> {
        match self {
            Backend::InMemory(_) => Ok(()),
            #[cfg(feature = "redis")]
            Backend::RedisList(b) => b.ping().await,
            Backend::Streams(b) => b.log().ping().await,
        }
    }

    pub async fn publish(&self, event_name: &str, payload: &Value) -> EventingResult<String> {
        match self {
            Backend::InMemory(b) => b.publish(event_name, payload).await,
            #[cfg(feature = "redis")]
            Backend::RedisList(b) => b.publish(event_name, payload).await,
            Backend::Streams(b) => b.publish(event_name, payload).await,
        }
    }

    pub(crate) async fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
    ) -> EventingResult<Vec<JoinHandle<()>>> {
        match self {
            Backend::InMemory(b) => Ok(vec![b.subscribe(event_name, handler, token)]),
            #[cfg(feature = "redis")]
            Backend::RedisList(b) => Ok(b.subscribe(event_name, handler, token)),
            Backend::Streams(b) => b.subscribe(event_name, handler, token).await,
        }
    }

    pub fn as_streams(&self) -> Option<&Arc<StreamsBackend>> {
        match self {
            Backend::Streams(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(feature = "redis")]
fn redis_url(config: &BusConfig) -> EventingResult<&str> {
    config.redis_url.as_deref().ok_or_else(|| {
        EventingError::config(format!(
            "REDIS_URL is required for the {} backend",
            config.backend
        ))
    })
}
