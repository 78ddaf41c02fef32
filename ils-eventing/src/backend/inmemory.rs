//! 内存事件后端（InMemoryBackend）
//!
//! 每个事件名一个有界 `broadcast` 通道，单进程、非持久、至多一次：
//! - `publish`：分配本地 id 并广播；无订阅者时事件被丢弃，记入 `dropped_total`；
//! - `subscribe`：启动接收循环，逐条调用处理器，失败仅记录。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use crate::consumer::ConsumerName;
use crate::error::EventingResult;
use crate::event::{AttemptMetadata, Delivery, StreamEntry};
use crate::eventing::EventHandler;
use crate::eventing::handler::invoke;
use crate::metrics::EventingMetrics;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct InMemoryBackend {
    channels: DashMap<String, broadcast::Sender<StreamEntry>>,
    capacity: usize,
    seq: AtomicU64,
    consumer: ConsumerName,
    metrics: Arc<EventingMetrics>,
}

impl InMemoryBackend {
    /// `capacity` 为每个事件名的广播缓冲区容量
    pub fn new(capacity: usize, consumer: ConsumerName, metrics: Arc<EventingMetrics>) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
            consumer,
            metrics,
        }
    }

    fn sender(&self, event_name: &str) -> broadcast::Sender<StreamEntry> {
        self.channels
            .entry(event_name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub async fn publish(&self, event_name: &str, payload: &Value) -> EventingResult<String> {
        let id = format!("{}-0", self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = StreamEntry::builder()
            .id(id.clone())
            .name(event_name)
            .payload(payload.clone())
            .published_at(Utc::now())
            .build();

        // 无订阅者时 send 返回错误，内存后端视为非致命
        if self.sender(event_name).send(entry).is_err() {
            self.metrics.record_dropped();
            warn!(event = event_name, entry_id = %id, "no in-memory subscriber, event dropped");
        }
        self.metrics.record_published();
        Ok(id)
    }

    pub fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.sender(event_name).subscribe();
        let consumer = self.consumer.to_string();
        let metrics = self.metrics.clone();
        let event = event_name.to_string();

        tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Ok(entry) => entry,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(event = %event, skipped, "in-memory subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let delivery = Delivery {
                    attempt: AttemptMetadata {
                        entry_id: entry.id().to_string(),
                        consumer: consumer.clone(),
                        delivery_count: 1,
                        reclaimed: false,
                    },
                    entry,
                };
                if let Err(reason) = invoke(handler.as_ref(), &delivery).await {
                    metrics.record_handler_failure();
                    warn!(
                        event = %event,
                        handler = handler.handler_name(),
                        entry_id = %delivery.attempt.entry_id,
                        reason = %reason,
                        "handler failed, in-memory event not redelivered"
                    );
                }
            }
        })
    }
}
