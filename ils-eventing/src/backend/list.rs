//! Redis 列表后端（RedisListBackend）
//!
//! 每个事件名一个列表，`LPUSH` 写入、`BRPOP` 弹出；没有消费者组与 PEL，
//! 弹出即视为已消费，处理失败只记录日志与计数，不会重投。
//! - 读任务一次只持有一条已弹出的条目，分发完成后才再次弹出；
//! - 停止时不打断进行中的 `BRPOP`，分发任务处理完已交付的条目才退出。
//!
use super::redis_log::ping_pool;
use crate::backend::DeliveryOptions;
use crate::consumer::ConsumerName;
use crate::error::EventingResult;
use crate::event::{AttemptMetadata, Delivery, StreamEntry};
use crate::eventing::EventHandler;
use crate::eventing::handler::invoke;
use crate::metrics::EventingMetrics;
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct RedisListBackend {
    pool: Pool,
    consumer: ConsumerName,
    metrics: Arc<EventingMetrics>,
    options: DeliveryOptions,
}

impl RedisListBackend {
    pub fn new(
        pool: Pool,
        consumer: ConsumerName,
        metrics: Arc<EventingMetrics>,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            pool,
            consumer,
            metrics,
            options,
        }
    }

    pub async fn ping(&self) -> EventingResult<()> {
        ping_pool(&self.pool).await
    }

    pub async fn publish(&self, event_name: &str, payload: &Value) -> EventingResult<String> {
        let id = Uuid::new_v4().to_string();
        let entry = StreamEntry::builder()
            .id(id.clone())
            .name(event_name)
            .payload(payload.clone())
            .published_at(Utc::now())
            .build();
        let body = serde_json::to_string(&entry)?;

        let mut conn = self.pool.get().await?;
        conn.lpush::<_, _, ()>(event_name, body).await?;
        self.metrics.record_published();
        debug!(list = event_name, entry_id = %id, "event pushed");
        Ok(id)
    }

    pub fn subscribe(
        &self,
        event_name: &str,
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let pool = self.pool.clone();
        let list = event_name.to_string();
        // BRPOP 超时以秒计，0 表示无限等待
        let timeout = self.options.read_block.as_secs().max(1);

        spawn_consumer(
            event_name,
            self.consumer.to_string(),
            move || brpop(pool.clone(), list.clone(), timeout),
            handler,
            self.metrics.clone(),
            self.options.retry_backoff,
            token,
        )
    }
}

/// 启动读任务与分发任务；`pop` 每次返回一条已出队的消息体
fn spawn_consumer<P, Fut>(
    list: &str,
    consumer: String,
    mut pop: P,
    handler: Arc<dyn EventHandler>,
    metrics: Arc<EventingMetrics>,
    retry_backoff: Duration,
    token: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    P: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = EventingResult<Option<String>>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<(Delivery, oneshot::Sender<()>)>(1);

    let reader = {
        let list = list.to_string();

        tokio::spawn(async move {
            while !token.is_cancelled() {
                let body = match pop().await {
                    Ok(Some(body)) => body,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(list = %list, error = %err, "list pop failed");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(retry_backoff) => continue,
                        }
                    }
                };

                let entry: StreamEntry = match serde_json::from_str(&body) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(list = %list, error = %err, body = %body, "dropping undecodable list entry");
                        continue;
                    }
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

                let (done, handled) = oneshot::channel();
                if let Err(mpsc::error::SendError((lost, _))) = tx.send((delivery, done)).await {
                    warn!(
                        list = %list,
                        entry_id = %lost.attempt.entry_id,
                        payload = %lost.entry.payload(),
                        "dispatcher gone, popped list entry not handled"
                    );
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = handled => {}
                }
            }
            debug!(list = %list, "list reader stopped");
        })
    };

    // 不监听取消：读任务退出后通道关闭，已交付的条目仍会处理完
    let dispatcher = {
        let list = list.to_string();

        tokio::spawn(async move {
            while let Some((delivery, done)) = rx.recv().await {
                if let Err(reason) = invoke(handler.as_ref(), &delivery).await {
                    metrics.record_handler_failure();
                    warn!(
                        list = %list,
                        handler = handler.handler_name(),
                        entry_id = %delivery.attempt.entry_id,
                        reason = %reason,
                        "handler failed, list entry not redelivered"
                    );
                }
                let _ = done.send(());
            }
        })
    };

    vec![reader, dispatcher]
}

async fn brpop(pool: Pool, list: String, timeout_secs: u64) -> EventingResult<Option<String>> {
    let mut conn = pool.get().await?;
    let popped: Option<(String, String)> = redis::cmd("BRPOP")
        .arg(&list)
        .arg(timeout_secs)
        .query_async(&mut conn)
        .await?;
    Ok(popped.map(|(_, body)| body))
}
