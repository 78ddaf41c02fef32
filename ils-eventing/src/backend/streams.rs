//! 消费者组流后端（StreamsBackend）
//!
//! 基于任意 `StreamLog` 实现“至少一次”投递：
//! - 订阅时在流尾幂等创建消费者组；每个逻辑消费者一个读循环，
//!   读到的一批条目经容量为 1 的通道交给分发任务，整批分发完才读下一批；
//! - 自读取起超过 `dispatch_deadline` 仍未分发的条目不在本地处理，留给回收器；
//! - 处理成功即确认，失败则不确认，条目留在 PEL 中等待回收；
//! - `reclaim_and_process` 认领空闲条目并同步重新处理。
//!
use super::StreamLog;
use crate::consumer::ConsumerName;
use crate::error::{EventingError, EventingResult};
use crate::event::{AttemptMetadata, Delivery, FIELD_PAYLOAD, RawEntry, StreamEntry};
use crate::eventing::handler::invoke;
use crate::eventing::{EventHandler, HandlerRegistry};
use crate::metrics::EventingMetrics;
use bon::Builder;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 投递循环参数
#[derive(Clone, Copy, Debug)]
pub struct DeliveryOptions {
    /// 每次组读的最大条数
    pub read_count: usize,
    /// 组读阻塞时长
    pub read_block: Duration,
    /// 每个订阅的逻辑消费者数量
    pub consumers: usize,
    /// 内存后端每个事件名的广播缓冲容量
    pub channel_capacity: usize,
    /// 传输错误后的退避
    pub retry_backoff: Duration,
    /// 本地分发时限，应不大于回收器的 `min_idle`
    pub dispatch_deadline: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            read_count: 10,
            read_block: Duration::from_millis(5_000),
            consumers: 1,
            channel_capacity: 64,
            retry_backoff: Duration::from_millis(1_000),
            dispatch_deadline: Duration::from_millis(60_000),
        }
    }
}

/// 回收中处理失败、仍留在 PEL 的条目
#[derive(Clone, Debug)]
pub struct FailedEntry {
    pub entry_id: String,
    pub payload: Value,
    pub reason: String,
    pub delivery_count: u64,
}

/// 单次 `reclaim_and_process` 的结果
#[derive(Clone, Debug, Default)]
pub struct ReclaimReport {
    pub stream: String,
    /// PEL 中满足空闲阈值的条目数
    pub scanned: usize,
    /// 认领成功的条目数
    pub claimed: usize,
    /// 重新处理成功并确认的条目数
    pub succeeded: usize,
    /// 被其他消费者抢先认领的条目数
    pub lost: usize,
    /// 认领/确认时的传输错误数
    pub errors: usize,
    pub failed: Vec<FailedEntry>,
}

/// 一次组读的结果，分发完毕后经 `done` 通知读循环
struct Batch {
    read_at: Instant,
    deliveries: Vec<Delivery>,
    done: oneshot::Sender<()>,
}

#[derive(Builder)]
pub struct StreamsBackend {
    log: Arc<dyn StreamLog>,
    #[builder(into)]
    group: String,
    consumer: ConsumerName,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<EventingMetrics>,
    #[builder(default)]
    options: DeliveryOptions,
}

impl StreamsBackend {
    pub fn log(&self) -> &Arc<dyn StreamLog> {
        &self.log
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &ConsumerName {
        &self.consumer
    }

    pub async fn publish(&self, event_name: &str, payload: &Value) -> EventingResult<String> {
        let fields = StreamEntry::encode(event_name, payload, Utc::now())?;
        let id = self.log.append(event_name, fields).await?;
        self.metrics.record_published();
        debug!(stream = event_name, entry_id = %id, "event appended");
        Ok(id)
    }

    pub async fn ack(&self, stream: &str, entry_id: &str) -> EventingResult<u64> {
        self.log
            .ack(stream, &self.group, &[entry_id.to_string()])
            .await
    }

    pub async fn pending_count(&self, stream: &str) -> EventingResult<u64> {
        self.log.pending_count(stream, &self.group).await
    }

    /// 确保消费者组存在，并为每个逻辑消费者启动读循环与分发任务
    pub async fn subscribe(
        self: &Arc<Self>,
        stream: &str,
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
    ) -> EventingResult<Vec<JoinHandle<()>>> {
        self.log.ensure_group(stream, &self.group).await?;

        let mut tasks = Vec::with_capacity(self.options.consumers.max(1) * 2);
        for i in 0..self.options.consumers.max(1) {
            let consumer = self.consumer.logical(i);
            let (tx, rx) = mpsc::channel(1);

            tasks.push(tokio::spawn(self.clone().read_loop(
                stream.to_string(),
                consumer.clone(),
                tx,
                token.clone(),
            )));
            tasks.push(tokio::spawn(self.clone().dispatch_loop(
                stream.to_string(),
                handler.clone(),
                rx,
                token.clone(),
            )));

            debug!(stream, group = %self.group, consumer = %consumer, "consumer started");
        }

        Ok(tasks)
    }

    async fn read_loop(
        self: Arc<Self>,
        stream: String,
        consumer: ConsumerName,
        tx: mpsc::Sender<Batch>,
        token: CancellationToken,
    ) {
        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.log.read_group(
                    &stream,
                    &self.group,
                    consumer.as_str(),
                    self.options.read_count,
                    self.options.read_block,
                ) => read,
            };
            let read_at = Instant::now();

            let entries = match read {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(stream = %stream, consumer = %consumer, error = %err, "group read failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_backoff) => continue,
                    }
                }
            };

            let mut deliveries = Vec::with_capacity(entries.len());
            for raw in entries {
                // 无法解码的条目留在 PEL，由回收器最终送入死信
                let entry = match StreamEntry::decode(&stream, &raw) {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(stream = %stream, entry_id = %raw.id, error = %err, "undecodable entry left pending");
                        continue;
                    }
                };
                deliveries.push(Delivery {
                    attempt: AttemptMetadata {
                        entry_id: raw.id,
                        consumer: consumer.to_string(),
                        delivery_count: 1,
                        reclaimed: false,
                    },
                    entry,
                });
            }
            if deliveries.is_empty() {
                continue;
            }

            let (done, dispatched) = oneshot::channel();
            let batch = Batch {
                read_at,
                deliveries,
                done,
            };
            if tx.send(batch).await.is_err() {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = dispatched => {}
            }
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        stream: String,
        handler: Arc<dyn EventHandler>,
        mut rx: mpsc::Receiver<Batch>,
        token: CancellationToken,
    ) {
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(b) => b,
                    None => break,
                },
            };

            for delivery in &batch.deliveries {
                if token.is_cancelled() {
                    return;
                }
                // 超时条目可能已被回收器认领，本地不再处理
                if batch.read_at.elapsed() >= self.options.dispatch_deadline {
                    debug!(
                        stream = %stream,
                        entry_id = %delivery.attempt.entry_id,
                        "dispatch deadline passed, entry left to the reclaimer"
                    );
                    continue;
                }
                self.dispatch(&stream, handler.as_ref(), delivery).await;
            }
            let _ = batch.done.send(());
        }
    }

    async fn dispatch(&self, stream: &str, handler: &dyn EventHandler, delivery: &Delivery) {
        match invoke(handler, delivery).await {
            Ok(()) => {
                if let Err(err) = self.ack(stream, &delivery.attempt.entry_id).await {
                    warn!(
                        stream,
                        entry_id = %delivery.attempt.entry_id,
                        error = %err,
                        "ack failed, entry stays pending"
                    );
                }
            }
            Err(reason) => {
                self.metrics.record_handler_failure();
                warn!(
                    stream,
                    handler = handler.handler_name(),
                    entry_id = %delivery.attempt.entry_id,
                    reason = %reason,
                    "handler failed, entry left pending"
                );
            }
        }
    }

    /// 认领空闲不少于 `min_idle` 的待确认条目（至多 `max_count` 条）并同步重新处理。
    ///
    /// 成功即确认并计入 `reclaimed_total`；处理失败的条目不确认，随报告返回，
    /// 是否送入死信由调用方决定。单条认领/确认的传输错误计入
    /// `reclaimer_failures_total` 后继续处理其余条目。
    pub async fn reclaim_and_process(
        &self,
        stream: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> EventingResult<ReclaimReport> {
        let Some(handler) = self.registry.get(stream) else {
            self.metrics.record_reclaimer_failure();
            return Err(EventingError::HandlerNotFound {
                event: stream.to_string(),
            });
        };

        let pending = self
            .log
            .pending(stream, &self.group, min_idle, max_count)
            .await
            .inspect_err(|_| self.metrics.record_reclaimer_failure())?;

        let mut report = ReclaimReport {
            stream: stream.to_string(),
            scanned: pending.len(),
            ..Default::default()
        };

        for p in pending {
            let claimed = match self
                .log
                .claim(
                    stream,
                    &self.group,
                    self.consumer.as_str(),
                    min_idle,
                    std::slice::from_ref(&p.entry_id),
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    self.metrics.record_reclaimer_failure();
                    report.errors += 1;
                    warn!(stream, entry_id = %p.entry_id, error = %err, "claim failed");
                    continue;
                }
            };

            let Some(raw) = claimed.into_iter().next() else {
                report.lost += 1;
                debug!(stream, entry_id = %p.entry_id, "entry claimed by another consumer");
                continue;
            };
            report.claimed += 1;

            let delivery_count = p.delivery_count + 1;
            match self
                .process_claimed(stream, handler.as_ref(), raw, delivery_count)
                .await
            {
                Ok(entry_id) => match self.ack(stream, &entry_id).await {
                    Ok(_) => {
                        self.metrics.record_reclaimed();
                        report.succeeded += 1;
                        debug!(stream, entry_id = %entry_id, delivery_count, "reclaimed entry processed");
                    }
                    Err(err) => {
                        self.metrics.record_reclaimer_failure();
                        report.errors += 1;
                        warn!(stream, entry_id = %entry_id, error = %err, "ack after reclaim failed");
                    }
                },
                Err(failed) => {
                    self.metrics.record_handler_failure();
                    warn!(
                        stream,
                        entry_id = %failed.entry_id,
                        delivery_count,
                        reason = %failed.reason,
                        "reclaimed entry failed again"
                    );
                    report.failed.push(failed);
                }
            }
        }

        Ok(report)
    }

    async fn process_claimed(
        &self,
        stream: &str,
        handler: &dyn EventHandler,
        raw: RawEntry,
        delivery_count: u64,
    ) -> Result<String, FailedEntry> {
        let entry = match StreamEntry::decode(stream, &raw) {
            Ok(entry) => entry,
            Err(err) => {
                return Err(FailedEntry {
                    payload: Value::String(raw.field(FIELD_PAYLOAD).unwrap_or_default().to_string()),
                    entry_id: raw.id,
                    reason: err.to_string(),
                    delivery_count,
                });
            }
        };

        let delivery = Delivery {
            attempt: AttemptMetadata {
                entry_id: raw.id.clone(),
                consumer: self.consumer.to_string(),
                delivery_count,
                reclaimed: true,
            },
            entry,
        };

        match invoke(handler, &delivery).await {
            Ok(()) => Ok(raw.id),
            Err(reason) => Err(FailedEntry {
                entry_id: raw.id,
                payload: delivery.entry.payload().clone(),
                reason,
                delivery_count,
            }),
        }
    }
}
