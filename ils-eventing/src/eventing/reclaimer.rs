//! 回收器（Reclaimer）
//!
//! 周期扫描配置的各条流：认领空闲超过阈值的待确认条目并重新处理；
//! 投递次数达到上限仍失败的条目写入死信后确认原条目。
//! - 各流并发、相互独立，一条流的失败不阻塞其它流；
//! - 死信写入失败时原条目保持待确认，留待下一次回收；
//! - 回收器是唯一会写死信的组件。
//!
use super::{DeadLetterSink, ScheduledTask};
use crate::backend::{FailedEntry, StreamsBackend};
use crate::error::{EventingError, EventingResult};
use crate::event::DlqEntry;
use crate::metrics::EventingMetrics;
use async_trait::async_trait;
use bon::Builder;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RECLAIM_STREAM: &str = "order.submitted";

/// 回收器配置
///
/// `max_deliveries` 没有默认值：重试上限由集成方显式给出。
#[derive(Debug, Clone, Builder)]
pub struct ReclaimerConfig {
    #[builder(default = vec![DEFAULT_RECLAIM_STREAM.to_string()])]
    pub streams: Vec<String>,
    /// 条目可被认领前的最小空闲时长
    #[builder(default = Duration::from_millis(60_000))]
    pub min_idle: Duration,
    #[builder(default = Duration::from_millis(300_000))]
    pub interval: Duration,
    /// 每条流每次至多处理的条目数
    #[builder(default = 100)]
    pub batch_size: usize,
    /// 投递次数达到该值仍失败即进入死信
    pub max_deliveries: u64,
}

/// 单条流一次回收的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub stream: String,
    pub reclaimed: usize,
    pub dead_lettered: usize,
    /// 失败但未达上限、留在 PEL 的条目
    pub retained: usize,
    /// 被其他消费者抢先认领
    pub lost: usize,
    pub errors: usize,
    /// 整条流扫描失败时的原因
    pub failure: Option<String>,
}

impl ReclaimSummary {
    fn new(stream: &str) -> Self {
        Self {
            stream: stream.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Builder)]
pub struct Reclaimer {
    backend: Arc<StreamsBackend>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<EventingMetrics>,
    config: ReclaimerConfig,
}

impl Reclaimer {
    /// 执行一次回收：各流并发扫描，返回每条流的结果
    pub async fn run_once(&self) -> Vec<ReclaimSummary> {
        join_all(self.config.streams.iter().map(|s| self.reclaim_stream(s))).await
    }

    async fn reclaim_stream(&self, stream: &str) -> ReclaimSummary {
        let mut summary = ReclaimSummary::new(stream);

        // 扫描失败已在 reclaim_and_process 中计入 reclaimer_failures_total
        let report = match self
            .backend
            .reclaim_and_process(stream, self.config.min_idle, self.config.batch_size)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                let err = EventingError::ReclaimerInternal {
                    stream: stream.to_string(),
                    reason: err.to_string(),
                };
                warn!(group = self.backend.group(), error = %err, "reclaim pass failed");
                summary.failure = Some(err.to_string());
                return summary;
            }
        };

        summary.reclaimed = report.succeeded;
        summary.lost = report.lost;
        summary.errors = report.errors;

        for failed in &report.failed {
            if failed.delivery_count < self.config.max_deliveries {
                summary.retained += 1;
                continue;
            }
            match self.dead_letter(stream, failed).await {
                Ok(()) => summary.dead_lettered += 1,
                Err(err @ EventingError::DlqWrite { .. }) => {
                    summary.retained += 1;
                    summary.errors += 1;
                    error!(stream, entry_id = %failed.entry_id, error = %err, "entry kept pending");
                }
                Err(err) => {
                    summary.dead_lettered += 1;
                    summary.errors += 1;
                    warn!(stream, entry_id = %failed.entry_id, error = %err, "ack after dead letter failed");
                }
            }
        }

        if summary != ReclaimSummary::new(stream) {
            info!(
                stream,
                reclaimed = summary.reclaimed,
                dead_lettered = summary.dead_lettered,
                retained = summary.retained,
                lost = summary.lost,
                errors = summary.errors,
                "reclaim pass finished"
            );
        }
        summary
    }

    /// 写死信，成功后才确认原条目
    async fn dead_letter(&self, stream: &str, failed: &FailedEntry) -> EventingResult<()> {
        let entry = DlqEntry::builder()
            .original_event_id(failed.entry_id.clone())
            .original_payload(failed.payload.clone())
            .stream_name(stream)
            .group_name(self.backend.group())
            .failure_reason(failed.reason.clone())
            .delivery_count(failed.delivery_count)
            .build();

        let dlq_id = match self.dead_letters.write(&entry).await {
            Ok(id) => id,
            Err(err) => {
                self.metrics.record_reclaimer_failure();
                return Err(EventingError::DlqWrite {
                    stream: stream.to_string(),
                    entry_id: failed.entry_id.clone(),
                    reason: err.to_string(),
                });
            }
        };
        self.metrics.record_dead_lettered();
        debug!(
            stream,
            entry_id = %failed.entry_id,
            dlq_id = %dlq_id,
            delivery_count = failed.delivery_count,
            "entry dead lettered"
        );

        self.backend
            .ack(stream, &failed.entry_id)
            .await
            .inspect_err(|_| self.metrics.record_reclaimer_failure())?;
        Ok(())
    }
}

#[async_trait]
impl ScheduledTask for Reclaimer {
    fn task_name(&self) -> &str {
        "reclaimer"
    }

    async fn tick(&self) {
        self.run_once().await;
    }
}
