//! PEL 采样器（PelSampler）
//!
//! 独立于回收器的轻量周期任务：每个 tick 查询各 (stream, group) 的待确认数量并写入量表，
//! 积压可见性因此不依赖回收间隔。
//!
use super::ScheduledTask;
use crate::backend::{StreamLog, StreamsBackend};
use crate::metrics::EventingMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct PelSampler {
    log: Arc<dyn StreamLog>,
    metrics: Arc<EventingMetrics>,
    targets: Vec<(String, String)>,
}

impl PelSampler {
    /// 采样 `streams` 在该后端消费者组下的积压
    pub fn new(backend: &StreamsBackend, streams: &[String], metrics: Arc<EventingMetrics>) -> Self {
        let targets = streams
            .iter()
            .map(|s| (s.clone(), backend.group().to_string()))
            .collect();
        Self::with_targets(backend.log().clone(), targets, metrics)
    }

    pub fn with_targets(
        log: Arc<dyn StreamLog>,
        targets: Vec<(String, String)>,
        metrics: Arc<EventingMetrics>,
    ) -> Self {
        Self {
            log,
            metrics,
            targets,
        }
    }

    /// 采样一次，返回成功更新的序列数
    pub async fn sample_once(&self) -> usize {
        let mut updated = 0;
        for (stream, group) in &self.targets {
            match self.log.pending_count(stream, group).await {
                Ok(count) => {
                    self.metrics.set_pending(stream, group, count);
                    updated += 1;
                }
                Err(err) => {
                    warn!(stream = %stream, group = %group, error = %err, "pending sample failed");
                }
            }
        }
        updated
    }
}

#[async_trait]
impl ScheduledTask for PelSampler {
    fn task_name(&self) -> &str {
        "pel-sampler"
    }

    async fn tick(&self) {
        self.sample_once().await;
    }
}
