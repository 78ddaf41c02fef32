//! 死信队列（DLQ）
//!
//! 每个源流对应一个死信流 `<stream><suffix>`，记录终态失败的原始条目、失败原因与时间。
//! 死信从不自动重放；`replay` 仅供运维手动触发。
//!
use super::EventBus;
use crate::backend::StreamLog;
use crate::error::EventingResult;
use crate::event::DlqEntry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// 死信写入端
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// 写入一条死信，返回死信流中的条目 id
    async fn write(&self, entry: &DlqEntry) -> EventingResult<String>;
}

/// 基于流日志的死信队列
#[derive(Clone)]
pub struct DeadLetterQueue {
    log: Arc<dyn StreamLog>,
    suffix: String,
}

impl DeadLetterQueue {
    pub fn new(log: Arc<dyn StreamLog>, suffix: impl Into<String>) -> Self {
        Self {
            log,
            suffix: suffix.into(),
        }
    }

    pub fn stream_for(&self, stream: &str) -> String {
        format!("{stream}{}", self.suffix)
    }

    /// 按写入顺序读取 `stream` 的死信（至多 `count` 条），跳过无法解析的条目
    pub async fn list(&self, stream: &str, count: usize) -> EventingResult<Vec<(String, DlqEntry)>> {
        let dlq = self.stream_for(stream);
        let raw = self.log.range(&dlq, count).await?;

        Ok(raw
            .into_iter()
            .filter_map(|r| match DlqEntry::decode(&r) {
                Ok(entry) => Some((r.id, entry)),
                Err(err) => {
                    warn!(stream = %dlq, entry_id = %r.id, error = %err, "skipping malformed dead letter");
                    None
                }
            })
            .collect())
    }

    /// 将原始负载重新发布到原始流，返回新条目 id；死信本身保留
    pub async fn replay(&self, bus: &EventBus, entry: &DlqEntry) -> EventingResult<String> {
        let id = bus
            .publish(entry.stream_name(), entry.original_payload())
            .await?;
        info!(
            stream = entry.stream_name(),
            original_event_id = entry.original_event_id(),
            entry_id = %id,
            "dead letter replayed"
        );
        Ok(id)
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn write(&self, entry: &DlqEntry) -> EventingResult<String> {
        let fields = entry.encode()?;
        self.log.append(&self.stream_for(entry.stream_name()), fields).await
    }
}
