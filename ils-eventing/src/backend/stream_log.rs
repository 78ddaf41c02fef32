//! 流日志（StreamLog）协议
//!
//! 消费者组语义下的原始流原语：追加、组读、确认、PEL 查询与所有权转移。
//! `claim` 必须在后端层面原子执行：并发的两个回收者中至多一个能取得同一条目。
//!
use crate::error::EventingResult;
use crate::event::{EntryFields, PendingEntry, RawEntry};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// 连通性检查
    async fn ping(&self) -> EventingResult<()>;

    /// 追加条目，返回后端分配的 id（XADD）
    async fn append(&self, stream: &str, fields: EntryFields) -> EventingResult<String>;

    /// 在流尾创建消费者组；已存在时视为成功（XGROUP CREATE ... $ MKSTREAM）
    async fn ensure_group(&self, stream: &str, group: &str) -> EventingResult<()>;

    /// 读取投递给该消费者的新条目，最多阻塞 `block`（XREADGROUP ... >）
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> EventingResult<Vec<RawEntry>>;

    /// 确认条目，返回实际移出 PEL 的数量（XACK）
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> EventingResult<u64>;

    /// 查询空闲时间不少于 `min_idle` 的待确认条目（XPENDING ... IDLE）
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> EventingResult<Vec<PendingEntry>>;

    /// 原子转移所有权；空闲时间已不满足 `min_idle` 的条目不会被返回（XCLAIM）
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> EventingResult<Vec<RawEntry>>;

    /// 组内 PEL 大小（XPENDING 摘要形式）
    async fn pending_count(&self, stream: &str, group: &str) -> EventingResult<u64>;

    /// 从头读取至多 `count` 条（XRANGE - + COUNT）
    async fn range(&self, stream: &str, count: usize) -> EventingResult<Vec<RawEntry>>;
}
