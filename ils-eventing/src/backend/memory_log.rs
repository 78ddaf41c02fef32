//! 内存流日志（MemoryStreamLog）
//!
//! 在进程内复现消费者组语义（组游标、PEL、投递计数、按空闲时间原子认领），
//! 用于测试与本地开发；不具备持久性。时间取自 `tokio::time::Instant`，
//! 因此测试可以用 `tokio::time::pause` 精确推进空闲时间。
//!
use super::StreamLog;
use crate::error::{EventingError, EventingResult};
use crate::event::{EntryFields, PendingEntry, RawEntry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
pub struct MemoryStreamLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<RawEntry>,
    index: HashMap<String, usize>,
    groups: HashMap<String, GroupState>,
    last_ms: i64,
    seq: u64,
}

struct GroupState {
    // 下一个待投递条目的下标
    next: usize,
    // 按条目下标排序，即按 id 排序
    pending: BTreeMap<usize, PendingSlot>,
}

struct PendingSlot {
    consumer: String,
    delivery_count: u64,
    delivered_at: Instant,
}

impl StreamState {
    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.last_ms {
            self.last_ms = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("{}-{}", self.last_ms, self.seq)
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> EventingResult<&mut GroupState> {
        self.groups.get_mut(group).ok_or_else(|| no_group(stream, group))
    }
}

fn no_group(stream: &str, group: &str) -> EventingError {
    EventingError::transport(format!(
        "NOGROUP no such consumer group '{group}' for stream '{stream}'"
    ))
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 流中条目总数（含已确认）
    pub async fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or(0, |s| s.entries.len())
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> EventingResult<Vec<RawEntry>> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let total = state.entries.len();
        let g = state.group_mut(stream, group)?;

        let start = g.next;
        let end = total.min(start + count.max(1));
        let now = Instant::now();
        for idx in start..end {
            g.pending.insert(
                idx,
                PendingSlot {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    delivered_at: now,
                },
            );
        }
        g.next = end;

        Ok(state.entries[start..end].to_vec())
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn ping(&self) -> EventingResult<()> {
        Ok(())
    }

    async fn append(&self, stream: &str, fields: EntryFields) -> EventingResult<String> {
        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.index.insert(id.clone(), state.entries.len());
            state.entries.push(RawEntry::new(id.clone(), fields));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> EventingResult<()> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let tail = state.entries.len();
        state.groups.entry(group.to_string()).or_insert(GroupState {
            next: tail,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> EventingResult<Vec<RawEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // 先登记唤醒再检查，避免错过检查与等待之间的追加
            let appended = self.appended.notified();
            let entries = self.try_read(stream, group, consumer, count).await?;
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> EventingResult<u64> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| state.index.get(id).copied())
            .collect();
        let g = state.group_mut(stream, group)?;

        Ok(positions
            .into_iter()
            .filter(|idx| g.pending.remove(idx).is_some())
            .count() as u64)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> EventingResult<Vec<PendingEntry>> {
        let streams = self.streams.lock().await;
        let state = streams.get(stream).ok_or_else(|| no_group(stream, group))?;
        let g = state.groups.get(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        Ok(g.pending
            .iter()
            .filter_map(|(idx, slot)| {
                let idle = now.saturating_duration_since(slot.delivered_at);
                (idle >= min_idle).then(|| PendingEntry {
                    stream_name: stream.to_string(),
                    group_name: group.to_string(),
                    entry_id: state.entries[*idx].id.clone(),
                    consumer_name: slot.consumer.clone(),
                    delivery_count: slot.delivery_count,
                    idle_ms: idle.as_millis() as u64,
                })
            })
            .take(count)
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> EventingResult<Vec<RawEntry>> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let positions: Vec<usize> = ids
            .iter()
            .filter_map(|id| state.index.get(id).copied())
            .collect();
        let g = state.group_mut(stream, group)?;
        let now = Instant::now();

        let mut claimed = Vec::new();
        for idx in positions {
            let Some(slot) = g.pending.get_mut(&idx) else {
                continue;
            };
            if now.saturating_duration_since(slot.delivered_at) < min_idle {
                continue;
            }
            slot.consumer = consumer.to_string();
            slot.delivery_count += 1;
            slot.delivered_at = now;
            claimed.push(idx);
        }

        Ok(claimed
            .into_iter()
            .map(|idx| state.entries[idx].clone())
            .collect())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> EventingResult<u64> {
        let streams = self.streams.lock().await;
        let state = streams.get(stream).ok_or_else(|| no_group(stream, group))?;
        let g = state.groups.get(group).ok_or_else(|| no_group(stream, group))?;
        Ok(g.pending.len() as u64)
    }

    async fn range(&self, stream: &str, count: usize) -> EventingResult<Vec<RawEntry>> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .map(|s| s.entries.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }
}
