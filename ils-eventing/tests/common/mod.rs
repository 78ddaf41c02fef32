//! 测试用流日志：包装 `MemoryStreamLog`，按需注入传输错误
//!
#![allow(dead_code)]

use async_trait::async_trait;
use ils_eventing::backend::{MemoryStreamLog, StreamLog};
use ils_eventing::error::{EventingError, EventingResult};
use ils_eventing::event::{EntryFields, PendingEntry, RawEntry};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FaultyLog {
    pub inner: Arc<MemoryStreamLog>,
    read_failures: AtomicUsize,
    reads: AtomicUsize,
    broken_claims: Mutex<HashSet<String>>,
    broken_acks: Mutex<HashSet<String>>,
}

impl FaultyLog {
    pub fn new(inner: Arc<MemoryStreamLog>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            read_failures: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            broken_claims: Mutex::new(HashSet::new()),
            broken_acks: Mutex::new(HashSet::new()),
        })
    }

    /// 接下来 `n` 次组读返回传输错误
    pub fn fail_reads(&self, n: usize) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    /// 已发起的组读次数（含失败）
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn break_claim(&self, id: &str) {
        self.broken_claims.lock().unwrap().insert(id.to_string());
    }

    pub fn break_ack(&self, id: &str) {
        self.broken_acks.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl StreamLog for FaultyLog {
    async fn ping(&self) -> EventingResult<()> {
        self.inner.ping().await
    }

    async fn append(&self, stream: &str, fields: EntryFields) -> EventingResult<String> {
        self.inner.append(stream, fields).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> EventingResult<()> {
        self.inner.ensure_group(stream, group).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> EventingResult<Vec<RawEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EventingError::transport("connection refused"));
        }
        self.inner
            .read_group(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> EventingResult<u64> {
        if ids
            .iter()
            .any(|id| self.broken_acks.lock().unwrap().contains(id))
        {
            return Err(EventingError::transport("ack timed out"));
        }
        self.inner.ack(stream, group, ids).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> EventingResult<Vec<PendingEntry>> {
        self.inner.pending(stream, group, min_idle, count).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> EventingResult<Vec<RawEntry>> {
        if ids
            .iter()
            .any(|id| self.broken_claims.lock().unwrap().contains(id))
        {
            return Err(EventingError::transport("claim timed out"));
        }
        self.inner.claim(stream, group, consumer, min_idle, ids).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> EventingResult<u64> {
        self.inner.pending_count(stream, group).await
    }

    async fn range(&self, stream: &str, count: usize) -> EventingResult<Vec<RawEntry>> {
        self.inner.range(stream, count).await
    }
}
