//! 指标注册表（EventingMetrics）
//!
//! 进程级计数器与 PEL 积压量表，供外部 `/metrics` 端点按需拉取；本模块从不主动推送。
//!
use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// 进程级指标
#[derive(Debug, Default)]
pub struct EventingMetrics {
    published_total: AtomicU64,
    handler_failures_total: AtomicU64,
    dropped_total: AtomicU64,
    reclaimed_total: AtomicU64,
    dlq_total: AtomicU64,
    reclaimer_failures_total: AtomicU64,
    // (stream, group) -> pending
    pending_entries: DashMap<(String, String), u64>,
}

/// 某一时刻的指标快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published_total: u64,
    pub handler_failures_total: u64,
    pub dropped_total: u64,
    pub reclaimed_total: u64,
    pub dlq_total: u64,
    pub reclaimer_failures_total: u64,
    /// 按 (stream, group) 排序
    pub pending_entries: Vec<(String, String, u64)>,
}

impl EventingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 发布时无人接收而丢弃（仅内存后端）
    pub fn record_dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 回收后重新处理成功
    pub fn record_reclaimed(&self) {
        self.reclaimed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dlq_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 回收机制自身的错误（与处理器失败区分）
    pub fn record_reclaimer_failure(&self) {
        self.reclaimer_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, stream: &str, group: &str, count: u64) {
        self.pending_entries
            .insert((stream.to_string(), group.to_string()), count);
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed_total.load(Ordering::Relaxed)
    }

    pub fn dlq_total(&self) -> u64 {
        self.dlq_total.load(Ordering::Relaxed)
    }

    pub fn reclaimer_failures_total(&self) -> u64 {
        self.reclaimer_failures_total.load(Ordering::Relaxed)
    }

    pub fn pending(&self, stream: &str, group: &str) -> Option<u64> {
        self.pending_entries
            .get(&(stream.to_string(), group.to_string()))
            .map(|v| *v)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut pending_entries: Vec<(String, String, u64)> = self
            .pending_entries
            .iter()
            .map(|kv| (kv.key().0.clone(), kv.key().1.clone(), *kv.value()))
            .collect();
        pending_entries.sort();

        MetricsSnapshot {
            published_total: self.published_total.load(Ordering::Relaxed),
            handler_failures_total: self.handler_failures_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total(),
            reclaimed_total: self.reclaimed_total(),
            dlq_total: self.dlq_total(),
            reclaimer_failures_total: self.reclaimer_failures_total(),
            pending_entries,
        }
    }

    /// Prometheus 文本格式
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        let counters = [
            ("published_total", "Events appended through publish()", snap.published_total),
            (
                "handler_failures_total",
                "Handler invocations that returned failure or panicked",
                snap.handler_failures_total,
            ),
            (
                "dropped_total",
                "Events published with no in-memory subscriber",
                snap.dropped_total,
            ),
            (
                "reclaimed_total",
                "Pending entries reclaimed and successfully reprocessed",
                snap.reclaimed_total,
            ),
            ("dlq_total", "Entries written to a dead letter stream", snap.dlq_total),
            (
                "reclaimer_failures_total",
                "Internal reclaimer errors, excluding handler failures",
                snap.reclaimer_failures_total,
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let _ = writeln!(out, "# HELP pending_entries Delivered but unacknowledged entries");
        let _ = writeln!(out, "# TYPE pending_entries gauge");
        for (stream, group, count) in &snap.pending_entries {
            let _ = writeln!(
                out,
                "pending_entries{{stream=\"{}\",group=\"{}\"}} {count}",
                escape_label(stream),
                escape_label(group)
            );
        }

        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
