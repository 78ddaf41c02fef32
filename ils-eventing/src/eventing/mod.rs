//! 事件子系统（eventing）
//!
//! 在后端适配器之上提供发布/订阅与恢复机制：
//! - `EventBus`：统一发布/订阅门面，独占一个后端；
//! - `HandlerRegistry`：事件名到处理器的分发表；
//! - `Reclaimer`：周期认领空闲的待确认条目，重试或送入死信；
//! - `PelSampler`：周期采样 PEL 积压量；
//! - `DeadLetterQueue`：终态失败条目的存放与人工重放；
//! - `ScheduledTask`：以上周期任务的调度与取消。
//!
pub mod bus;
pub mod dlq;
pub mod handler;
pub mod reclaimer;
pub mod registry;
pub mod sampler;
pub mod schedule;

pub use bus::{BusConfig, DEFAULT_GROUP, EventBus};
pub use dlq::{DeadLetterQueue, DeadLetterSink};
pub use handler::{EventHandler, FnHandler};
pub use reclaimer::{DEFAULT_RECLAIM_STREAM, ReclaimSummary, Reclaimer, ReclaimerConfig};
pub use registry::HandlerRegistry;
pub use sampler::PelSampler;
pub use schedule::{ScheduledTask, TaskHandle, spawn_periodic};
