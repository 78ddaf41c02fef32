//! 事件总线与消费者组协调库（ils-eventing）
//!
//! 提供可插拔的发布/订阅层与“至少一次”的恢复机制：
//! - 后端适配器（`backend`）：内存、Redis 列表、Redis Streams 消费者组
//! - 事件总线与处理器分发（`eventing`）
//! - 回收器、PEL 采样器与死信队列（`eventing`）
//! - 进程级指标（`metrics`）
//!
//! 处理器可能收到重复投递，必须幂等；进程退出时处理中的条目留在 PEL，重启后由回收器接续。
//!
//! 典型用法：
//! 1. 以 `BusConfig` 连接 `EventBus`，为每个事件名订阅一个 `EventHandler`；
//! 2. 对 `redis-streams` 后端启动 `Reclaimer` 与 `PelSampler`；
//! 3. 通过 `EventingMetrics::render_prometheus` 暴露指标。
//!
pub mod backend;
pub mod consumer;
pub mod error;
pub mod event;
pub mod eventing;
pub mod metrics;
