//! 事件工作进程（ils-workers）
//!
//! 读取环境配置，装配事件总线、处理器、回收器与 PEL 采样器，并提供 `/metrics` 端点。
//!
pub mod config;
pub mod error;
pub mod http;
pub mod runtime;
pub mod telemetry;

pub use config::WorkersConfig;
pub use error::{WorkerError, WorkerResult};
pub use runtime::{Registration, RuntimeHandle, WorkerRuntime};
