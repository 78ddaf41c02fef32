//! 日志初始化
//!
use tracing_subscriber::EnvFilter;

/// 初始化日志；`RUST_LOG` 未设置时默认 `info`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // 重复初始化（如测试中）忽略
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
