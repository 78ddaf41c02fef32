//! 事件子系统统一错误定义
//!
//! 区分传输层错误、处理器失败、回收器内部错误与死信写入失败，
//! 便于运维区分“业务逻辑失败”与“恢复机制本身故障”。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventingError {
    // --- 传输 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },

    // --- 回收/死信 ---
    #[error("reclaimer error: stream={stream}, reason={reason}")]
    ReclaimerInternal { stream: String, reason: String },
    #[error("dead letter write failed: stream={stream}, entry={entry_id}, reason={reason}")]
    DlqWrite {
        stream: String,
        entry_id: String,
        reason: String,
    },

    // --- 订阅/后端 ---
    #[error("handler already subscribed: event={event}")]
    AlreadySubscribed { event: String },
    #[error("no handler subscribed: event={event}")]
    HandlerNotFound { event: String },
    #[error("operation `{operation}` is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    // --- 配置/解析 ---
    #[error("config error: {reason}")]
    Config { reason: String },
    #[error("malformed entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl EventingError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn malformed(entry_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEntry {
            entry_id: entry_id.into(),
            reason: reason.into(),
        }
    }

    /// 是否为传输层错误（下一个 tick 会隐式重试）
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// 统一 Result 类型别名
pub type EventingResult<T> = Result<T, EventingError>;

// 允许在 Redis 适配层直接使用 `?`
#[cfg(feature = "redis")]
impl From<redis::RedisError> for EventingError {
    fn from(err: redis::RedisError) -> Self {
        EventingError::Transport {
            reason: err.to_string(),
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for EventingError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        EventingError::Transport {
            reason: format!("connection pool: {err}"),
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::CreatePoolError> for EventingError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        EventingError::Config {
            reason: format!("cannot create redis pool: {err}"),
        }
    }
}
