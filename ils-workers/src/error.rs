//! 工作进程错误
//!
//! 事件子系统错误原样包装；配置错误带出问题变量名。
//!
use ils_eventing::error::EventingError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("eventing: {0}")]
    Eventing(#[from] EventingError),

    #[error("config: {var}: {reason}")]
    Config { var: &'static str, reason: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            var,
            reason: reason.into(),
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
