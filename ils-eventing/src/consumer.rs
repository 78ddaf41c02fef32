//! 消费者标识
//!
//! 进程启动时生成一次，并显式传递给所有需要它的组件（订阅循环、回收器）。
//!
use std::fmt;
use uuid::Uuid;

/// 组内唯一的消费者名称
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerName(String);

impl ConsumerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// 生成 `<prefix>-<pid>-<uuid8>` 形式的名称
    pub fn generate(prefix: &str) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}-{}-{}", std::process::id(), &uuid[..8]))
    }

    /// 同一订阅下第 `index` 个逻辑消费者；0 号即本名
    pub fn logical(&self, index: usize) -> Self {
        if index == 0 {
            self.clone()
        } else {
            Self(format!("{}-{index}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
