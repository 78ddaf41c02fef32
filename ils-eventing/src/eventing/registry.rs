//! 处理器注册表（HandlerRegistry）
//!
//! 事件名 -> 处理器的分发表；订阅时写入，投递循环与回收器按事件名查找。
//!
use super::EventHandler;
use crate::error::{EventingError, EventingResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// 每个事件名至多一个处理器
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器；重复注册同一事件名返回 `AlreadySubscribed`
    pub fn register(&self, event: &str, handler: Arc<dyn EventHandler>) -> EventingResult<()> {
        match self.handlers.entry(event.to_string()) {
            Entry::Occupied(_) => Err(EventingError::AlreadySubscribed {
                event: event.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn get(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event).map(|h| h.clone())
    }

    /// 撤销注册（订阅启动失败时回滚）
    pub fn remove(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.remove(event).map(|(_, h)| h)
    }

    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.handlers.iter().map(|kv| kv.key().clone()).collect();
        events.sort();
        events
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
