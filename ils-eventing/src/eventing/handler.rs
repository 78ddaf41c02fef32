//! 事件处理器（EventHandler）
//!
//! 外部协作方注册到某个事件名上的处理逻辑。处理器以返回值表达成功/失败，
//! 使业务失败与传输失败可区分；同一条目可能被重复投递，处理器必须幂等。
//!
use crate::event::{AttemptMetadata, Delivery};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::borrow::Cow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// 事件处理器：处理某一事件名的条目
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与失败原因）
    fn handler_name(&self) -> &str;

    /// 处理事件；返回 `Err` 表示业务失败，条目保持待确认以待回收
    async fn handle(
        &self,
        event_name: &str,
        payload: &Value,
        attempt: &AttemptMetadata,
    ) -> anyhow::Result<()>;
}

/// 以闭包实现的处理器
pub struct FnHandler<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(String, Value, AttemptMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<dyn EventHandler> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(String, Value, AttemptMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        event_name: &str,
        payload: &Value,
        attempt: &AttemptMetadata,
    ) -> anyhow::Result<()> {
        (self.f)(event_name.to_string(), payload.clone(), attempt.clone()).await
    }
}

/// 调用处理器；panic 视为失败，返回失败原因
pub(crate) async fn invoke(handler: &dyn EventHandler, delivery: &Delivery) -> Result<(), String> {
    let fut = handler.handle(
        delivery.entry.name(),
        delivery.entry.payload(),
        &delivery.attempt,
    );

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic_reason(panic.as_ref())),
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
