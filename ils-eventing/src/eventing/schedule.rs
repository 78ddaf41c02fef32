//! 周期任务（ScheduledTask）
//!
//! 回收器与 PEL 采样器以固定间隔运行：每个 tick 在循环内直接 `await`，
//! 错过的 tick 被跳过而不是堆叠。测试可直接调用 `tick()` 驱动，无需等待真实时间。
//!
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    fn task_name(&self) -> &str;

    async fn tick(&self);
}

/// 以固定间隔运行任务，直至 `token` 被取消
pub fn spawn_periodic<T>(
    task: Arc<T>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    T: ScheduledTask + ?Sized,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(
            task = task.task_name(),
            interval_ms = interval.as_millis() as u64,
            "scheduled task started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => task.tick().await,
            }
        }

        tracing::debug!(task = task.task_name(), "scheduled task stopped");
    })
}

/// 运行句柄：用于优雅关闭与等待任务结束
pub struct TaskHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: Vec::new(),
        }
    }

    /// 按本句柄的 token 启动一个周期任务
    pub fn spawn<T>(&mut self, task: Arc<T>, interval: Duration)
    where
        T: ScheduledTask + ?Sized,
    {
        let handle = spawn_periodic(task, interval, self.token.child_token());
        self.tasks.push(handle);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTask {
        ticks: AtomicUsize,
        running: AtomicUsize,
        overlapped: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl ScheduledTask for SlowTask {
        fn task_name(&self) -> &str {
            "slow"
        }

        async fn tick(&self) {
            if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(self.work).await;
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_never_stack_when_work_exceeds_interval() {
        let task = Arc::new(SlowTask {
            ticks: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            overlapped: AtomicUsize::new(0),
            work: Duration::from_millis(250),
        });

        let mut handle = TaskHandle::new(CancellationToken::new());
        handle.spawn(task.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        handle.shutdown();
        handle.join().await;

        let ticks = task.ticks.load(Ordering::SeqCst);
        assert!((3..=5).contains(&ticks), "ticks = {ticks}");
        assert_eq!(task.overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let task = Arc::new(SlowTask {
            ticks: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            overlapped: AtomicUsize::new(0),
            work: Duration::ZERO,
        });

        let mut handle = TaskHandle::new(CancellationToken::new());
        handle.spawn(task.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.shutdown();
        handle.join().await;

        let after_shutdown = task.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.ticks.load(Ordering::SeqCst), after_shutdown);
    }
}
