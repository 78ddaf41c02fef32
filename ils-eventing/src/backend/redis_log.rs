//! Redis Streams 流日志（RedisStreamLog）
//!
//! 以 `deadpool-redis` 连接池执行 XADD / XREADGROUP / XACK / XPENDING / XCLAIM。
//! 原子认领依赖 XCLAIM 的 min-idle-time 参数：认领会重置空闲时间，
//! 并发的第二个认领者因空闲时间不足而拿不到条目。
//!
use super::StreamLog;
use crate::error::EventingResult;
use crate::event::{EntryFields, PendingEntry, RawEntry};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadReply,
};
use std::time::Duration;

/// 按 URL 创建连接池
pub fn create_pool(url: &str, max_size: usize) -> EventingResult<Pool> {
    let mut cfg = Config::from_url(url);
    let pool_cfg = cfg.pool.get_or_insert_with(PoolConfig::default);
    pool_cfg.max_size = max_size;

    Ok(cfg.create_pool(Some(Runtime::Tokio1))?)
}

pub(crate) async fn ping_pool(pool: &Pool) -> EventingResult<()> {
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
    Ok(())
}

pub struct RedisStreamLog {
    pool: Pool,
}

impl std::fmt::Debug for RedisStreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamLog")
            .field("pool_status", &self.pool.status())
            .finish()
    }
}

impl RedisStreamLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn connect(url: &str, max_size: usize) -> EventingResult<Self> {
        Ok(Self::new(create_pool(url, max_size)?))
    }

    async fn conn(&self) -> EventingResult<Connection> {
        Ok(self.pool.get().await?)
    }
}

fn raw_entry(id: StreamId) -> RawEntry {
    let fields = id
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();

    RawEntry { id: id.id, fields }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ping(&self) -> EventingResult<()> {
        ping_pool(&self.pool).await
    }

    async fn append(&self, stream: &str, fields: EntryFields) -> EventingResult<String> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in &fields {
            cmd.arg(k).arg(v);
        }

        Ok(cmd.query_async::<_, String>(&mut conn).await?)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> EventingResult<()> {
        let mut conn = self.conn().await?;
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> EventingResult<Vec<RawEntry>> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        // BLOCK 0 在 Redis 中表示无限等待，这里改为不阻塞
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .map(raw_entry)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> EventingResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        Ok(redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> EventingResult<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                stream_name: stream.to_string(),
                group_name: group.to_string(),
                entry_id: p.id,
                consumer_name: p.consumer,
                delivery_count: p.times_delivered as u64,
                idle_ms: p.last_delivered_ms as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> EventingResult<Vec<RawEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        Ok(reply.ids.into_iter().map(raw_entry).collect())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> EventingResult<u64> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        Ok(reply.count() as u64)
    }

    async fn range(&self, stream: &str, count: usize) -> EventingResult<Vec<RawEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(reply.ids.into_iter().map(raw_entry).collect())
    }
}
