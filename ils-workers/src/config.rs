//! 环境变量配置（WorkersConfig）
//!
//! 进程启动时读取一次；切换后端需要重启进程。
//! 测试通过 `from_lookup` 注入变量表，不修改进程环境。
//!
use crate::error::{WorkerError, WorkerResult};
use ils_eventing::backend::{BackendKind, DeliveryOptions};
use ils_eventing::consumer::ConsumerName;
use ils_eventing::eventing::{BusConfig, DEFAULT_GROUP, DEFAULT_RECLAIM_STREAM, ReclaimerConfig};
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const WORKERS_QUEUE_BACKEND: &str = "WORKERS_QUEUE_BACKEND";
pub const REDIS_URL: &str = "REDIS_URL";
pub const REDIS_STREAMS_GROUP: &str = "REDIS_STREAMS_GROUP";
pub const REDIS_STREAMS_CONSUMER: &str = "REDIS_STREAMS_CONSUMER";
pub const REDIS_STREAMS_RECLAIM_STREAMS: &str = "REDIS_STREAMS_RECLAIM_STREAMS";
pub const REDIS_STREAMS_RECLAIM_IDLE_MS: &str = "REDIS_STREAMS_RECLAIM_IDLE_MS";
pub const REDIS_STREAMS_RECLAIM_INTERVAL_MS: &str = "REDIS_STREAMS_RECLAIM_INTERVAL_MS";
pub const REDIS_STREAMS_RECLAIM_COUNT: &str = "REDIS_STREAMS_RECLAIM_COUNT";
pub const REDIS_STREAMS_RECLAIM_MAX_DELIVERIES: &str = "REDIS_STREAMS_RECLAIM_MAX_DELIVERIES";
pub const REDIS_STREAMS_PEL_SAMPLER_INTERVAL_MS: &str = "REDIS_STREAMS_PEL_SAMPLER_INTERVAL_MS";
pub const REDIS_STREAMS_READ_COUNT: &str = "REDIS_STREAMS_READ_COUNT";
pub const REDIS_STREAMS_READ_BLOCK_MS: &str = "REDIS_STREAMS_READ_BLOCK_MS";
pub const REDIS_STREAMS_CONSUMERS: &str = "REDIS_STREAMS_CONSUMERS";
pub const REDIS_STREAMS_DLQ_SUFFIX: &str = "REDIS_STREAMS_DLQ_SUFFIX";
pub const REDIS_POOL_SIZE: &str = "REDIS_POOL_SIZE";
pub const METRICS_ENABLED: &str = "METRICS_ENABLED";
pub const METRICS_ADDR: &str = "METRICS_ADDR";
pub const WORKERS_ENABLED: &str = "WORKERS_ENABLED";

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9464))
}

#[derive(Debug, Clone)]
pub struct WorkersConfig {
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    pub group: String,
    /// 未配置时启动时生成
    pub consumer: Option<String>,
    pub reclaim_streams: Vec<String>,
    pub reclaim_idle: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_count: usize,
    pub max_deliveries: Option<u64>,
    pub sampler_interval: Duration,
    pub read_count: usize,
    pub read_block: Duration,
    pub consumers: usize,
    pub dlq_suffix: String,
    pub pool_size: usize,
    pub metrics_enabled: bool,
    pub metrics_addr: SocketAddr,
    /// 未配置时取决于传输是否连通
    pub workers_enabled: Option<bool>,
}

impl WorkersConfig {
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> WorkerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let config = Self {
            backend: env.parse(WORKERS_QUEUE_BACKEND)?.unwrap_or_default(),
            redis_url: env.raw(REDIS_URL),
            group: env.raw(REDIS_STREAMS_GROUP).unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            consumer: env.raw(REDIS_STREAMS_CONSUMER),
            reclaim_streams: env
                .csv(REDIS_STREAMS_RECLAIM_STREAMS)
                .unwrap_or_else(|| vec![DEFAULT_RECLAIM_STREAM.to_string()]),
            reclaim_idle: env.millis(REDIS_STREAMS_RECLAIM_IDLE_MS, 60_000)?,
            reclaim_interval: env.millis(REDIS_STREAMS_RECLAIM_INTERVAL_MS, 300_000)?,
            reclaim_count: env.count(REDIS_STREAMS_RECLAIM_COUNT, 100)?,
            max_deliveries: env.parse(REDIS_STREAMS_RECLAIM_MAX_DELIVERIES)?,
            sampler_interval: env.millis(REDIS_STREAMS_PEL_SAMPLER_INTERVAL_MS, 60_000)?,
            read_count: env.count(REDIS_STREAMS_READ_COUNT, 10)?,
            read_block: env.millis(REDIS_STREAMS_READ_BLOCK_MS, 5_000)?,
            consumers: env.count(REDIS_STREAMS_CONSUMERS, 1)?,
            dlq_suffix: env
                .raw(REDIS_STREAMS_DLQ_SUFFIX)
                .unwrap_or_else(|| ":dlq".to_string()),
            pool_size: env.count(REDIS_POOL_SIZE, 16)?,
            metrics_enabled: env.flag(METRICS_ENABLED)?.unwrap_or(false),
            metrics_addr: env
                .parse(METRICS_ADDR)?
                .unwrap_or_else(default_metrics_addr),
            workers_enabled: env.flag(WORKERS_ENABLED)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> WorkerResult<()> {
        if self.backend.needs_transport() && self.redis_url.is_none() {
            return Err(WorkerError::config(
                REDIS_URL,
                format!("required for the {} backend", self.backend),
            ));
        }
        if self.backend == BackendKind::RedisStreams {
            match self.max_deliveries {
                None => {
                    return Err(WorkerError::config(
                        REDIS_STREAMS_RECLAIM_MAX_DELIVERIES,
                        "required for the redis-streams backend",
                    ));
                }
                Some(0) => {
                    return Err(WorkerError::config(
                        REDIS_STREAMS_RECLAIM_MAX_DELIVERIES,
                        "must be at least 1",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn bus_config(&self) -> BusConfig {
        let consumer = match &self.consumer {
            Some(name) => ConsumerName::new(name.clone()),
            None => ConsumerName::generate("ils"),
        };

        BusConfig::builder()
            .backend(self.backend)
            .maybe_redis_url(self.redis_url.clone())
            .group(self.group.clone())
            .consumer(consumer)
            .delivery(DeliveryOptions {
                read_count: self.read_count,
                read_block: self.read_block,
                consumers: self.consumers,
                dispatch_deadline: self.reclaim_idle,
                ..Default::default()
            })
            .pool_size(self.pool_size)
            .dlq_suffix(self.dlq_suffix.clone())
            .build()
    }

    pub fn reclaimer_config(&self) -> WorkerResult<ReclaimerConfig> {
        let max_deliveries = self.max_deliveries.ok_or_else(|| {
            WorkerError::config(REDIS_STREAMS_RECLAIM_MAX_DELIVERIES, "required to run the reclaimer")
        })?;

        Ok(ReclaimerConfig::builder()
            .streams(self.reclaim_streams.clone())
            .min_idle(self.reclaim_idle)
            .interval(self.reclaim_interval)
            .batch_size(self.reclaim_count)
            .max_deliveries(max_deliveries)
            .build())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// 去除首尾空白；空串视为未设置
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> WorkerResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.raw(var)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|e| WorkerError::config(var, format!("invalid value {v:?}: {e}")))
            })
            .transpose()
    }

    fn count(&self, var: &'static str, default: usize) -> WorkerResult<usize> {
        match self.parse::<usize>(var)? {
            Some(0) => Err(WorkerError::config(var, "must be greater than zero")),
            Some(n) => Ok(n),
            None => Ok(default),
        }
    }

    fn millis(&self, var: &'static str, default: u64) -> WorkerResult<Duration> {
        match self.parse::<u64>(var)? {
            Some(0) => Err(WorkerError::config(var, "must be greater than zero")),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(Duration::from_millis(default)),
        }
    }

    fn flag(&self, var: &'static str) -> WorkerResult<Option<bool>> {
        let Some(v) = self.raw(var) else {
            return Ok(None);
        };
        match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(WorkerError::config(var, format!("invalid boolean {v:?}"))),
        }
    }

    fn csv(&self, var: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .raw(var)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        (!items.is_empty()).then_some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> WorkerResult<WorkersConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkersConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();

        assert_eq!(config.backend, BackendKind::InMemory);
        assert_eq!(config.group, "ils_group");
        assert_eq!(config.reclaim_streams, vec!["order.submitted".to_string()]);
        assert_eq!(config.reclaim_idle, Duration::from_millis(60_000));
        assert_eq!(config.reclaim_interval, Duration::from_millis(300_000));
        assert_eq!(config.sampler_interval, Duration::from_millis(60_000));
        assert_eq!(config.reclaim_count, 100);
        assert!(!config.metrics_enabled);
        assert_eq!(config.workers_enabled, None);
        assert_eq!(config.metrics_addr, "0.0.0.0:9464".parse().unwrap());
    }

    #[test]
    fn streams_backend_reads_all_settings() {
        let config = load(&[
            (WORKERS_QUEUE_BACKEND, "redis-streams"),
            (REDIS_URL, "redis://127.0.0.1:6379"),
            (REDIS_STREAMS_GROUP, "billing"),
            (REDIS_STREAMS_CONSUMER, "worker-7"),
            (REDIS_STREAMS_RECLAIM_STREAMS, "order.submitted, invoice.created ,"),
            (REDIS_STREAMS_RECLAIM_IDLE_MS, "1500"),
            (REDIS_STREAMS_RECLAIM_MAX_DELIVERIES, "5"),
            (METRICS_ENABLED, "YES"),
            (WORKERS_ENABLED, "0"),
        ])
        .unwrap();

        assert_eq!(config.backend, BackendKind::RedisStreams);
        assert_eq!(
            config.reclaim_streams,
            vec!["order.submitted".to_string(), "invoice.created".to_string()]
        );
        assert!(config.metrics_enabled);
        assert_eq!(config.workers_enabled, Some(false));

        let bus = config.bus_config();
        assert_eq!(bus.group, "billing");
        assert_eq!(bus.consumer.as_str(), "worker-7");
        assert_eq!(bus.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(bus.delivery.dispatch_deadline, Duration::from_millis(1500));

        let reclaimer = config.reclaimer_config().unwrap();
        assert_eq!(reclaimer.min_idle, Duration::from_millis(1500));
        assert_eq!(reclaimer.max_deliveries, 5);
    }

    #[test]
    fn transport_backends_require_url() {
        let err = load(&[(WORKERS_QUEUE_BACKEND, "redis-list")]).unwrap_err();
        assert!(matches!(err, WorkerError::Config { var: REDIS_URL, .. }));
    }

    #[test]
    fn streams_backend_requires_delivery_ceiling() {
        let err = load(&[
            (WORKERS_QUEUE_BACKEND, "redis-streams"),
            (REDIS_URL, "redis://localhost"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Config {
                var: REDIS_STREAMS_RECLAIM_MAX_DELIVERIES,
                ..
            }
        ));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        for (var, value) in [
            (WORKERS_QUEUE_BACKEND, "kafka"),
            (REDIS_STREAMS_RECLAIM_IDLE_MS, "soon"),
            (REDIS_STREAMS_RECLAIM_INTERVAL_MS, "0"),
            (METRICS_ENABLED, "maybe"),
        ] {
            let err = load(&[(var, value)]).unwrap_err();
            assert!(err.to_string().contains(var), "{err}");
        }
    }
}
