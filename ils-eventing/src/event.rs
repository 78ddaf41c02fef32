//! 事件传输模型
//!
//! 定义流条目（`StreamEntry`）、待确认条目（`PendingEntry`）、死信条目（`DlqEntry`）
//! 以及它们与传输层字段表（`RawEntry`）之间的转换。
//!
use crate::error::{EventingError, EventingResult};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const FIELD_EVENT: &str = "event";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_PUBLISHED_AT: &str = "published_at";

const FIELD_ORIGINAL_ID: &str = "original_id";
const FIELD_STREAM: &str = "stream";
const FIELD_GROUP: &str = "group";
const FIELD_REASON: &str = "reason";
const FIELD_FAILED_AT: &str = "failed_at";
const FIELD_DELIVERY_COUNT: &str = "delivery_count";

/// 写入传输层的字段表（保持写入顺序）
pub type EntryFields = Vec<(String, String)>;

/// 传输层原始条目：后端分配的 id 与字段表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl RawEntry {
    pub fn new(id: impl Into<String>, fields: EntryFields) -> Self {
        Self {
            id: id.into(),
            fields: fields.into_iter().collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn required(&self, name: &str) -> EventingResult<&str> {
        self.field(name)
            .ok_or_else(|| EventingError::malformed(&self.id, format!("missing field `{name}`")))
    }
}

/// 流条目：一次 `publish` 写入的不可变事件
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
pub struct StreamEntry {
    /// 后端在写入时分配的 id，也是确认（ack）的单位
    #[builder(into)]
    id: String,
    /// 事件名，同时也是流名
    #[builder(into)]
    name: String,
    /// 事件负载
    payload: Value,
    /// 发布时间；由其他生产者写入的条目可能缺失
    published_at: Option<DateTime<Utc>>,
}

impl StreamEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    /// 构造写入字段表
    pub fn encode(
        name: &str,
        payload: &Value,
        published_at: DateTime<Utc>,
    ) -> EventingResult<EntryFields> {
        Ok(vec![
            (FIELD_EVENT.to_string(), name.to_string()),
            (FIELD_PAYLOAD.to_string(), serde_json::to_string(payload)?),
            (FIELD_PUBLISHED_AT.to_string(), published_at.to_rfc3339()),
        ])
    }

    /// 从原始条目解码；缺少 `event` 字段时以流名代替
    pub fn decode(stream: &str, raw: &RawEntry) -> EventingResult<Self> {
        let payload = serde_json::from_str(raw.required(FIELD_PAYLOAD)?)
            .map_err(|e| EventingError::malformed(&raw.id, e.to_string()))?;
        let published_at = raw
            .field(FIELD_PUBLISHED_AT)
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| EventingError::malformed(&raw.id, e.to_string()))?
            .map(|t| t.with_timezone(&Utc));

        Ok(Self {
            id: raw.id.clone(),
            name: raw.field(FIELD_EVENT).unwrap_or(stream).to_string(),
            payload,
            published_at,
        })
    }
}

/// 待确认条目（PEL 中的一项）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub stream_name: String,
    pub group_name: String,
    pub entry_id: String,
    pub consumer_name: String,
    pub delivery_count: u64,
    pub idle_ms: u64,
}

/// 每次调用处理器时附带的投递信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptMetadata {
    pub entry_id: String,
    pub consumer: String,
    /// 第几次投递（首次为 1，每次回收 +1）
    pub delivery_count: u64,
    /// 是否来自回收器
    pub reclaimed: bool,
}

/// 一次投递：条目 + 投递信息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub entry: StreamEntry,
    pub attempt: AttemptMetadata,
}

/// 死信条目：终态失败的消息及失败原因，仅供人工检查/重放
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    #[builder(into)]
    original_event_id: String,
    original_payload: Value,
    #[builder(into)]
    stream_name: String,
    #[builder(into)]
    group_name: String,
    #[builder(into)]
    failure_reason: String,
    #[builder(default = Utc::now())]
    failed_at: DateTime<Utc>,
    delivery_count: u64,
}

impl DlqEntry {
    pub fn original_event_id(&self) -> &str {
        &self.original_event_id
    }

    pub fn original_payload(&self) -> &Value {
        &self.original_payload
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }

    pub fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    pub fn encode(&self) -> EventingResult<EntryFields> {
        Ok(vec![
            (FIELD_ORIGINAL_ID.to_string(), self.original_event_id.clone()),
            (FIELD_STREAM.to_string(), self.stream_name.clone()),
            (FIELD_GROUP.to_string(), self.group_name.clone()),
            (
                FIELD_PAYLOAD.to_string(),
                serde_json::to_string(&self.original_payload)?,
            ),
            (FIELD_REASON.to_string(), self.failure_reason.clone()),
            (FIELD_FAILED_AT.to_string(), self.failed_at.to_rfc3339()),
            (
                FIELD_DELIVERY_COUNT.to_string(),
                self.delivery_count.to_string(),
            ),
        ])
    }

    pub fn decode(raw: &RawEntry) -> EventingResult<Self> {
        let malformed = |e: &dyn std::fmt::Display| EventingError::malformed(&raw.id, e.to_string());

        Ok(Self {
            original_event_id: raw.required(FIELD_ORIGINAL_ID)?.to_string(),
            original_payload: serde_json::from_str(raw.required(FIELD_PAYLOAD)?)
                .map_err(|e| malformed(&e))?,
            stream_name: raw.required(FIELD_STREAM)?.to_string(),
            group_name: raw.field(FIELD_GROUP).unwrap_or_default().to_string(),
            failure_reason: raw.required(FIELD_REASON)?.to_string(),
            failed_at: DateTime::parse_from_rfc3339(raw.required(FIELD_FAILED_AT)?)
                .map_err(|e| malformed(&e))?
                .with_timezone(&Utc),
            delivery_count: raw
                .field(FIELD_DELIVERY_COUNT)
                .map(str::parse)
                .transpose()
                .map_err(|e| malformed(&e))?
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_falls_back_to_stream_name() {
        let raw = RawEntry::new(
            "1-0",
            vec![(FIELD_PAYLOAD.to_string(), r#"{"orderId":"O-1"}"#.to_string())],
        );

        let entry = StreamEntry::decode("order.submitted", &raw).unwrap();
        assert_eq!(entry.name(), "order.submitted");
        assert_eq!(entry.payload(), &json!({"orderId": "O-1"}));
        assert!(entry.published_at().is_none());
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        let raw = RawEntry::new(
            "1-0",
            vec![(FIELD_PAYLOAD.to_string(), "not json".to_string())],
        );

        let err = StreamEntry::decode("s", &raw).unwrap_err();
        assert!(matches!(err, EventingError::MalformedEntry { ref entry_id, .. } if entry_id == "1-0"));
    }

    #[test]
    fn dlq_entry_keeps_failure_context() {
        let entry = DlqEntry::builder()
            .original_event_id("5-0")
            .original_payload(json!({"orderId": "O-1"}))
            .stream_name("order.submitted")
            .group_name("ils_group")
            .failure_reason("smtp down")
            .delivery_count(3)
            .build();

        let raw = RawEntry::new("9-0", entry.encode().unwrap());
        let decoded = DlqEntry::decode(&raw).unwrap();

        assert_eq!(decoded.original_event_id(), "5-0");
        assert_eq!(decoded.failure_reason(), "smtp down");
        assert_eq!(decoded.delivery_count(), 3);
        assert_eq!(decoded.failed_at().timestamp(), entry.failed_at().timestamp());
    }
}
