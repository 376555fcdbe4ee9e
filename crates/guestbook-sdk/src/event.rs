//! 变更事件归一化
//!
//! 实时通道推送的原始载荷（事件类型 + 变更前后的行）在这里被校验并转换成
//! 统一的 [`ChangeEvent`]。事件类型为受控枚举，无法识别的类型直接拒绝。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

use crate::error::{GuestbookError, Result};
use crate::record::{Record, RecordId};

/// 推送事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = GuestbookError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("INSERT") {
            Ok(Self::Insert)
        } else if s.eq_ignore_ascii_case("UPDATE") {
            Ok(Self::Update)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Self::Delete)
        } else {
            Err(GuestbookError::UnrecognizedEventKind(s.to_string()))
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实时通道推送的原始变更载荷（postgres_changes 格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
    /// 变更后的行（DELETE 时为空对象）
    #[serde(default)]
    pub new: Value,
    /// 变更前的行（INSERT 时为空对象；DELETE 至少包含主键）
    #[serde(default)]
    pub old: Value,
}

impl RawChangeEvent {
    pub fn new(event_type: impl Into<String>, new: Value, old: Value) -> Self {
        Self {
            event_type: event_type.into(),
            schema: String::new(),
            table: String::new(),
            commit_timestamp: None,
            new,
            old,
        }
    }

    pub fn inserted(record: &Record) -> Self {
        Self::new(
            ChangeKind::Insert.as_str(),
            serde_json::to_value(record).unwrap_or(Value::Null),
            Value::Object(Default::default()),
        )
    }

    pub fn updated(old_id: RecordId, record: &Record) -> Self {
        Self::new(
            ChangeKind::Update.as_str(),
            serde_json::to_value(record).unwrap_or(Value::Null),
            serde_json::json!({ "id": old_id }),
        )
    }

    pub fn deleted(id: RecordId) -> Self {
        Self::new(
            ChangeKind::Delete.as_str(),
            Value::Object(Default::default()),
            serde_json::json!({ "id": id }),
        )
    }

    pub fn with_source(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.table = table.into();
        self
    }
}

/// 归一化后的变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    Inserted(Record),
    Updated(RecordId, Record),
    Deleted(RecordId),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Inserted(_) => ChangeKind::Insert,
            Self::Updated(..) => ChangeKind::Update,
            Self::Deleted(_) => ChangeKind::Delete,
        }
    }

    /// 事件所针对的记录 ID
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Inserted(record) => record.id,
            Self::Updated(id, _) => *id,
            Self::Deleted(id) => *id,
        }
    }
}

/// 把原始推送载荷转换为 [`ChangeEvent`]
///
/// 只做校验与转换，没有任何副作用。
pub fn normalize(raw: &RawChangeEvent) -> Result<ChangeEvent> {
    let kind: ChangeKind = raw.event_type.parse()?;
    let event = match kind {
        ChangeKind::Insert => ChangeEvent::Inserted(parse_row(&raw.new, "new")?),
        ChangeKind::Update => {
            let record = parse_row(&raw.new, "new")?;
            let id = match extract_id(&raw.old)? {
                Some(id) if id != record.id => {
                    return Err(GuestbookError::InvalidData(format!(
                        "UPDATE 载荷 old.id={} 与 new.id={} 不一致",
                        id, record.id
                    )));
                }
                Some(id) => id,
                None => record.id,
            };
            ChangeEvent::Updated(id, record)
        }
        ChangeKind::Delete => {
            let id = extract_id(&raw.old)?
                .ok_or_else(|| GuestbookError::InvalidData("DELETE 载荷缺少 old.id".to_string()))?;
            ChangeEvent::Deleted(id)
        }
    };
    debug!("事件归一化: {} id={}", kind, event.record_id());
    Ok(event)
}

fn parse_row(row: &Value, side: &str) -> Result<Record> {
    if !row.is_object() {
        return Err(GuestbookError::InvalidData(format!("{} 载荷不是对象", side)));
    }
    serde_json::from_value(row.clone())
        .map_err(|e| GuestbookError::InvalidData(format!("{} 载荷解析失败: {}", side, e)))
}

fn extract_id(row: &Value) -> Result<Option<RecordId>> {
    match row.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|id| Some(RecordId(id)))
            .ok_or_else(|| GuestbookError::InvalidData(format!("id 不是整数: {}", n))),
        // 部分通道把 bigint 序列化为字符串
        Some(Value::String(s)) => s
            .parse::<RecordId>()
            .map(Some)
            .map_err(|e| GuestbookError::InvalidData(format!("id 无法解析: {} ({})", s, e))),
        Some(other) => Err(GuestbookError::InvalidData(format!("id 类型不符: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn row(id: i64, likes: u32) -> Value {
        json!({
            "id": id,
            "content": "hi",
            "created_at": "2024-05-01T08:00:00Z",
            "like_count": likes,
        })
    }

    #[test]
    fn change_kind_from_str() {
        assert_eq!("INSERT".parse::<ChangeKind>().unwrap(), ChangeKind::Insert);
        assert_eq!("update".parse::<ChangeKind>().unwrap(), ChangeKind::Update);
        assert_eq!(" Delete ".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
        assert!(matches!(
            "TRUNCATE".parse::<ChangeKind>(),
            Err(GuestbookError::UnrecognizedEventKind(k)) if k == "TRUNCATE"
        ));
    }

    #[test]
    fn normalizes_insert() {
        let raw = RawChangeEvent::new("INSERT", row(1, 0), json!({}));
        let event = normalize(&raw).unwrap();
        match event {
            ChangeEvent::Inserted(r) => {
                assert_eq!(r.id, RecordId(1));
                assert_eq!(r.created_at, Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn update_prefers_old_id() {
        let raw = RawChangeEvent::new("UPDATE", row(1, 2), json!({"id": 1}));
        assert_eq!(normalize(&raw).unwrap().record_id(), RecordId(1));

        // 未开启 replica identity full 时 old 为空，回退到 new.id
        let raw = RawChangeEvent::new("UPDATE", row(5, 2), json!({}));
        assert_eq!(normalize(&raw).unwrap().record_id(), RecordId(5));
    }

    #[test]
    fn update_with_mismatched_ids_is_invalid() {
        let raw = RawChangeEvent::new("UPDATE", row(2, 0), json!({"id": 1}));
        assert!(matches!(normalize(&raw), Err(GuestbookError::InvalidData(_))));

        // 字符串形式的相同 id 仍然接受
        let raw = RawChangeEvent::new("UPDATE", row(2, 0), json!({"id": "2"}));
        assert_eq!(normalize(&raw).unwrap().record_id(), RecordId(2));
    }

    #[test]
    fn delete_reads_old_id_even_as_string() {
        let raw = RawChangeEvent::new("DELETE", json!({}), json!({"id": "9"}));
        assert_eq!(normalize(&raw).unwrap(), ChangeEvent::Deleted(RecordId(9)));
    }

    #[test]
    fn delete_without_id_is_invalid() {
        let raw = RawChangeEvent::new("DELETE", json!({}), json!({}));
        assert!(matches!(normalize(&raw), Err(GuestbookError::InvalidData(_))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = RawChangeEvent::new("TRUNCATE", json!({}), json!({}));
        assert!(matches!(normalize(&raw), Err(GuestbookError::UnrecognizedEventKind(_))));
    }

    #[test]
    fn malformed_row_is_invalid_data() {
        let raw = RawChangeEvent::new("INSERT", json!({"id": 1}), json!({}));
        assert!(matches!(normalize(&raw), Err(GuestbookError::InvalidData(_))));
        let raw = RawChangeEvent::new("INSERT", Value::Null, json!({}));
        assert!(matches!(normalize(&raw), Err(GuestbookError::InvalidData(_))));
    }

    #[test]
    fn raw_payload_uses_event_type_key() {
        let payload = json!({
            "eventType": "DELETE",
            "schema": "public",
            "table": "messages",
            "commit_timestamp": "2024-05-01T08:00:01Z",
            "new": {},
            "old": {"id": 3}
        });
        let raw: RawChangeEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(raw.table, "messages");
        assert_eq!(normalize(&raw).unwrap(), ChangeEvent::Deleted(RecordId(3)));
    }
}
