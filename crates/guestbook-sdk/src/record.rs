//! 留言记录实体
//!
//! 字段名与远端表的列名一致（`created_at` / `like_count` / `author_id`），
//! 拉取结果与实时推送载荷共用同一套反序列化规则。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 记录 ID（服务端分配，记录生命周期内不变，是唯一的相等性键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// 乐观插入使用的本地临时 ID 为负数，服务端 ID 恒为正
    pub fn is_provisional(self) -> bool {
        self.0 < 0
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(RecordId)
    }
}

/// 一条留言
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub content: String,
    /// 创建时间（唯一排序键，降序）
    pub created_at: DateTime<Utc>,
    /// 点赞数（无符号，早期表结构没有该列时为 0）
    #[serde(default)]
    pub like_count: u32,
    /// 作者身份（匿名留言为 None）
    #[serde(default)]
    pub author_id: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            created_at,
            like_count: 0,
            author_id: None,
        }
    }

    pub fn with_likes(mut self, like_count: u32) -> Self {
        self.like_count = like_count;
        self
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    /// 应用更新补丁，返回新记录
    pub fn patched(&self, patch: &RecordPatch) -> Record {
        let mut record = self.clone();
        if let Some(content) = &patch.content {
            record.content = content.clone();
        }
        if let Some(like_count) = patch.like_count {
            record.like_count = like_count;
        }
        record
    }
}

/// 新建留言（插入请求体，ID 与创建时间由服务端分配）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

impl NewRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            author_id: None,
        }
    }

    pub fn with_author(mut self, author_id: Option<String>) -> Self {
        self.author_id = author_id;
        self
    }
}

/// 更新补丁（None 字段不序列化，不会覆盖远端值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u32>,
}

impl RecordPatch {
    pub fn like_count(count: u32) -> Self {
        Self {
            like_count: Some(count),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.like_count.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_deserializes_from_table_row() {
        let row = json!({
            "id": 7,
            "content": "hi",
            "created_at": "2024-05-01T08:00:00+00:00",
            "like_count": 3,
            "author_id": "github|42"
        });
        let record: Record = serde_json::from_value(row).unwrap();
        assert_eq!(record.id, RecordId(7));
        assert_eq!(record.like_count, 3);
        assert_eq!(record.author_id.as_deref(), Some("github|42"));
    }

    #[test]
    fn legacy_row_without_likes_or_author() {
        // 最早的表只有 id / content / created_at 三列
        let row = json!({"id": 1, "content": "hello", "created_at": "2024-05-01T08:00:00Z"});
        let record: Record = serde_json::from_value(row).unwrap();
        assert_eq!(record.like_count, 0);
        assert!(record.author_id.is_none());
    }

    #[test]
    fn negative_like_count_is_rejected() {
        let row = json!({"id": 1, "content": "x", "created_at": "2024-05-01T08:00:00Z", "like_count": -1});
        assert!(serde_json::from_value::<Record>(row).is_err());
    }

    #[test]
    fn patch_skips_unset_fields() {
        let patch = RecordPatch::like_count(5);
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"like_count": 5}));
        assert!(RecordPatch::default().is_empty());
    }

    #[test]
    fn record_id_parsing_and_provisional() {
        assert_eq!("42".parse::<RecordId>().unwrap(), RecordId(42));
        assert!(RecordId(-1).is_provisional());
        assert!(!RecordId(1).is_provisional());
    }
}
