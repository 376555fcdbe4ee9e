//! 远端存储客户端
//!
//! 持久化与实时推送都委托给托管后端。本模块定义同步器依赖的
//! [`RemoteStore`] 抽象以及订阅句柄：
//! - [`MemoryStore`]：进程内实现（测试与演示）
//! - [`RestStore`]：基于托管平台 REST 约定的实现，推送侧由 [`ChangeFeed`] 提供

mod feed;
mod memory;
mod rest;

pub use feed::{ChangeFeed, FeedHub};
pub use memory::MemoryStore;
pub use rest::{RestStore, RestStoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::event::RawChangeEvent;
use crate::record::{NewRecord, Record, RecordId, RecordPatch};

/// 拉取排序规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: String,
    pub ascending: bool,
}

impl OrderSpec {
    /// 最新的留言在最上面
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".to_string(),
            ascending: false,
        }
    }

    /// REST 查询参数形式，例如 `created_at.desc`
    pub fn to_query_value(&self) -> String {
        format!("{}.{}", self.column, if self.ascending { "asc" } else { "desc" })
    }
}

impl Default for OrderSpec {
    fn default() -> Self {
        Self::newest_first()
    }
}

/// 订阅过滤条件（`event = "*"` 表示增删改全部）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub event: String,
    pub schema: String,
    pub table: String,
}

impl SubscriptionFilter {
    pub fn all_changes(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event: "*".to_string(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// 载荷中来源为空时视为匹配（部分通道不回填 schema/table）
    pub fn matches(&self, raw: &RawChangeEvent) -> bool {
        let event_ok = self.event == "*" || self.event.eq_ignore_ascii_case(&raw.event_type);
        let schema_ok = raw.schema.is_empty() || raw.schema == self.schema;
        let table_ok = raw.table.is_empty() || raw.table == self.table;
        event_ok && schema_ok && table_ok
    }
}

/// 订阅的释放句柄（可克隆，释放幂等）
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Arc<str>,
    token: CancellationToken,
    released: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<Arc<str>>, token: CancellationToken) -> Self {
        Self {
            id: id.into(),
            token,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 释放订阅。只有第一次调用返回 true，之后的调用是 no-op
    pub fn cancel(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        debug!("订阅已释放: {}", self.id);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// 一个打开的实时订阅
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<RawChangeEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<RawChangeEvent>, handle: SubscriptionHandle) -> Self {
        Self { receiver, handle }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// 接收下一条推送
    ///
    /// 返回 None 表示订阅已结束：`handle().is_cancelled()` 为 true 时是主动释放，
    /// 否则是通道意外关闭。
    pub async fn next(&mut self) -> Option<RawChangeEvent> {
        tokio::select! {
            biased;
            _ = self.handle.token.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }
}

/// 远端存储客户端（持久化 + 发布订阅）
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 拉取全部记录
    async fn fetch(&self, order: &OrderSpec) -> Result<Vec<Record>>;

    /// 插入新记录，返回服务端分配了 ID 与创建时间的完整记录
    async fn insert(&self, record: NewRecord) -> Result<Record>;

    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<()>;

    async fn delete(&self, id: RecordId) -> Result<()>;

    /// 打开实时订阅
    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<Subscription>;

    /// 释放订阅（幂等）
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        handle.cancel();
        Ok(())
    }
}
