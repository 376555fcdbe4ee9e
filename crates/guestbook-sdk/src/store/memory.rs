//! 进程内远端存储
//!
//! 行为与托管后端一致：服务端分配 ID 与创建时间，每次写操作都会通过
//! 实时通道推送与托管平台相同结构的载荷。另外提供测试用的故障注入：
//! 不可用模式、拉取闸门、断开订阅、直接注入原始推送。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::feed::FeedHub;
use super::{OrderSpec, RemoteStore, Subscription, SubscriptionFilter};
use crate::error::{GuestbookError, Result};
use crate::event::RawChangeEvent;
use crate::record::{NewRecord, Record, RecordId, RecordPatch};

#[derive(Default)]
struct MemoryState {
    rows: Vec<Record>,
    next_id: i64,
    last_created_at: Option<DateTime<Utc>>,
}

/// 进程内远端存储
#[derive(Clone)]
pub struct MemoryStore {
    schema: String,
    table: String,
    state: Arc<Mutex<MemoryState>>,
    hub: FeedHub,
    available: Arc<AtomicBool>,
    fetch_gate: Arc<watch::Sender<bool>>,
    fetch_count: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new(table: impl Into<String>) -> Self {
        let (fetch_gate, _) = watch::channel(true);
        Self {
            schema: "public".to_string(),
            table: table.into(),
            state: Arc::new(Mutex::new(MemoryState {
                next_id: 1,
                ..Default::default()
            })),
            hub: FeedHub::new(),
            available: Arc::new(AtomicBool::new(true)),
            fetch_gate: Arc::new(fetch_gate),
            fetch_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 直接写入已有记录（不推送），用于准备初始数据
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        for record in records {
            state.next_id = state.next_id.max(record.id.as_i64() + 1);
            state.last_created_at = state.last_created_at.max(Some(record.created_at));
            state.rows.retain(|r| r.id != record.id);
            state.rows.push(record);
        }
    }

    pub fn rows(&self) -> Vec<Record> {
        self.state.lock().rows.clone()
    }

    /// 推送分发器（可直接注入原始载荷或模拟断线）
    pub fn hub(&self) -> &FeedHub {
        &self.hub
    }

    /// 切换可用状态；不可用时所有调用返回 RemoteUnavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 拦住之后的 fetch，直到 [`MemoryStore::release_fetches`]
    pub fn hold_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    /// 已完成的 fetch 次数
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn ensure_available(&self, op: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            warn!("远端存储不可用: {}", op);
            Err(GuestbookError::RemoteUnavailable(format!("{} 失败: 服务不可用", op)))
        }
    }

    fn publish(&self, raw: RawChangeEvent) {
        self.hub.publish(raw.with_source(self.schema.clone(), self.table.clone()));
    }

    /// 单调递增的服务端时间戳，保证连续插入的排序确定
    fn next_timestamp(state: &mut MemoryState) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match state.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        state.last_created_at = Some(ts);
        ts
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch(&self, order: &OrderSpec) -> Result<Vec<Record>> {
        let mut gate = self.fetch_gate.subscribe();
        let closed = gate.wait_for(|open| *open).await.is_err();
        if closed {
            return Err(GuestbookError::RemoteUnavailable("fetch 闸门已关闭".to_string()));
        }
        self.ensure_available("fetch")?;

        let mut rows = self.state.lock().rows.clone();
        match order.column.as_str() {
            "id" => rows.sort_by_key(|r| r.id),
            _ => rows.sort_by_key(|r| r.created_at),
        }
        if !order.ascending {
            rows.reverse();
        }
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        debug!("fetch 完成: {} 条", rows.len());
        Ok(rows)
    }

    async fn insert(&self, record: NewRecord) -> Result<Record> {
        self.ensure_available("insert")?;
        let inserted = {
            let mut state = self.state.lock();
            let id = RecordId(state.next_id);
            state.next_id += 1;
            let created_at = Self::next_timestamp(&mut state);
            let inserted = Record {
                id,
                content: record.content,
                created_at,
                like_count: 0,
                author_id: record.author_id,
            };
            state.rows.push(inserted.clone());
            inserted
        };
        self.publish(RawChangeEvent::inserted(&inserted));
        Ok(inserted)
    }

    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<()> {
        self.ensure_available("update")?;
        let updated = {
            let mut state = self.state.lock();
            let row = state
                .rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| GuestbookError::NotFound(format!("record {}", id)))?;
            *row = row.patched(&patch);
            row.clone()
        };
        self.publish(RawChangeEvent::updated(id, &updated));
        Ok(())
    }

    async fn delete(&self, id: RecordId) -> Result<()> {
        self.ensure_available("delete")?;
        let removed = {
            let mut state = self.state.lock();
            let before = state.rows.len();
            state.rows.retain(|r| r.id != id);
            state.rows.len() != before
        };
        // 与 REST 语义一致：删除不存在的行不报错，也没有推送
        if removed {
            self.publish(RawChangeEvent::deleted(id));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<Subscription> {
        self.ensure_available("subscribe")?;
        Ok(self.hub.register(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{normalize, ChangeEvent};

    fn filter() -> SubscriptionFilter {
        SubscriptionFilter::all_changes("public", "messages")
    }

    #[tokio::test]
    async fn insert_assigns_id_and_pushes() {
        let store = MemoryStore::new("messages");
        let mut sub = store.subscribe(&filter()).await.unwrap();

        let first = store.insert(NewRecord::new("hi")).await.unwrap();
        let second = store.insert(NewRecord::new("yo")).await.unwrap();
        assert_eq!(first.id, RecordId(1));
        assert_eq!(second.id, RecordId(2));
        assert!(second.created_at > first.created_at);

        let raw = sub.next().await.unwrap();
        assert_eq!(raw.table, "messages");
        assert_eq!(normalize(&raw).unwrap(), ChangeEvent::Inserted(first));
    }

    #[tokio::test]
    async fn fetch_orders_newest_first() {
        let store = MemoryStore::new("messages");
        store.insert(NewRecord::new("a")).await.unwrap();
        store.insert(NewRecord::new("b")).await.unwrap();
        let rows = store.fetch(&OrderSpec::newest_first()).await.unwrap();
        assert_eq!(rows[0].content, "b");
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_push_events() {
        let store = MemoryStore::new("messages");
        let record = store.insert(NewRecord::new("a")).await.unwrap();
        let mut sub = store.subscribe(&filter()).await.unwrap();

        store.update(record.id, RecordPatch::like_count(1)).await.unwrap();
        store.delete(record.id).await.unwrap();
        store.delete(record.id).await.unwrap();

        match normalize(&sub.next().await.unwrap()).unwrap() {
            ChangeEvent::Updated(id, r) => {
                assert_eq!(id, record.id);
                assert_eq!(r.like_count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(normalize(&sub.next().await.unwrap()).unwrap(), ChangeEvent::Deleted(record.id));
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_calls() {
        let store = MemoryStore::new("messages");
        store.set_available(false);
        assert!(matches!(
            store.insert(NewRecord::new("x")).await,
            Err(GuestbookError::RemoteUnavailable(_))
        ));
        assert!(store.fetch(&OrderSpec::default()).await.is_err());
        assert!(store.subscribe(&filter()).await.is_err());
        assert!(store.rows().is_empty());
    }

    #[test]
    fn delete_of_missing_row_is_silent() {
        let store = MemoryStore::new("messages");
        tokio_test::assert_ok!(tokio_test::block_on(store.delete(RecordId(42))));
        assert_eq!(store.hub().active_count(), 0);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = MemoryStore::new("messages");
        assert!(matches!(
            store.update(RecordId(9), RecordPatch::like_count(1)).await,
            Err(GuestbookError::NotFound(_))
        ));
    }
}
