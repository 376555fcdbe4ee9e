//! 事件系统模块 - 同步器对外通知
//!
//! 功能包括：
//! - 同步阶段变更事件
//! - 列表变更事件（每次调和之后）
//! - 事件丢弃 / 拉取失败 / 订阅断开等降级通知
//! - 乐观更新回滚通知
//! - 事件广播和订阅机制

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::event::ChangeKind;
use crate::reconcile::ApplyOutcome;
use crate::record::RecordId;
use crate::sync::SyncPhase;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 同步阶段变更
    PhaseChanged {
        old_phase: SyncPhase,
        new_phase: SyncPhase,
        timestamp: i64,
    },
    /// 一个推送事件已应用到本地列表
    EventApplied {
        kind: ChangeKind,
        record_id: RecordId,
        outcome: ApplyOutcome,
        timestamp: i64,
    },
    /// 本地列表已变化（version 单调递增）
    ListChanged {
        version: u64,
        len: usize,
        timestamp: i64,
    },
    /// 推送事件被丢弃（无法识别 / 载荷无效）
    EventDropped {
        error_kind: String,
        message: String,
        timestamp: i64,
    },
    /// 拉取失败（初次加载或重拉）
    LoadFailed {
        error: String,
        timestamp: i64,
    },
    /// 实时通道意外关闭
    SubscriptionDropped {
        generation: u64,
        reason: String,
        timestamp: i64,
    },
    /// 写操作失败
    MutationFailed {
        operation: String,
        error: String,
        timestamp: i64,
    },
    /// 乐观补丁被回滚
    OptimisticRolledBack {
        record_id: RecordId,
        reason: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::PhaseChanged { .. } => "phase_changed",
            SyncEvent::EventApplied { .. } => "event_applied",
            SyncEvent::ListChanged { .. } => "list_changed",
            SyncEvent::EventDropped { .. } => "event_dropped",
            SyncEvent::LoadFailed { .. } => "load_failed",
            SyncEvent::SubscriptionDropped { .. } => "subscription_dropped",
            SyncEvent::MutationFailed { .. } => "mutation_failed",
            SyncEvent::OptimisticRolledBack { .. } => "optimistic_rolled_back",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::PhaseChanged { timestamp, .. }
            | SyncEvent::EventApplied { timestamp, .. }
            | SyncEvent::ListChanged { timestamp, .. }
            | SyncEvent::EventDropped { timestamp, .. }
            | SyncEvent::LoadFailed { timestamp, .. }
            | SyncEvent::SubscriptionDropped { timestamp, .. }
            | SyncEvent::MutationFailed { timestamp, .. }
            | SyncEvent::OptimisticRolledBack { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的记录 ID
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            SyncEvent::EventApplied { record_id, .. } => Some(*record_id),
            SyncEvent::OptimisticRolledBack { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }

    /// 是否表示降级状态（需要调用方关注）
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            SyncEvent::LoadFailed { .. } | SyncEvent::SubscriptionDropped { .. }
        )
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型白名单（为空表示全部）
    pub event_types: Vec<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = event_types;
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event.event_type())
    }
}

type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<parking_lot::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<parking_lot::RwLock<EventStats>>,
}

/// 事件统计
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            stats: Arc::new(parking_lot::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件（同步调用监听器）
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（`"*"` 监听全部类型）
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));
        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn phase_changed(old_phase: SyncPhase, new_phase: SyncPhase) -> SyncEvent {
        SyncEvent::PhaseChanged {
            old_phase,
            new_phase,
            timestamp: now_millis(),
        }
    }

    pub fn event_applied(kind: ChangeKind, record_id: RecordId, outcome: ApplyOutcome) -> SyncEvent {
        SyncEvent::EventApplied {
            kind,
            record_id,
            outcome,
            timestamp: now_millis(),
        }
    }

    pub fn list_changed(version: u64, len: usize) -> SyncEvent {
        SyncEvent::ListChanged {
            version,
            len,
            timestamp: now_millis(),
        }
    }

    pub fn event_dropped(error: &crate::error::GuestbookError) -> SyncEvent {
        SyncEvent::EventDropped {
            error_kind: error.kind().to_string(),
            message: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn load_failed(error: &crate::error::GuestbookError) -> SyncEvent {
        SyncEvent::LoadFailed {
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn subscription_dropped(generation: u64, reason: impl Into<String>) -> SyncEvent {
        SyncEvent::SubscriptionDropped {
            generation,
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }

    pub fn mutation_failed(operation: &str, error: &crate::error::GuestbookError) -> SyncEvent {
        SyncEvent::MutationFailed {
            operation: operation.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn optimistic_rolled_back(record_id: RecordId, reason: impl Into<String>) -> SyncEvent {
        SyncEvent::OptimisticRolledBack {
            record_id,
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe();

        manager.emit(event_builders::list_changed(1, 3));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "list_changed");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("list_changed"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(16);
        let filter = EventFilter::new().with_event_types(vec!["subscription_dropped".to_string()]);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit(event_builders::list_changed(1, 1));
        manager.emit(event_builders::subscription_dropped(2, "eof"));

        let event = filtered.recv().await.unwrap();
        assert!(event.is_degraded());
        assert!(matches!(event, SyncEvent::SubscriptionDropped { generation: 2, .. }));
        assert!(filtered.try_recv().is_err());
    }

    #[test]
    fn test_event_listeners() {
        let manager = EventManager::new(16);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let typed_clone = typed.clone();
        let all_clone = all.clone();

        manager.add_listener("list_changed", move |_| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.add_listener("*", move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });

        for version in 0..3 {
            manager.emit(event_builders::list_changed(version, 0));
        }
        manager.emit(event_builders::optimistic_rolled_back(RecordId(1), "timeout"));

        // 监听器同步执行
        assert_eq!(typed.load(Ordering::SeqCst), 3);
        assert_eq!(all.load(Ordering::SeqCst), 4);
        assert_eq!(manager.get_stats().listener_count, 2);

        manager.clear_listeners();
        manager.emit(event_builders::list_changed(9, 0));
        assert_eq!(all.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_event_properties() {
        let event = event_builders::event_applied(ChangeKind::Insert, RecordId(7), ApplyOutcome::Inserted);
        assert_eq!(event.event_type(), "event_applied");
        assert_eq!(event.record_id(), Some(RecordId(7)));
        assert!(event.timestamp() > 0);
        assert!(!event.is_degraded());
    }
}
