//! 实时推送分发
//!
//! 传输细节（websocket / 长连接）不在本 SDK 范围内：外部传输层把收到的
//! 原始载荷交给 [`FeedHub::publish`]，由它分发给所有匹配的订阅。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Subscription, SubscriptionFilter, SubscriptionHandle};
use crate::error::Result;
use crate::event::RawChangeEvent;

/// 推送通道提供者
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open(&self, filter: &SubscriptionFilter) -> Result<Subscription>;
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::UnboundedSender<RawChangeEvent>,
    token: CancellationToken,
}

/// 订阅注册表 + 扇出
#[derive(Clone, Default)]
pub struct FeedHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个新订阅
    pub fn register(&self, filter: &SubscriptionFilter) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.lock().push(Subscriber {
            filter: filter.clone(),
            sender,
            token: token.clone(),
        });
        info!("📡 实时订阅已打开: id={}, {}.{} event={}", id, filter.schema, filter.table, filter.event);
        Subscription::new(receiver, SubscriptionHandle::new(id, token))
    }

    /// 分发一条原始推送，返回送达的订阅数
    pub fn publish(&self, raw: RawChangeEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        // 已释放或接收端已丢弃的订阅在这里顺带清理
        subscribers.retain(|s| !s.token.is_cancelled() && !s.sender.is_closed());
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.filter.matches(&raw)) {
            if subscriber.sender.send(raw.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!("推送分发: {} -> {} 个订阅", raw.event_type, delivered);
        delivered
    }

    /// 模拟通道意外关闭：丢弃全部发送端但不取消订阅
    pub fn drop_all(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!("实时通道关闭，断开 {} 个订阅", count);
        }
        count
    }

    /// 当前活跃订阅数
    pub fn active_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.token.is_cancelled() && !s.sender.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl ChangeFeed for FeedHub {
    async fn open(&self, filter: &SubscriptionFilter) -> Result<Subscription> {
        Ok(self.register(filter))
    }
}
