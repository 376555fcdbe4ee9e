//! 实时列表同步模块
//!
//! 职责：
//! - 会话开始时拉取全量列表并打开实时订阅
//! - Loading 阶段缓存推送事件，加载完成后按到达顺序回放
//! - Live 阶段把每个推送事件交给调和器，并同步通知观察者
//! - 会话结束时只释放一次订阅，之后到达的事件一律丢弃

mod synchronizer;

pub use synchronizer::Synchronizer;

use serde::{Deserialize, Serialize};

use crate::error::GuestbookError;
use crate::record::Record;

/// 同步阶段
///
/// `Uninitialized -> Loading -> Live -> Closed`；重新订阅时 `Live -> Loading`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// 尚未开始
    Uninitialized,
    /// 正在拉取初始列表
    Loading,
    /// 实时同步中
    Live,
    /// 会话已结束
    Closed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Uninitialized => write!(f, "未初始化"),
            SyncPhase::Loading => write!(f, "加载中"),
            SyncPhase::Live => write!(f, "实时同步"),
            SyncPhase::Closed => write!(f, "已关闭"),
        }
    }
}

/// 展示用列表快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshot {
    /// 单调递增，每次可见状态变化加一
    pub version: u64,
    pub phase: SyncPhase,
    /// 按创建时间降序（已叠加乐观补丁）
    pub records: Vec<Record>,
    /// 降级原因（实时通道断开时）
    pub degraded: Option<String>,
    /// 尚未确认的乐观补丁数
    pub pending_patches: usize,
}

impl ListSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            phase: SyncPhase::Uninitialized,
            records: Vec::new(),
            degraded: None,
            pending_patches: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// 一次加载（start / resubscribe）的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// 订阅代数
    pub generation: u64,
    /// 拉取到的记录数
    pub fetched: usize,
    /// Loading 期间缓存并回放的事件数
    pub replayed: usize,
    /// 加载完成后是否又做了一次全量重拉
    pub refetched: bool,
    /// 拉取失败（列表保持不变，初次加载时为空列表）
    pub fetch_error: Option<GuestbookError>,
    /// 订阅失败（进入降级状态）
    pub subscription_error: Option<GuestbookError>,
}

impl LoadReport {
    pub fn is_degraded(&self) -> bool {
        self.fetch_error.is_some() || self.subscription_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display() {
        assert_eq!(SyncPhase::Live.to_string(), "实时同步");
        assert_eq!(SyncPhase::Closed.to_string(), "已关闭");
    }

    #[test]
    fn report_degraded() {
        let mut report = LoadReport::default();
        assert!(!report.is_degraded());
        report.subscription_error = Some(GuestbookError::SubscriptionDropped("eof".into()));
        assert!(report.is_degraded());
    }
}
