//! Guestbook SDK - 留言板实时列表同步
//!
//! 本 SDK 让客户端的留言列表与托管后端保持一致：
//! - 📥 会话开始时拉取全量列表，同时打开实时订阅
//! - 📡 推送事件归一化为受控的 [`ChangeEvent`]，无法识别的事件直接丢弃
//! - 🧮 两种调和策略：增量应用 / 收到事件即全量重拉
//! - ⚡ 可选的乐观更新：发布、点赞、删除立即可见，失败或超时回滚
//! - 🛡️ 客户端写操作限流与在途去重
//! - ⚙️ 事件系统：阶段变更、列表变更、降级通知
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use guestbook_sdk::{MemoryStore, ReconcilePolicy, SyncConfig, Synchronizer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new("messages"));
//!     let config = SyncConfig::builder()
//!         .policy(ReconcilePolicy::Incremental)
//!         .optimistic(true)
//!         .build();
//!
//!     let sync = Synchronizer::new(store, config)?;
//!
//!     // 每次列表变化后回调
//!     sync.on_change(|snapshot| {
//!         println!("v{}: {} 条留言", snapshot.version, snapshot.len());
//!     });
//!
//!     sync.start().await?;
//!     let record = sync.post("Hello, guestbook!", None).await?;
//!     sync.like(record.id).await?;
//!
//!     sync.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod logging;
pub mod optimistic;
pub mod rate_limiter;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::{GuestbookError, Result};
pub use event::{normalize, ChangeEvent, ChangeKind, RawChangeEvent};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use rate_limiter::{MutationKind, MutationRateLimiter, MutationRateLimiterConfig};
pub use reconcile::{reconcile, ApplyOutcome, LiveList, ReconcilePolicy};
pub use record::{NewRecord, Record, RecordId, RecordPatch};
pub use store::{
    ChangeFeed, FeedHub, MemoryStore, OrderSpec, RemoteStore, RestStore, RestStoreConfig,
    Subscription, SubscriptionFilter, SubscriptionHandle,
};
pub use sync::{ListSnapshot, LoadReport, SyncPhase, Synchronizer};
pub use version::{version_info, VersionInfo, SDK_VERSION};
