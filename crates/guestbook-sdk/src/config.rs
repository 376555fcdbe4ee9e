//! 同步器配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GuestbookError, Result};
use crate::rate_limiter::MutationRateLimiterConfig;
use crate::reconcile::ReconcilePolicy;
use crate::store::{OrderSpec, SubscriptionFilter};

/// 同步器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 留言表名
    pub table: String,
    /// 表所在 schema
    pub schema: String,
    /// 调和策略
    pub policy: ReconcilePolicy,
    /// 是否启用乐观更新
    pub optimistic: bool,
    /// 乐观补丁等待回显的最长时间（毫秒），超时回滚
    pub optimistic_timeout_ms: u64,
    /// Loading 阶段最多缓存的推送事件数，超出后改为加载完成后重拉一次
    pub max_buffered_events: usize,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 写操作限流
    pub rate_limit: MutationRateLimiterConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            table: "messages".to_string(),
            schema: "public".to_string(),
            policy: ReconcilePolicy::default(),
            optimistic: false,
            optimistic_timeout_ms: 10_000,
            max_buffered_events: 1024,
            event_buffer_size: 256,
            rate_limit: MutationRateLimiterConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_millis(self.optimistic_timeout_ms)
    }

    /// 初次加载与重拉使用的排序（最新在前）
    pub fn order(&self) -> OrderSpec {
        OrderSpec::newest_first()
    }

    /// 订阅整张表的增删改
    pub fn subscription_filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::all_changes(self.schema.clone(), self.table.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(GuestbookError::Config("table 不能为空".to_string()));
        }
        if self.schema.trim().is_empty() {
            return Err(GuestbookError::Config("schema 不能为空".to_string()));
        }
        if self.optimistic && self.optimistic_timeout_ms == 0 {
            return Err(GuestbookError::Config("optimistic_timeout_ms 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(GuestbookError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        self.rate_limit.validate()
    }
}

/// 同步器配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.config.table = table.into();
        self
    }

    pub fn schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.config.schema = schema.into();
        self
    }

    pub fn policy(mut self, policy: ReconcilePolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn optimistic(mut self, enabled: bool) -> Self {
        self.config.optimistic = enabled;
        self
    }

    pub fn optimistic_timeout(mut self, timeout: Duration) -> Self {
        self.config.optimistic_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_buffered_events(mut self, max: usize) -> Self {
        self.config.max_buffered_events = max;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn rate_limit(mut self, config: MutationRateLimiterConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy, ReconcilePolicy::FullRefetch);
        assert_eq!(config.order().to_query_value(), "created_at.desc");
        assert_eq!(config.subscription_filter().table, "messages");
    }

    #[test]
    fn builder_overrides() {
        let config = SyncConfig::builder()
            .table("halls")
            .policy(ReconcilePolicy::Incremental)
            .optimistic(true)
            .optimistic_timeout(Duration::from_secs(3))
            .max_buffered_events(8)
            .build();
        assert_eq!(config.table, "halls");
        assert_eq!(config.optimistic_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_buffered_events, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(SyncConfig::builder().table(" ").build().validate().is_err());
        let zero_timeout = SyncConfig::builder()
            .optimistic(true)
            .optimistic_timeout(Duration::ZERO)
            .build();
        assert!(matches!(zero_timeout.validate(), Err(GuestbookError::Config(_))));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = SyncConfig::builder()
            .rate_limit(MutationRateLimiterConfig {
                like_per_second: 0.0,
                ..Default::default()
            })
            .build();
        assert!(matches!(config.validate(), Err(GuestbookError::Config(_))));
    }
}
