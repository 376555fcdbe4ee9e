//! 客户端写操作限流
//!
//! 留言、点赞、删除都会直接打到托管后端。这里在客户端侧做两件事：
//!
//! 1. **频率限制** - 每类写操作一个令牌桶，另外强制两次留言之间的最小间隔
//! 2. **在途去重** - 同一内容的留言尚未返回时，不允许重复提交（连点发送按钮）
//!
//! ## 限流参数（默认值）
//!
//! | 操作 | 限制 | 说明 |
//! |------|------|------|
//! | 留言 | 2 条/秒 | 正常打字速度 |
//! | 点赞 | 10 次/秒 | 连续点赞 |
//! | 删除 | 5 次/秒 | 批量清理 |

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GuestbookError, Result};

/// 令牌桶限流器
#[derive(Debug)]
pub struct TokenBucket {
    /// 令牌容量
    capacity: f64,
    /// 当前令牌数
    tokens: f64,
    /// 每秒补充的令牌数
    refill_rate: f64,
    /// 上次补充时间
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// 尝试消耗指定数量的令牌
    ///
    /// 返回：(是否成功, 需要等待的时间)
    pub fn try_consume(&mut self, tokens_needed: f64) -> (bool, Option<Duration>) {
        self.refill();

        if self.tokens >= tokens_needed {
            self.tokens -= tokens_needed;
            (true, None)
        } else {
            let tokens_deficit = tokens_needed - self.tokens;
            // 补充速率为 0 时永远等不到令牌
            let wait_duration = Duration::try_from_secs_f64(tokens_deficit / self.refill_rate)
                .unwrap_or(Duration::MAX);
            (false, Some(wait_duration))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// 写操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Post,
    Like,
    Remove,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Like => "like",
            Self::Remove => "remove",
        }
    }
}

/// 写操作限流器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRateLimiterConfig {
    /// 关闭后所有检查直接放行
    pub enabled: bool,
    /// 留言限制（条/秒）
    pub post_per_second: f64,
    /// 点赞限制（次/秒）
    pub like_per_second: f64,
    /// 删除限制（次/秒）
    pub remove_per_second: f64,
    /// 突发容量倍数
    pub burst_multiplier: f64,
    /// 两次留言的最小间隔（毫秒）
    pub min_post_interval_ms: u64,
}

impl Default for MutationRateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            post_per_second: 2.0,
            like_per_second: 10.0,
            remove_per_second: 5.0,
            burst_multiplier: 2.0,
            min_post_interval_ms: 300,
        }
    }
}

impl MutationRateLimiterConfig {
    /// 不限流（测试、批量导入）
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// 校验限流参数；关闭限流时不检查
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for (name, rate) in [
            ("post_per_second", self.post_per_second),
            ("like_per_second", self.like_per_second),
            ("remove_per_second", self.remove_per_second),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(GuestbookError::Config(format!(
                    "{} 必须是大于 0 的有限数: {}",
                    name, rate
                )));
            }
        }
        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            return Err(GuestbookError::Config(format!(
                "burst_multiplier 必须不小于 1: {}",
                self.burst_multiplier
            )));
        }
        Ok(())
    }
}

/// 写操作限流器
#[derive(Debug)]
pub struct MutationRateLimiter {
    config: MutationRateLimiterConfig,
    post_bucket: RwLock<TokenBucket>,
    like_bucket: RwLock<TokenBucket>,
    remove_bucket: RwLock<TokenBucket>,
    /// 上次留言时间（用于强制最小间隔）
    last_post_time: RwLock<Option<Instant>>,
    /// 在途留言内容
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl MutationRateLimiter {
    pub fn new(config: MutationRateLimiterConfig) -> Self {
        let bucket = |per_second: f64| {
            RwLock::new(TokenBucket::new(per_second * config.burst_multiplier, per_second))
        };
        Self {
            post_bucket: bucket(config.post_per_second),
            like_bucket: bucket(config.like_per_second),
            remove_bucket: bucket(config.remove_per_second),
            last_post_time: RwLock::new(None),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    /// 检查某类写操作是否可以执行
    ///
    /// - Ok(()) - 可以执行
    /// - Err(Duration) - 需要等待的时间
    pub fn check(&self, kind: MutationKind) -> std::result::Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        if kind == MutationKind::Post {
            if let Some(last_time) = *self.last_post_time.read() {
                let elapsed = Instant::now().duration_since(last_time);
                let min_interval = Duration::from_millis(self.config.min_post_interval_ms);
                if elapsed < min_interval {
                    let wait_time = min_interval - elapsed;
                    debug!("留言过快，需要等待 {}ms", wait_time.as_millis());
                    return Err(wait_time);
                }
            }
        }

        let bucket = match kind {
            MutationKind::Post => &self.post_bucket,
            MutationKind::Like => &self.like_bucket,
            MutationKind::Remove => &self.remove_bucket,
        };
        let (success, wait_duration) = bucket.write().try_consume(1.0);
        if !success {
            let wait = wait_duration.unwrap_or_default();
            warn!("{} 操作超限，需要等待 {}ms", kind.as_str(), wait.as_millis());
            return Err(wait);
        }

        if kind == MutationKind::Post {
            *self.last_post_time.write() = Some(Instant::now());
        }
        Ok(())
    }

    /// 与 [`MutationRateLimiter::check`] 相同，但返回 SDK 错误
    pub fn acquire(&self, kind: MutationKind) -> Result<()> {
        self.check(kind).map_err(|wait| GuestbookError::RateLimited {
            retry_after_ms: wait.as_millis() as u64,
        })
    }

    /// 登记一条在途留言；同内容的留言尚未完成时返回 InvalidOperation
    ///
    /// 返回的守卫在 drop 时自动解除登记。
    pub fn begin_post(&self, content: &str) -> Result<InFlightPost> {
        if !self.config.enabled {
            return Ok(InFlightPost { key: None, in_flight: self.in_flight.clone() });
        }
        let key = content.trim().to_string();
        if !self.in_flight.lock().insert(key.clone()) {
            warn!("相同内容的留言仍在提交中，忽略重复提交");
            return Err(GuestbookError::InvalidOperation("相同内容的留言正在提交".to_string()));
        }
        Ok(InFlightPost {
            key: Some(key),
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> MutationRateLimiterStats {
        MutationRateLimiterStats {
            post_available_tokens: self.post_bucket.write().available_tokens(),
            like_available_tokens: self.like_bucket.write().available_tokens(),
            remove_available_tokens: self.remove_bucket.write().available_tokens(),
            last_post_elapsed_ms: self
                .last_post_time
                .read()
                .map(|t| Instant::now().duration_since(t).as_millis() as u64),
            in_flight_posts: self.in_flight_count(),
        }
    }
}

/// 在途留言守卫
#[derive(Debug)]
pub struct InFlightPost {
    key: Option<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightPost {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.lock().remove(&key);
        }
    }
}

/// 限流器统计信息
#[derive(Debug, Clone)]
pub struct MutationRateLimiterStats {
    pub post_available_tokens: f64,
    pub like_available_tokens: f64,
    pub remove_available_tokens: f64,
    pub last_post_elapsed_ms: Option<u64>,
    pub in_flight_posts: usize,
}
