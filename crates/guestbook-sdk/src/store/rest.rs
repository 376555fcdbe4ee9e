//! 托管后端 REST 存储
//!
//! 按托管平台的 REST 约定访问留言表：
//! - `GET    {base}/rest/v1/{table}?select=*&order=created_at.desc`
//! - `POST   {base}/rest/v1/{table}`（`Prefer: return=representation`）
//! - `PATCH  {base}/rest/v1/{table}?id=eq.{id}`
//! - `DELETE {base}/rest/v1/{table}?id=eq.{id}`
//!
//! 每个请求都带 `apikey` 与 `Authorization: Bearer` 头。实时推送不走 REST，
//! 由注入的 [`ChangeFeed`] 提供。

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::feed::ChangeFeed;
use super::{OrderSpec, RemoteStore, Subscription, SubscriptionFilter};
use crate::error::{GuestbookError, Result};
use crate::record::{NewRecord, Record, RecordId, RecordPatch};

/// 环境变量：托管后端地址
pub const ENV_STORE_URL: &str = "GUESTBOOK_STORE_URL";
/// 环境变量：匿名访问密钥
pub const ENV_STORE_ANON_KEY: &str = "GUESTBOOK_STORE_ANON_KEY";
/// 环境变量：留言表名（可选）
pub const ENV_TABLE: &str = "GUESTBOOK_TABLE";
/// 托管平台前端项目惯用的变量名，主变量缺失时回退
pub const ENV_STORE_URL_FALLBACK: &str = "NEXT_PUBLIC_SUPABASE_URL";
pub const ENV_STORE_ANON_KEY_FALLBACK: &str = "NEXT_PUBLIC_SUPABASE_ANON_KEY";

/// REST 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestStoreConfig {
    /// 例如 https://xyzcompany.example.co
    pub base_url: String,
    pub anon_key: String,
    pub schema: String,
    pub table: String,
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            schema: "public".to_string(),
            table: "messages".to_string(),
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// 从环境变量加载；缺少必需项时返回 Config 错误
    ///
    /// | 配置 | 变量 | 回退 |
    /// |------|------|------|
    /// | 地址 | `GUESTBOOK_STORE_URL` | `NEXT_PUBLIC_SUPABASE_URL` |
    /// | 密钥 | `GUESTBOOK_STORE_ANON_KEY` | `NEXT_PUBLIC_SUPABASE_ANON_KEY` |
    /// | 表名 | `GUESTBOOK_TABLE` | 无，默认 `messages` |
    ///
    /// 沿用已有前端项目的 `.env` 时，表名不会自动跟随，需要显式设置 `GUESTBOOK_TABLE`。
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str, fallback: &str| {
            read(key)
                .or_else(|| {
                    let value = read(fallback);
                    if value.is_some() {
                        debug!("{} 未设置，使用 {}", key, fallback);
                    }
                    value
                })
                .ok_or_else(|| {
                    GuestbookError::Config(format!("缺少环境变量 {}（或 {}）", key, fallback))
                })
        };
        let mut config = Self::new(
            required(ENV_STORE_URL, ENV_STORE_URL_FALLBACK)?,
            required(ENV_STORE_ANON_KEY, ENV_STORE_ANON_KEY_FALLBACK)?,
        );
        match lookup(ENV_TABLE).map(|v| v.trim().to_string()) {
            Some(table) if !table.is_empty() => config.table = table,
            _ => info!("{} 未设置，使用默认表: {}", ENV_TABLE, config.table),
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(GuestbookError::Config(format!("base_url 必须是 http(s) 地址: {}", self.base_url)));
        }
        if self.table.is_empty() {
            return Err(GuestbookError::Config("table 不能为空".to_string()));
        }
        Ok(())
    }

    /// 表的 REST 端点
    pub fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), self.table)
    }
}

/// 基于 REST 的远端存储
pub struct RestStore {
    client: Client,
    config: RestStoreConfig,
    feed: Option<Arc<dyn ChangeFeed>>,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| GuestbookError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        info!("✅ REST 存储已创建: {}", config.table_url());
        Ok(Self {
            client,
            config,
            feed: None,
        })
    }

    /// 注入实时推送通道
    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn config(&self) -> &RestStoreConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
            .header("Accept-Profile", &self.config.schema)
            .header("Content-Profile", &self.config.schema)
    }

    fn id_filter(id: RecordId) -> [(&'static str, String); 1] {
        [("id", format!("eq.{}", id))]
    }

    async fn check(op: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!("❌ {} 失败，HTTP 状态码: {}, 错误: {}", op, status, body);
        Err(GuestbookError::RemoteUnavailable(format!(
            "{} 失败，HTTP 状态码: {} ({})",
            op, status, body
        )))
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn fetch(&self, order: &OrderSpec) -> Result<Vec<Record>> {
        let request = self
            .client
            .get(self.config.table_url())
            .query(&[("select", "*".to_string()), ("order", order.to_query_value())]);
        let response = self.authorized(request).send().await?;
        let records: Vec<Record> = Self::check("fetch", response).await?.json().await?;
        debug!("fetch 完成: {} 条", records.len());
        Ok(records)
    }

    async fn insert(&self, record: NewRecord) -> Result<Record> {
        let request = self
            .client
            .post(self.config.table_url())
            .header("Prefer", "return=representation")
            .json(&[record]);
        let response = self.authorized(request).send().await?;
        let mut rows: Vec<Record> = Self::check("insert", response).await?.json().await?;
        let inserted = rows
            .pop()
            .ok_or_else(|| GuestbookError::InvalidData("insert 响应为空".to_string()))?;
        info!("📤 留言已写入: id={}", inserted.id);
        Ok(inserted)
    }

    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .patch(self.config.table_url())
            .query(&Self::id_filter(id))
            .json(&patch);
        let response = self.authorized(request).send().await?;
        Self::check("update", response).await?;
        Ok(())
    }

    async fn delete(&self, id: RecordId) -> Result<()> {
        let request = self.client.delete(self.config.table_url()).query(&Self::id_filter(id));
        let response = self.authorized(request).send().await?;
        Self::check("delete", response).await?;
        info!("🗑️ 留言已删除: id={}", id);
        Ok(())
    }

    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<Subscription> {
        match &self.feed {
            Some(feed) => feed.open(filter).await,
            None => {
                warn!("未配置实时通道，无法订阅 {}.{}", filter.schema, filter.table);
                Err(GuestbookError::SubscriptionDropped("未配置实时通道".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FeedHub;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_from_env_requires_url_and_key() {
        let err = RestStoreConfig::from_lookup(lookup(&[(ENV_STORE_URL, "https://demo.example.co")])).unwrap_err();
        assert!(matches!(err, GuestbookError::Config(msg) if msg.contains(ENV_STORE_ANON_KEY)));

        let config = RestStoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "https://demo.example.co/"),
            (ENV_STORE_ANON_KEY, "anon"),
            (ENV_TABLE, "halls"),
        ]))
        .unwrap();
        assert_eq!(config.table_url(), "https://demo.example.co/rest/v1/halls");
    }

    #[test]
    fn config_falls_back_to_frontend_env_names() {
        let config = RestStoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL_FALLBACK, "https://front.example.co"),
            (ENV_STORE_ANON_KEY_FALLBACK, "front-anon"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "https://front.example.co");
        assert_eq!(config.anon_key, "front-anon");

        // 主变量优先
        let config = RestStoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "https://primary.example.co"),
            (ENV_STORE_URL_FALLBACK, "https://front.example.co"),
            (ENV_STORE_ANON_KEY_FALLBACK, "front-anon"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "https://primary.example.co");
    }

    #[test]
    fn config_defaults_table() {
        let config = RestStoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "http://localhost:54321"),
            (ENV_STORE_ANON_KEY, "anon"),
        ]))
        .unwrap();
        assert_eq!(config.table, "messages");
    }

    #[test]
    fn config_rejects_non_http_url() {
        let config = RestStoreConfig::new("ftp://nope", "anon");
        assert!(matches!(config.validate(), Err(GuestbookError::Config(_))));
        assert!(RestStore::new(config).is_err());
    }

    #[tokio::test]
    async fn subscribe_without_feed_reports_dropped() {
        let store = RestStore::new(RestStoreConfig::new("http://localhost:54321", "anon")).unwrap();
        let filter = SubscriptionFilter::all_changes("public", "messages");
        assert!(matches!(
            store.subscribe(&filter).await,
            Err(GuestbookError::SubscriptionDropped(_))
        ));

        let hub = FeedHub::new();
        let store = RestStore::new(RestStoreConfig::new("http://localhost:54321", "anon"))
            .unwrap()
            .with_change_feed(Arc::new(hub.clone()));
        // 订阅存活期间才计入活跃数
        let subscription = store.subscribe(&filter).await.unwrap();
        assert_eq!(hub.active_count(), 1);
        drop(subscription);
        assert_eq!(hub.active_count(), 0);
    }

    #[tokio::test]
    async fn empty_patch_skips_request() {
        // 指向不可达端口：若真的发起请求会返回错误
        let store = RestStore::new(RestStoreConfig::new("http://127.0.0.1:9", "anon")).unwrap();
        assert!(store.update(RecordId(1), RecordPatch::default()).await.is_ok());
    }
}
