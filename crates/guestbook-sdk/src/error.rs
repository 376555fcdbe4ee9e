use thiserror::Error;

/// SDK 统一错误类型
///
/// 本 SDK 内没有致命错误：所有错误都可以由调用方重试恢复。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestbookError {
    /// 远端存储调用失败（拉取 / 写入 / 更新 / 删除）。不自动重试，本地列表保持不变
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),
    /// 推送事件类型无法识别，事件被丢弃
    #[error("Unrecognized event kind: {0}")]
    UnrecognizedEventKind(String),
    /// 实时通道意外关闭，进入降级状态，调用方可重新订阅
    #[error("Subscription dropped: {0}")]
    SubscriptionDropped(String),
    /// 推送载荷字段缺失或类型不符
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// 当前状态不允许该操作（例如重复 start）
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// 会话已关闭
    #[error("Session closed")]
    Closed,
    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl GuestbookError {
    /// 错误类别标签（用于日志和事件统计）
    pub fn kind(&self) -> &'static str {
        match self {
            GuestbookError::RemoteUnavailable(_) => "remote_unavailable",
            GuestbookError::UnrecognizedEventKind(_) => "unrecognized_event_kind",
            GuestbookError::SubscriptionDropped(_) => "subscription_dropped",
            GuestbookError::InvalidData(_) => "invalid_data",
            GuestbookError::InvalidInput(_) => "invalid_input",
            GuestbookError::InvalidOperation(_) => "invalid_operation",
            GuestbookError::NotFound(_) => "not_found",
            GuestbookError::Closed => "closed",
            GuestbookError::RateLimited { .. } => "rate_limited",
            GuestbookError::Serialization(_) => "serialization",
            GuestbookError::Config(_) => "config",
        }
    }

    /// 是否可由调用方重试恢复
    pub fn is_recoverable(&self) -> bool {
        true
    }

    /// 是否是事件载荷层面的错误（丢弃该事件即可，不影响订阅）
    pub fn is_event_error(&self) -> bool {
        matches!(
            self,
            GuestbookError::UnrecognizedEventKind(_) | GuestbookError::InvalidData(_)
        )
    }
}

impl From<serde_json::Error> for GuestbookError {
    fn from(error: serde_json::Error) -> Self {
        GuestbookError::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for GuestbookError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            GuestbookError::Serialization(error.to_string())
        } else {
            GuestbookError::RemoteUnavailable(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, GuestbookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_errors_are_classified() {
        assert!(GuestbookError::UnrecognizedEventKind("TRUNCATE".into()).is_event_error());
        assert!(GuestbookError::InvalidData("missing id".into()).is_event_error());
        assert!(!GuestbookError::RemoteUnavailable("503".into()).is_event_error());
        assert!(GuestbookError::SubscriptionDropped("eof".into()).is_recoverable());
    }

    #[test]
    fn json_errors_become_serialization() {
        let err: GuestbookError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(err.kind(), "serialization");
    }
}
