//! 日志初始化
//!
//! SDK 自身只通过 `tracing` 宏输出日志，从不主动安装订阅器。
//! 应用或示例需要控制台输出时调用 [`init_tracing`]。

use tracing_subscriber::EnvFilter;

/// 默认过滤规则（`RUST_LOG` 未设置时使用）
pub fn default_filter(debug: bool) -> String {
    if debug {
        "guestbook_sdk=debug,info".to_string()
    } else {
        "guestbook_sdk=info,warn".to_string()
    }
}

/// 安装控制台日志订阅器
///
/// 优先使用 `RUST_LOG`。重复调用时返回 false（已有全局订阅器）。
pub fn init_tracing(debug: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_levels() {
        assert!(default_filter(true).contains("guestbook_sdk=debug"));
        assert!(default_filter(false).contains("guestbook_sdk=info"));
    }

    #[test]
    fn second_init_is_rejected() {
        init_tracing(false);
        assert!(!init_tracing(false));
    }
}
