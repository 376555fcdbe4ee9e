//! SDK 版本与构建元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成，缺失时为 "unknown"）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// build time（由 vergen 在 build.rs 中生成，缺失时为 "unknown"）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 运行时版本信息（用于日志与诊断）
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub sdk_version: &'static str,
    pub git_sha: &'static str,
    pub build_time: &'static str,
}

/// 获取当前 SDK 的版本信息
pub fn version_info() -> VersionInfo {
    VersionInfo {
        sdk_version: SDK_VERSION,
        git_sha: GIT_SHA,
        build_time: BUILD_TIME,
    }
}
