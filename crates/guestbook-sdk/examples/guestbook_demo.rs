//! 留言板同步演示
//!
//! 使用进程内存储模拟托管后端：一个同步器开启乐观更新，
//! 另一个"客户端"直接写入存储，观察实时推送如何反映到列表上。

use guestbook_sdk::logging::init_tracing;
use guestbook_sdk::{
    version_info, MemoryStore, NewRecord, ReconcilePolicy, RecordPatch, RemoteStore, SyncConfig,
    SyncEvent, Synchronizer,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    init_tracing(false);

    let version = version_info();
    println!("========================================");
    println!("留言板同步演示 v{} ({})", version.sdk_version, version.git_sha);
    println!("========================================\n");

    let store = Arc::new(MemoryStore::new("messages"));
    let config = SyncConfig::builder()
        .policy(ReconcilePolicy::Incremental)
        .optimistic(true)
        .optimistic_timeout(Duration::from_secs(5))
        .build();
    let sync = Synchronizer::new(store.clone(), config)?;

    sync.on_change(|snapshot| {
        println!(
            "📋 v{} [{}] {} 条留言，{} 个待确认补丁",
            snapshot.version,
            snapshot.phase,
            snapshot.len(),
            snapshot.pending_patches
        );
    });
    sync.events().add_listener("*", |event| {
        if event.is_degraded() || matches!(event, SyncEvent::OptimisticRolledBack { .. }) {
            println!("⚠️ {:?}", event);
        }
    });

    // === 1. 开始会话 ===
    let report = sync.start().await?;
    println!("✅ 加载完成: fetched={}, replayed={}\n", report.fetched, report.replayed);

    // === 2. 本地发布与点赞 ===
    let first = sync.post("第一条留言", Some("alice".to_string())).await?;
    sleep(Duration::from_millis(400)).await;
    sync.post("第二条留言", Some("alice".to_string())).await?;
    sync.like(first.id).await?;
    sleep(Duration::from_millis(100)).await;

    // === 3. 其他客户端的写入 ===
    let other = store.insert(NewRecord::new("来自其他客户端")).await?;
    store.update(other.id, RecordPatch::like_count(3)).await?;
    sleep(Duration::from_millis(100)).await;

    // === 4. 删除 ===
    sync.remove(first.id).await?;
    sleep(Duration::from_millis(100)).await;

    println!("\n当前列表:");
    for record in sync.records() {
        println!("  #{} {} ❤️ {}", record.id, record.content, record.like_count);
    }

    // === 5. 实时通道断开与恢复 ===
    store.hub().drop_all();
    sleep(Duration::from_millis(50)).await;
    println!("\n降级状态: {}", sync.is_degraded());
    sync.resubscribe().await?;
    println!("重新订阅后降级状态: {}", sync.is_degraded());

    sync.close().await;
    println!("\n✅ 演示完成");
    Ok(())
}
