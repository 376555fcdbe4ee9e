//! 留言列表同步器
//!
//! 一个 [`Synchronizer`] 对应一个同步会话：
//!
//! ```text
//! Uninitialized --start--> Loading --加载完成--> Live --close--> Closed
//!                            ^                    |
//!                            +----resubscribe-----+
//! ```
//!
//! 所有状态集中在一个 `parking_lot::Mutex` 里，锁永远不跨 `.await` 持有；
//! 远端调用（拉取、写入）都在锁外完成，回来后再按代数 / 序号校验结果是否过期。

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ListSnapshot, LoadReport, SyncPhase};
use crate::config::SyncConfig;
use crate::error::{GuestbookError, Result};
use crate::event::{normalize, ChangeEvent, RawChangeEvent};
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::optimistic::{OptimisticLayer, OptimisticPatch, PatchId};
use crate::rate_limiter::{MutationKind, MutationRateLimiter, MutationRateLimiterStats};
use crate::reconcile::{ApplyOutcome, LiveList, ReconcilePolicy};
use crate::record::{NewRecord, Record, RecordId, RecordPatch};
use crate::store::{RemoteStore, Subscription, SubscriptionHandle};

type ChangeObserver = Arc<dyn Fn(&ListSnapshot) + Send + Sync>;

struct SyncState {
    phase: SyncPhase,
    /// 每次进入 Loading 加一；旧代数的推送和拉取结果一律丢弃
    generation: u64,
    /// 已确认列表（只由拉取结果和推送事件修改）
    confirmed: LiveList,
    optimistic: OptimisticLayer,
    /// Loading 期间到达的事件（按到达顺序）
    buffered: Vec<ChangeEvent>,
    buffer_overflowed: bool,
    version: u64,
    degraded: Option<String>,
    subscription: Option<SubscriptionHandle>,
    /// 已应用的最新拉取序号
    applied_fetch_seq: u64,
    expiry_timers: HashMap<PatchId, JoinHandle<()>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            generation: 0,
            confirmed: LiveList::new(),
            optimistic: OptimisticLayer::new(),
            buffered: Vec::new(),
            buffer_overflowed: false,
            version: 0,
            degraded: None,
            subscription: None,
            applied_fetch_seq: 0,
            expiry_timers: HashMap::new(),
        }
    }

    fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            version: self.version,
            phase: self.phase,
            records: self.optimistic.view(&self.confirmed).into_records(),
            degraded: self.degraded.clone(),
            pending_patches: self.optimistic.len(),
        }
    }

    /// 可见状态已变化：版本加一并生成快照
    fn bump(&mut self) -> ListSnapshot {
        self.version += 1;
        self.snapshot()
    }

    /// 用回显确认补丁并取消对应定时器
    fn confirm_patches(&mut self, event: &ChangeEvent) -> Vec<PatchId> {
        let mut confirmed = self.optimistic.confirm(event);
        if let (ChangeEvent::Inserted(record), true) = (event, confirmed.is_empty()) {
            // 回显先于 insert 返回：认领对应的临时记录
            confirmed.extend(self.optimistic.absorb_echo(record));
        }
        self.cancel_timers(&confirmed);
        confirmed
    }

    fn cancel_timers(&mut self, patch_ids: &[PatchId]) {
        for patch_id in patch_ids {
            if let Some(timer) = self.expiry_timers.remove(patch_id) {
                timer.abort();
            }
        }
    }
}

/// 推送事件的处理路径
enum Step {
    /// 会话已关闭或订阅已过期
    Stale,
    Buffered,
    Applied {
        event: ChangeEvent,
        outcome: ApplyOutcome,
        snapshot: Option<ListSnapshot>,
    },
    Refetch,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    events: Arc<EventManager>,
    snapshot_tx: watch::Sender<ListSnapshot>,
    observers: RwLock<Vec<ChangeObserver>>,
    limiter: MutationRateLimiter,
    fetch_seq: AtomicU64,
    last_notified: AtomicU64,
}

impl Inner {
    fn next_fetch_seq(&self) -> u64 {
        self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().phase == SyncPhase::Closed {
            return Err(GuestbookError::Closed);
        }
        Ok(())
    }

    fn emit_phase(&self, old: SyncPhase, new: SyncPhase) {
        if old != new {
            info!("同步阶段变更: {} -> {}", old, new);
            self.events.emit(event_builders::phase_changed(old, new));
        }
    }

    /// 通知观察者。并发路径上较旧的快照会被跳过，观察者看到的版本单调递增
    fn notify(&self, snapshot: ListSnapshot) {
        let previous = self.last_notified.fetch_max(snapshot.version, Ordering::SeqCst);
        if previous >= snapshot.version {
            debug!("跳过过期快照: version={} <= {}", snapshot.version, previous);
            return;
        }

        self.snapshot_tx.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot.clone();
                true
            } else {
                false
            }
        });

        let observers: Vec<ChangeObserver> = self.observers.read().clone();
        for observer in observers {
            observer(&snapshot);
        }
        self.events
            .emit(event_builders::list_changed(snapshot.version, snapshot.len()));
    }

    async fn release(&self, handle: &SubscriptionHandle) {
        if let Err(e) = self.store.unsubscribe(handle).await {
            warn!("释放订阅失败（已忽略）: subscription={}, error={}", handle.id(), e);
        }
    }

    // ========== 加载 ==========

    async fn load(self: &Arc<Self>, allowed: SyncPhase) -> Result<LoadReport> {
        let (generation, fetch_seq, previous, old_phase, snapshot) = {
            let mut st = self.state.lock();
            if st.phase == SyncPhase::Closed {
                return Err(GuestbookError::Closed);
            }
            if st.phase != allowed {
                return Err(GuestbookError::InvalidOperation(format!(
                    "当前阶段 {} 不能开始加载",
                    st.phase
                )));
            }
            st.generation += 1;
            let old_phase = std::mem::replace(&mut st.phase, SyncPhase::Loading);
            st.buffered.clear();
            st.buffer_overflowed = false;
            st.degraded = None;
            let previous = st.subscription.take();
            (st.generation, self.next_fetch_seq(), previous, old_phase, st.bump())
        };

        if let Some(handle) = previous {
            self.release(&handle).await;
        }
        self.emit_phase(old_phase, SyncPhase::Loading);
        self.notify(snapshot);
        info!("🔄 开始加载留言列表: table={}, generation={}", self.config.table, generation);

        let order = self.config.order();
        let filter = self.config.subscription_filter();
        let (fetched, subscribed) = tokio::join!(
            self.store.fetch(&order),
            self.open_subscription(&filter, generation)
        );

        let (report, old_phase, snapshot) = self.finish_loading(generation, fetch_seq, fetched, subscribed)?;

        self.emit_phase(old_phase, SyncPhase::Live);
        if let Some(e) = &report.fetch_error {
            self.events.emit(event_builders::load_failed(e));
        }
        if let Some(e) = &report.subscription_error {
            self.events
                .emit(event_builders::subscription_dropped(generation, e.to_string()));
        }
        self.notify(snapshot);

        if report.refetched {
            self.refetch(generation).await;
        }

        info!(
            "✅ 留言列表加载完成: generation={}, fetched={}, replayed={}, refetched={}",
            generation, report.fetched, report.replayed, report.refetched
        );
        Ok(report)
    }

    async fn open_subscription(
        self: &Arc<Self>,
        filter: &crate::store::SubscriptionFilter,
        generation: u64,
    ) -> Result<SubscriptionHandle> {
        let subscription = self.store.subscribe(filter).await?;
        let handle = subscription.handle();
        let accepted = {
            let mut st = self.state.lock();
            if st.phase == SyncPhase::Loading && st.generation == generation {
                st.subscription = Some(handle.clone());
                true
            } else {
                false
            }
        };
        if !accepted {
            // 加载期间会话被关闭
            self.release(&handle).await;
            return Err(GuestbookError::Closed);
        }
        self.spawn_pump(subscription, generation);
        Ok(handle)
    }

    fn finish_loading(
        &self,
        generation: u64,
        fetch_seq: u64,
        fetched: Result<Vec<Record>>,
        subscribed: Result<SubscriptionHandle>,
    ) -> Result<(LoadReport, SyncPhase, ListSnapshot)> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.phase != SyncPhase::Loading || st.generation != generation {
            debug!("加载结果已过期: generation={}", generation);
            return Err(GuestbookError::Closed);
        }

        let mut report = LoadReport {
            generation,
            ..Default::default()
        };

        match fetched {
            Ok(records) => {
                report.fetched = records.len();
                if fetch_seq > st.applied_fetch_seq {
                    st.applied_fetch_seq = fetch_seq;
                    st.confirmed.replace_all(records);
                }
            }
            Err(e) => {
                error!("❌ 拉取留言列表失败，保留当前列表: {}", e);
                report.fetch_error = Some(e);
            }
        }

        if let Err(e) = subscribed {
            warn!("⚠️ 实时订阅失败，列表不会自动更新: {}", e);
            st.degraded = Some(e.to_string());
            report.subscription_error = Some(e);
        }

        let buffered = std::mem::take(&mut st.buffered);
        if std::mem::take(&mut st.buffer_overflowed) {
            warn!(
                "⚠️ 加载期间推送超过上限 {}，改为完成后重拉",
                self.config.max_buffered_events
            );
            report.refetched = true;
        } else if !buffered.is_empty() {
            report.replayed = buffered.len();
            match self.config.policy {
                ReconcilePolicy::Incremental => {
                    for event in &buffered {
                        st.confirmed.apply(event);
                        st.confirm_patches(event);
                    }
                    debug!("已回放 {} 个缓存事件", buffered.len());
                }
                ReconcilePolicy::FullRefetch => report.refetched = true,
            }
        }

        let old_phase = std::mem::replace(&mut st.phase, SyncPhase::Live);
        Ok((report, old_phase, st.bump()))
    }

    /// 全量重拉；结果只在序号比已应用的更新时生效
    async fn refetch(&self, generation: u64) {
        let seq = self.next_fetch_seq();
        let result = self.store.fetch(&self.config.order()).await;

        let outcome = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.phase == SyncPhase::Closed || st.generation != generation {
                debug!("会话已变化，丢弃重拉结果: seq={}", seq);
                return;
            }
            match result {
                Ok(records) => {
                    if seq <= st.applied_fetch_seq {
                        debug!("丢弃过期的重拉结果: seq={} <= {}", seq, st.applied_fetch_seq);
                        return;
                    }
                    st.applied_fetch_seq = seq;
                    st.confirmed.replace_all(records);
                    let settled = st.optimistic.settle_against(&st.confirmed);
                    st.cancel_timers(&settled);
                    Ok(st.bump())
                }
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(snapshot) => {
                debug!("重拉完成: seq={}, len={}", seq, snapshot.len());
                self.notify(snapshot);
            }
            Err(e) => {
                warn!("⚠️ 重拉失败，保留当前列表: {}", e);
                self.events.emit(event_builders::load_failed(&e));
            }
        }
    }

    // ========== 推送处理 ==========

    fn spawn_pump(self: &Arc<Self>, mut subscription: Subscription, generation: u64) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let handle = subscription.handle();
            debug!("推送处理任务启动: subscription={}, generation={}", handle.id(), generation);

            while let Some(raw) = subscription.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.handle_raw(generation, raw).await {
                    break;
                }
            }

            if handle.is_cancelled() {
                debug!("订阅已释放，推送处理任务退出: {}", handle.id());
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_subscription_lost(generation, &handle);
            }
        });
    }

    fn accepts(&self, generation: u64) -> bool {
        let st = self.state.lock();
        st.phase != SyncPhase::Closed && st.generation == generation
    }

    /// 处理一条推送；返回 false 表示订阅已过期，处理任务应退出
    async fn handle_raw(&self, generation: u64, raw: RawChangeEvent) -> bool {
        if !self.accepts(generation) {
            debug!("丢弃过期推送: {}", raw.event_type);
            return false;
        }

        let event = match normalize(&raw) {
            Ok(event) => event,
            Err(e) => {
                if e.is_event_error() {
                    warn!("⚠️ 丢弃无法处理的推送: {}", e);
                } else {
                    error!("❌ 推送处理异常，已丢弃: {}", e);
                }
                self.events.emit(event_builders::event_dropped(&e));
                return true;
            }
        };

        match self.route(generation, event) {
            Step::Stale => false,
            Step::Buffered => true,
            Step::Applied {
                event,
                outcome,
                snapshot,
            } => {
                debug!("推送已应用: {} id={} -> {:?}", event.kind(), event.record_id(), outcome);
                if let Some(snapshot) = snapshot {
                    self.notify(snapshot);
                }
                self.events.emit(event_builders::event_applied(
                    event.kind(),
                    event.record_id(),
                    outcome,
                ));
                true
            }
            Step::Refetch => {
                self.refetch(generation).await;
                true
            }
        }
    }

    fn route(&self, generation: u64, event: ChangeEvent) -> Step {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.generation != generation {
            return Step::Stale;
        }
        match st.phase {
            SyncPhase::Loading => {
                if st.buffer_overflowed {
                    // 已决定完成后重拉，后续事件无需保留
                } else if st.buffered.len() >= self.config.max_buffered_events {
                    st.buffered.clear();
                    st.buffer_overflowed = true;
                } else {
                    st.buffered.push(event);
                }
                Step::Buffered
            }
            SyncPhase::Live => match self.config.policy {
                ReconcilePolicy::Incremental => {
                    let outcome = st.confirmed.apply(&event);
                    let confirmed = st.confirm_patches(&event);
                    let snapshot = if outcome.changed() || !confirmed.is_empty() {
                        Some(st.bump())
                    } else {
                        None
                    };
                    Step::Applied {
                        event,
                        outcome,
                        snapshot,
                    }
                }
                ReconcilePolicy::FullRefetch => Step::Refetch,
            },
            SyncPhase::Uninitialized | SyncPhase::Closed => Step::Stale,
        }
    }

    fn on_subscription_lost(&self, generation: u64, handle: &SubscriptionHandle) {
        let reason = format!("实时通道意外关闭: subscription={}", handle.id());
        let snapshot = {
            let mut st = self.state.lock();
            if st.phase == SyncPhase::Closed || st.generation != generation {
                return;
            }
            st.subscription = None;
            st.degraded = Some(reason.clone());
            st.bump()
        };
        warn!("⚠️ {}，列表不再自动更新，可调用 resubscribe 恢复", reason);
        self.events
            .emit(event_builders::subscription_dropped(generation, reason));
        self.notify(snapshot);
    }

    // ========== 乐观补丁 ==========

    fn schedule_expiry(self: &Arc<Self>, st: &mut SyncState, patch_id: PatchId) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.optimistic_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(patch_id);
            }
        });
        st.expiry_timers.insert(patch_id, timer);
    }

    /// 叠加一个乐观补丁并启动超时定时器
    fn stage(self: &Arc<Self>, patch: OptimisticPatch) -> PatchId {
        let (patch_id, snapshot) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let patch_id = st.optimistic.push(patch);
            self.schedule_expiry(st, patch_id);
            (patch_id, st.bump())
        };
        self.notify(snapshot);
        patch_id
    }

    fn expire(&self, patch_id: PatchId) {
        self.state.lock().expiry_timers.remove(&patch_id);
        self.rollback(patch_id, "timeout");
    }

    fn rollback(&self, patch_id: PatchId, reason: &str) {
        let (patch, snapshot) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.cancel_timers(&[patch_id]);
            let Some(patch) = st.optimistic.rollback(patch_id) else {
                return;
            };
            (patch, st.bump())
        };
        warn!("↩️ 乐观补丁已回滚: record={}, reason={}", patch.target(), reason);
        self.events
            .emit(event_builders::optimistic_rolled_back(patch.target(), reason));
        self.notify(snapshot);
    }

    /// 插入成功：用服务端记录替换临时记录
    fn resolve_post(&self, patch_id: PatchId, record: &Record) {
        let snapshot = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.confirmed.contains(record.id) {
                // 回显先于写入返回到达
                st.cancel_timers(&[patch_id]);
                if st.optimistic.rollback(patch_id).is_none() {
                    return;
                }
            } else if !st.optimistic.resolve_insert(patch_id, record.clone()) {
                return;
            }
            st.bump()
        };
        self.notify(snapshot);
    }

    fn mutation_failed(&self, kind: MutationKind, error: &GuestbookError, patch_id: Option<PatchId>) {
        warn!("❌ {} 操作失败: {}", kind.as_str(), error);
        self.events
            .emit(event_builders::mutation_failed(kind.as_str(), error));
        if let Some(patch_id) = patch_id {
            self.rollback(patch_id, "remote_failed");
        }
    }

    // ========== 关闭 ==========

    /// 进入 Closed；只有第一次调用返回待释放的订阅
    fn teardown(&self) -> Option<(Option<SubscriptionHandle>, SyncPhase, ListSnapshot)> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.phase == SyncPhase::Closed {
            return None;
        }
        let old_phase = std::mem::replace(&mut st.phase, SyncPhase::Closed);
        st.buffered.clear();
        st.buffer_overflowed = false;
        for (_, timer) in st.expiry_timers.drain() {
            timer.abort();
        }
        st.optimistic.clear();
        let handle = st.subscription.take();
        Some((handle, old_phase, st.bump()))
    }
}

/// 留言列表同步器
///
/// # 示例
///
/// ```no_run
/// use std::sync::Arc;
/// use guestbook_sdk::{MemoryStore, SyncConfig, Synchronizer};
///
/// # async fn demo() -> guestbook_sdk::Result<()> {
/// let store = Arc::new(MemoryStore::new("messages"));
/// let sync = Synchronizer::new(store, SyncConfig::default())?;
/// sync.on_change(|snapshot| println!("{} 条留言", snapshot.len()));
/// sync.start().await?;
/// sync.post("你好", None).await?;
/// sync.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (snapshot_tx, _) = watch::channel(ListSnapshot::empty());
        let inner = Inner {
            store,
            events: Arc::new(EventManager::new(config.event_buffer_size)),
            limiter: MutationRateLimiter::new(config.rate_limit.clone()),
            state: Mutex::new(SyncState::new()),
            snapshot_tx,
            observers: RwLock::new(Vec::new()),
            fetch_seq: AtomicU64::new(0),
            last_notified: AtomicU64::new(0),
            config,
        };
        info!(
            "同步器已创建: {}.{}, policy={:?}, optimistic={}",
            inner.config.schema, inner.config.table, inner.config.policy, inner.config.optimistic
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// 开始会话：并行拉取全量列表与打开实时订阅，完成后进入 Live
    ///
    /// 拉取或订阅失败不会让 start 失败，而是记录在 [`LoadReport`] 里：
    /// 拉取失败时列表为空，订阅失败时进入降级状态。
    pub async fn start(&self) -> Result<LoadReport> {
        self.inner.load(SyncPhase::Uninitialized).await
    }

    /// 重新订阅（订阅断开之后恢复，或主动刷新）
    ///
    /// 旧订阅被释放，代数加一，之后旧订阅上迟到的事件全部丢弃。
    pub async fn resubscribe(&self) -> Result<LoadReport> {
        self.inner.load(SyncPhase::Live).await
    }

    /// 结束会话。幂等：只有第一次调用真正释放订阅并返回 true
    pub async fn close(&self) -> bool {
        let Some((handle, old_phase, snapshot)) = self.inner.teardown() else {
            debug!("同步器已关闭，忽略重复关闭");
            return false;
        };
        if let Some(handle) = handle {
            self.inner.release(&handle).await;
        }
        self.inner.emit_phase(old_phase, SyncPhase::Closed);
        self.inner.notify(snapshot);
        info!("🛑 同步会话已关闭: table={}", self.inner.config.table);
        true
    }

    // ========== 写操作 ==========

    /// 发布新留言
    ///
    /// 内容会去掉首尾空白；空内容返回 InvalidInput。开启乐观更新时，
    /// 临时记录立即出现在列表顶部，直到回显到达或超时。
    pub async fn post(&self, content: &str, author_id: Option<String>) -> Result<Record> {
        self.inner.ensure_open()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(GuestbookError::InvalidInput("留言内容不能为空".to_string()));
        }
        self.inner.limiter.acquire(MutationKind::Post)?;
        let _in_flight = self.inner.limiter.begin_post(content)?;

        let patch_id = if self.inner.config.optimistic {
            let provisional = {
                let mut st = self.inner.state.lock();
                let id = st.optimistic.provisional_id();
                let mut record = Record::new(id, content, Utc::now());
                record.author_id = author_id.clone();
                record
            };
            Some(self.inner.stage(OptimisticPatch::Insert(provisional)))
        } else {
            None
        };

        let new_record = NewRecord::new(content).with_author(author_id);
        match self.inner.store.insert(new_record).await {
            Ok(record) => {
                info!("✅ 留言已发布: id={}", record.id);
                if let Some(patch_id) = patch_id {
                    self.inner.resolve_post(patch_id, &record);
                }
                Ok(record)
            }
            Err(e) => {
                self.inner.mutation_failed(MutationKind::Post, &e, patch_id);
                Err(e)
            }
        }
    }

    /// 点赞：写入 `当前点赞数 + 1`，返回写入的点赞数
    ///
    /// 当前点赞数以本地可见列表为准（包含尚未确认的点赞）。
    pub async fn like(&self, id: RecordId) -> Result<u32> {
        self.inner.ensure_open()?;
        if id.is_provisional() {
            return Err(GuestbookError::InvalidOperation(format!(
                "留言 {} 尚未写入远端",
                id
            )));
        }
        self.inner.limiter.acquire(MutationKind::Like)?;

        let like_count = {
            let st = self.inner.state.lock();
            let visible = st.optimistic.view(&st.confirmed);
            visible
                .get(id)
                .map(|r| r.like_count.saturating_add(1))
                .ok_or_else(|| GuestbookError::NotFound(format!("留言 {}", id)))?
        };
        let patch_id = self
            .inner
            .config
            .optimistic
            .then(|| self.inner.stage(OptimisticPatch::Like { id, like_count }));

        match self
            .inner
            .store
            .update(id, RecordPatch::like_count(like_count))
            .await
        {
            Ok(()) => {
                debug!("点赞已写入: id={}, like_count={}", id, like_count);
                Ok(like_count)
            }
            Err(e) => {
                self.inner.mutation_failed(MutationKind::Like, &e, patch_id);
                Err(e)
            }
        }
    }

    /// 删除留言（删除不存在的留言不报错）
    pub async fn remove(&self, id: RecordId) -> Result<()> {
        self.inner.ensure_open()?;
        if id.is_provisional() {
            return Err(GuestbookError::InvalidOperation(format!(
                "留言 {} 尚未写入远端",
                id
            )));
        }
        self.inner.limiter.acquire(MutationKind::Remove)?;

        let visible = self.snapshot().records.iter().any(|r| r.id == id);
        let patch_id = (self.inner.config.optimistic && visible)
            .then(|| self.inner.stage(OptimisticPatch::Remove { id }));

        match self.inner.store.delete(id).await {
            Ok(()) => {
                debug!("删除已提交: id={}", id);
                Ok(())
            }
            Err(e) => {
                self.inner.mutation_failed(MutationKind::Remove, &e, patch_id);
                Err(e)
            }
        }
    }

    // ========== 观察 ==========

    /// 当前展示用快照
    pub fn snapshot(&self) -> ListSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn records(&self) -> Vec<Record> {
        self.snapshot().records
    }

    pub fn phase(&self) -> SyncPhase {
        self.inner.state.lock().phase
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.state.lock().degraded.is_some()
    }

    /// 快照的 watch 通道（只保留最新值）
    pub fn watch(&self) -> watch::Receiver<ListSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// 注册变更回调。每次列表变化后在处理该变化的任务上同步调用，不要在回调里阻塞
    pub fn on_change<F>(&self, observer: F)
    where
        F: Fn(&ListSnapshot) + Send + Sync + 'static,
    {
        self.inner.observers.write().push(Arc::new(observer));
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.inner.events.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// 事件流；消费过慢丢失的事件会被跳过
    pub fn event_stream(&self) -> BoxStream<'static, SyncEvent> {
        stream::unfold(self.inner.events.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("事件流消费过慢，跳过 {} 个事件", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn rate_limiter_stats(&self) -> MutationRateLimiterStats {
        self.inner.limiter.stats()
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.inner.state.lock().buffered.len()
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some((Some(handle), _, _)) = self.inner.teardown() {
            handle.cancel();
        }
    }
}
