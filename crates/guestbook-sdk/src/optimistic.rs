//! 乐观更新层
//!
//! 增量调和模式下，本地列表只在收到回显推送后才变化。需要即时反馈的调用方
//! 可以开启乐观更新：写操作发起时先把补丁叠加在已确认列表之上展示，
//! 然后按以下规则收敛：
//! - 收到匹配的回显事件 → 补丁确认，移除（此时已确认列表已包含该变更）
//! - 远端调用失败 → 立即回滚
//! - 超时仍未收到回显 → 回滚
//!
//! 本模块只维护补丁数据，定时器由同步器驱动。

use crate::event::ChangeEvent;
use crate::reconcile::LiveList;
use crate::record::{Record, RecordId, RecordPatch};

pub type PatchId = u64;

/// 一个乐观补丁
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticPatch {
    /// 新留言（远端返回前使用负数临时 ID）
    Insert(Record),
    Like { id: RecordId, like_count: u32 },
    Remove { id: RecordId },
}

impl OptimisticPatch {
    pub fn target(&self) -> RecordId {
        match self {
            OptimisticPatch::Insert(record) => record.id,
            OptimisticPatch::Like { id, .. } => *id,
            OptimisticPatch::Remove { id } => *id,
        }
    }

    fn confirmed_by(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (OptimisticPatch::Insert(record), ChangeEvent::Inserted(echo)) => {
                !record.id.is_provisional() && echo.id == record.id
            }
            (OptimisticPatch::Insert(record), ChangeEvent::Updated(id, _)) => {
                !record.id.is_provisional() && *id == record.id
            }
            (OptimisticPatch::Like { id, .. }, ChangeEvent::Updated(echo_id, _)) => echo_id == id,
            // 记录已被删除，点赞补丁也就没有意义了
            (OptimisticPatch::Like { id, .. }, ChangeEvent::Deleted(echo_id)) => echo_id == id,
            (OptimisticPatch::Remove { id }, ChangeEvent::Deleted(echo_id)) => echo_id == id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPatch {
    patch_id: PatchId,
    patch: OptimisticPatch,
}

/// 乐观补丁集合
#[derive(Debug)]
pub struct OptimisticLayer {
    next_patch_id: PatchId,
    next_provisional_id: i64,
    pending: Vec<PendingPatch>,
}

impl Default for OptimisticLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLayer {
    pub fn new() -> Self {
        Self {
            next_patch_id: 1,
            next_provisional_id: -1,
            pending: Vec::new(),
        }
    }

    /// 分配一个本地临时 ID（负数，不会与服务端 ID 冲突）
    pub fn provisional_id(&mut self) -> RecordId {
        let id = RecordId(self.next_provisional_id);
        self.next_provisional_id -= 1;
        id
    }

    pub fn push(&mut self, patch: OptimisticPatch) -> PatchId {
        let patch_id = self.next_patch_id;
        self.next_patch_id += 1;
        self.pending.push(PendingPatch { patch_id, patch });
        patch_id
    }

    /// 插入成功后用服务端记录替换临时记录，继续等待该 ID 的回显
    pub fn resolve_insert(&mut self, patch_id: PatchId, record: Record) -> bool {
        match self.pending.iter_mut().find(|p| p.patch_id == patch_id) {
            Some(pending) => {
                pending.patch = OptimisticPatch::Insert(record);
                true
            }
            None => false,
        }
    }

    /// 回滚（移除）一个补丁
    pub fn rollback(&mut self, patch_id: PatchId) -> Option<OptimisticPatch> {
        let index = self.pending.iter().position(|p| p.patch_id == patch_id)?;
        Some(self.pending.remove(index).patch)
    }

    /// 用回显事件确认补丁，返回被确认的补丁 ID
    pub fn confirm(&mut self, event: &ChangeEvent) -> Vec<PatchId> {
        let mut confirmed = Vec::new();
        self.pending.retain(|p| {
            if p.patch.confirmed_by(event) {
                confirmed.push(p.patch_id);
                false
            } else {
                true
            }
        });
        confirmed
    }

    /// 插入写入尚未返回时回显已到达：按内容与作者认领最早的临时记录
    ///
    /// 被认领的补丁直接移除，避免临时记录与已确认记录同时可见。
    pub fn absorb_echo(&mut self, echo: &Record) -> Option<PatchId> {
        let index = self.pending.iter().position(|p| match &p.patch {
            OptimisticPatch::Insert(record) => {
                record.id.is_provisional()
                    && record.content == echo.content
                    && record.author_id == echo.author_id
            }
            _ => false,
        })?;
        Some(self.pending.remove(index).patch_id)
    }

    /// 已确认列表已经包含补丁效果时，补丁可以直接移除（全量重拉后调用）
    pub fn settle_against(&mut self, base: &LiveList) -> Vec<PatchId> {
        let mut settled = Vec::new();
        self.pending.retain(|p| {
            let done = match &p.patch {
                OptimisticPatch::Insert(record) => {
                    !record.id.is_provisional() && base.contains(record.id)
                }
                OptimisticPatch::Like { id, like_count } => base
                    .get(*id)
                    .map(|r| r.like_count >= *like_count)
                    .unwrap_or(true),
                OptimisticPatch::Remove { id } => !base.contains(*id),
            };
            if done {
                settled.push(p.patch_id);
            }
            !done
        });
        settled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// 在已确认列表之上叠加全部补丁，得到展示用列表
    pub fn view(&self, base: &LiveList) -> LiveList {
        if self.pending.is_empty() {
            return base.clone();
        }
        let mut visible = base.clone();
        for pending in &self.pending {
            match &pending.patch {
                OptimisticPatch::Insert(record) => {
                    visible.insert(record.clone());
                }
                OptimisticPatch::Like { id, like_count } => {
                    if let Some(current) = visible.get(*id) {
                        let patched = current.patched(&RecordPatch::like_count(*like_count));
                        visible.update(*id, patched);
                    }
                }
                OptimisticPatch::Remove { id } => {
                    visible.remove(*id);
                }
            }
        }
        visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn rec(id: i64, secs: u32) -> Record {
        Record::new(id, format!("m{}", id), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, secs).unwrap())
    }

    #[test]
    fn provisional_ids_are_negative_and_unique() {
        let mut layer = OptimisticLayer::new();
        let a = layer.provisional_id();
        let b = layer.provisional_id();
        assert!(a.is_provisional() && b.is_provisional());
        assert_ne!(a, b);
    }

    #[test]
    fn view_overlays_patches() {
        let base = LiveList::from_records(vec![rec(1, 1), rec(2, 2)]);
        let mut layer = OptimisticLayer::new();
        let provisional = layer.provisional_id();
        layer.push(OptimisticPatch::Insert(rec(provisional.as_i64(), 9)));
        layer.push(OptimisticPatch::Like { id: RecordId(1), like_count: 1 });
        layer.push(OptimisticPatch::Remove { id: RecordId(2) });

        let visible = layer.view(&base);
        assert_eq!(visible.ids(), vec![provisional, RecordId(1)]);
        assert_eq!(visible.get(RecordId(1)).unwrap().like_count, 1);
        // 已确认列表不受影响
        assert_eq!(base.ids(), vec![RecordId(2), RecordId(1)]);
    }

    #[test]
    fn insert_is_confirmed_only_after_resolve() {
        let mut layer = OptimisticLayer::new();
        let provisional = layer.provisional_id();
        let patch_id = layer.push(OptimisticPatch::Insert(rec(provisional.as_i64(), 5)));

        assert!(layer.confirm(&ChangeEvent::Inserted(rec(7, 5))).is_empty());
        assert!(layer.resolve_insert(patch_id, rec(7, 5)));
        assert_eq!(layer.confirm(&ChangeEvent::Inserted(rec(7, 5))), vec![patch_id]);
        assert!(layer.is_empty());
    }

    #[test]
    fn early_echo_absorbs_matching_provisional_insert() {
        let mut layer = OptimisticLayer::new();
        let first = layer.provisional_id();
        let mut mine = rec(first.as_i64(), 5);
        mine.author_id = Some("alice".to_string());
        let patch_id = layer.push(OptimisticPatch::Insert(mine.clone()));
        let second = layer.provisional_id();
        let twin = layer.push(OptimisticPatch::Insert(Record {
            id: second,
            ..mine.clone()
        }));

        // 作者不同不认领
        let mut stranger = Record { id: RecordId(7), ..mine.clone() };
        stranger.author_id = None;
        assert_eq!(layer.absorb_echo(&stranger), None);

        let echo = Record { id: RecordId(8), ..mine };
        assert_eq!(layer.absorb_echo(&echo), Some(patch_id));
        assert_eq!(layer.absorb_echo(&echo), Some(twin));
        assert_eq!(layer.absorb_echo(&echo), None);
        assert!(layer.is_empty());
    }

    #[test]
    fn like_and_remove_confirmed_by_matching_events() {
        let mut layer = OptimisticLayer::new();
        let like = layer.push(OptimisticPatch::Like { id: RecordId(1), like_count: 3 });
        let remove = layer.push(OptimisticPatch::Remove { id: RecordId(2) });

        assert!(layer.confirm(&ChangeEvent::Deleted(RecordId(9))).is_empty());
        assert_eq!(layer.confirm(&ChangeEvent::Updated(RecordId(1), rec(1, 1).with_likes(3))), vec![like]);
        assert_eq!(layer.confirm(&ChangeEvent::Deleted(RecordId(2))), vec![remove]);
    }

    #[test]
    fn rollback_removes_patch() {
        let base = LiveList::from_records(vec![rec(1, 1)]);
        let mut layer = OptimisticLayer::new();
        let patch_id = layer.push(OptimisticPatch::Remove { id: RecordId(1) });
        assert!(layer.view(&base).is_empty());
        assert_eq!(layer.rollback(patch_id), Some(OptimisticPatch::Remove { id: RecordId(1) }));
        assert_eq!(layer.rollback(patch_id), None);
        assert_eq!(layer.view(&base).ids(), vec![RecordId(1)]);
    }

    #[test]
    fn settle_against_refetched_list() {
        let mut layer = OptimisticLayer::new();
        let like = layer.push(OptimisticPatch::Like { id: RecordId(1), like_count: 2 });
        let remove = layer.push(OptimisticPatch::Remove { id: RecordId(2) });

        let stale = LiveList::from_records(vec![rec(1, 1).with_likes(1), rec(2, 2)]);
        assert!(layer.settle_against(&stale).is_empty());

        let fresh = LiveList::from_records(vec![rec(1, 1).with_likes(2)]);
        assert_eq!(layer.settle_against(&fresh), vec![like, remove]);
    }
}
