//! 本地列表调和
//!
//! [`LiveList`] 只暴露保持不变量的操作：
//! - ID 唯一
//! - 按 `created_at` 降序（时间相同的记录保持插入顺序）
//!
//! 两种调和策略见 [`ReconcilePolicy`]。增量策略在这里直接应用事件；
//! 全量重拉策略由同步器负责调用远端 fetch 后 [`LiveList::replace_all`]。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::event::ChangeEvent;
use crate::record::{Record, RecordId};

/// 调和策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReconcilePolicy {
    /// 按事件载荷增量修改本地列表（要求推送载荷与拉取结果结构一致）
    Incremental,
    /// 收到任何事件都丢弃载荷，重新拉取整个列表
    #[default]
    FullRefetch,
}

/// 单个事件的应用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Removed,
    /// 重复投递或目标不存在，列表未变化
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, ApplyOutcome::Ignored)
    }
}

/// 按创建时间降序排列的本地留言列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveList {
    records: Vec<Record>,
}

impl LiveList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由一批记录构建（排序 + 去重）
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut list = Self::new();
        list.replace_all(records);
        list
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    fn position(&self, id: RecordId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// 整体替换（拉取结果）。稳定排序，重复 ID 只保留第一次出现的记录
    pub fn replace_all(&mut self, records: Vec<Record>) {
        let mut seen = HashSet::with_capacity(records.len());
        let mut records: Vec<Record> = records.into_iter().filter(|r| seen.insert(r.id)).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.records = records;
    }

    /// 应用一个变更事件
    pub fn apply(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match event {
            ChangeEvent::Inserted(record) => self.insert(record.clone()),
            ChangeEvent::Updated(id, record) => self.update(*id, record.clone()),
            ChangeEvent::Deleted(id) => self.remove(*id),
        }
    }

    /// 插入新记录；ID 已存在时忽略（重复投递幂等）
    pub fn insert(&mut self, record: Record) -> ApplyOutcome {
        if self.contains(record.id) {
            return ApplyOutcome::Ignored;
        }
        self.insert_sorted(record);
        ApplyOutcome::Inserted
    }

    /// 替换记录；不存在时按插入处理
    pub fn update(&mut self, id: RecordId, record: Record) -> ApplyOutcome {
        let Some(mut index) = self.position(id) else {
            return self.insert(record);
        };
        if self.records[index] == record {
            return ApplyOutcome::Ignored;
        }
        // 新记录的 ID 若已占用其他位置，先移除，保证 ID 唯一
        if record.id != id {
            if let Some(other) = self.position(record.id) {
                self.records.remove(other);
                if other < index {
                    index -= 1;
                }
            }
        }
        if self.records[index].created_at == record.created_at {
            // 排序键未变，原位替换以保持相同时间记录间的顺序
            self.records[index] = record;
        } else {
            self.records.remove(index);
            self.insert_sorted(record);
        }
        ApplyOutcome::Updated
    }

    /// 删除记录；不存在时为 no-op
    pub fn remove(&mut self, id: RecordId) -> ApplyOutcome {
        match self.position(id) {
            Some(index) => {
                self.records.remove(index);
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::Ignored,
        }
    }

    fn insert_sorted(&mut self, record: Record) {
        // 新记录排在所有时间不晚于它的记录之后
        let index = self
            .records
            .partition_point(|r| r.created_at >= record.created_at);
        self.records.insert(index, record);
    }
}

impl From<LiveList> for Vec<Record> {
    fn from(list: LiveList) -> Self {
        list.records
    }
}

/// 纯函数形式：`apply(currentCollection, event) -> newCollection`
pub fn reconcile(current: &LiveList, event: &ChangeEvent) -> LiveList {
    let mut next = current.clone();
    next.apply(event);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn rec(id: i64, secs: i64) -> Record {
        Record::new(id, format!("msg-{}", id), t(secs))
    }

    fn assert_sorted(list: &LiveList) {
        for pair in list.records().windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn newer_insert_goes_first() {
        let list = LiveList::from_records(vec![Record::new(1, "hi", t(1))]);
        let next = reconcile(&list, &ChangeEvent::Inserted(Record::new(2, "yo", t(2))));
        assert_eq!(next.ids(), vec![RecordId(2), RecordId(1)]);
        // 纯函数不修改输入
        assert_eq!(list.ids(), vec![RecordId(1)]);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut list = LiveList::from_records(vec![rec(1, 1)]);
        let changed = Record::new(1, "different", t(9));
        assert_eq!(list.apply(&ChangeEvent::Inserted(changed)), ApplyOutcome::Ignored);
        assert_eq!(list.records(), &[rec(1, 1)]);
    }

    #[test]
    fn inserts_in_any_order_end_sorted() {
        let mut list = LiveList::new();
        for (id, secs) in [(1, 5), (2, 1), (3, 9), (4, 3), (5, 7), (6, 0)] {
            list.apply(&ChangeEvent::Inserted(rec(id, secs)));
        }
        assert_sorted(&list);
        assert_eq!(
            list.ids(),
            vec![RecordId(3), RecordId(5), RecordId(1), RecordId(4), RecordId(2), RecordId(6)]
        );
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut list = LiveList::new();
        list.insert(rec(1, 5));
        list.insert(rec(2, 5));
        list.insert(rec(3, 5));
        assert_eq!(list.ids(), vec![RecordId(1), RecordId(2), RecordId(3)]);
    }

    #[test]
    fn update_replaces_in_place() {
        let mut list = LiveList::from_records(vec![rec(1, 1)]);
        let liked = rec(1, 1).with_likes(1);
        assert_eq!(list.apply(&ChangeEvent::Updated(RecordId(1), liked)), ApplyOutcome::Updated);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(RecordId(1)).unwrap().like_count, 1);
    }

    #[test]
    fn update_with_same_timestamp_keeps_slot() {
        let mut list = LiveList::new();
        list.insert(rec(1, 5));
        list.insert(rec(2, 5));
        list.insert(rec(3, 5));
        list.update(RecordId(1), rec(1, 5).with_likes(4));
        assert_eq!(list.ids(), vec![RecordId(1), RecordId(2), RecordId(3)]);
    }

    #[test]
    fn update_recomputes_position() {
        let mut list = LiveList::from_records(vec![rec(1, 1), rec(2, 2), rec(3, 3)]);
        list.update(RecordId(1), rec(1, 10));
        assert_eq!(list.ids(), vec![RecordId(1), RecordId(3), RecordId(2)]);
        assert_sorted(&list);
    }

    #[test]
    fn update_of_missing_record_inserts() {
        let mut list = LiveList::from_records(vec![rec(1, 1)]);
        let outcome = list.apply(&ChangeEvent::Updated(RecordId(2), rec(2, 2)));
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert_eq!(list.ids(), vec![RecordId(2), RecordId(1)]);
    }

    #[test]
    fn update_carrying_another_id_keeps_ids_unique() {
        let mut list = LiveList::from_records(vec![rec(1, 1), rec(2, 2)]);
        let outcome = list.update(RecordId(1), Record::new(2, "b2", t(3)));
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(list.ids(), vec![RecordId(2)]);
        assert_eq!(list.get(RecordId(2)).unwrap().content, "b2");

        let mut list = LiveList::from_records(vec![rec(1, 1), rec(2, 2), rec(3, 3)]);
        list.update(RecordId(3), Record::new(1, "moved", t(3)));
        assert_eq!(list.ids(), vec![RecordId(1), RecordId(2)]);
        assert_sorted(&list);
    }

    #[test]
    fn identical_update_is_ignored() {
        let mut list = LiveList::from_records(vec![rec(1, 1)]);
        assert_eq!(list.update(RecordId(1), rec(1, 1)), ApplyOutcome::Ignored);
    }

    #[test]
    fn delete_is_idempotent() {
        let list = LiveList::from_records(vec![rec(1, 1), rec(2, 2)]);
        let once = reconcile(&list, &ChangeEvent::Deleted(RecordId(2)));
        let twice = reconcile(&once, &ChangeEvent::Deleted(RecordId(2)));
        assert_eq!(once, twice);
        assert_eq!(once.ids(), vec![RecordId(1)]);
    }

    #[test]
    fn delete_of_absent_is_noop() {
        let mut list = LiveList::from_records(vec![rec(1, 1)]);
        assert_eq!(list.apply(&ChangeEvent::Deleted(RecordId(2))), ApplyOutcome::Ignored);
        assert_eq!(list.ids(), vec![RecordId(1)]);
    }

    #[test]
    fn replace_all_sorts_and_dedupes() {
        let list = LiveList::from_records(vec![rec(1, 1), rec(2, 3), Record::new(1, "dup", t(7)), rec(3, 2)]);
        assert_eq!(list.ids(), vec![RecordId(2), RecordId(3), RecordId(1)]);
        assert_eq!(list.get(RecordId(1)).unwrap().content, "msg-1");
    }
}
