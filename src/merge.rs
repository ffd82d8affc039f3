// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! K-way merge over kvset item streams, used by the compaction runtime's
//! Build step (§4.F) to fold `kvset_cnt` adjacent kvsets into one output
//! stream via a tournament heap over [`KvsetItem`] streams.

use crate::value::KvsetItem;
use interval_heap::IntervalHeap as Heap;

/// A boxed iterator over one kvset's items, ascending key / descending
/// seqno per key (`KvsetItem`'s `Ord` impl) — the order `Kvset::iter`
/// already produces.
pub type BoxedIterator<'a> = Box<dyn DoubleEndedIterator<Item = KvsetItem> + 'a>;

#[derive(Eq)]
struct HeapItem(usize, KvsetItem);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.1.cmp(&other.1)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple sorted kvset item streams into one sorted stream.
///
/// Streams are assumed individually sorted ascending by key then
/// descending by seqno. The merged output preserves that order but does
/// **not** dedup keys across input streams — call [`Merger::dedup`] (or
/// wrap with [`MergeDedup`]) to additionally keep only the newest
/// occurrence of each key, which is what `COMPACT_K`/`COMPACT_KV`/
/// `SPILL`/`SPLIT` builds want.
pub struct Merger<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: Heap<HeapItem>,
    initialized: bool,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = Heap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) {
        for idx in 0..self.iterators.len() {
            if let Some(item) = self.iterators[idx].next() {
                self.heap.push(HeapItem(idx, item));
            }
        }
        self.initialized = true;
    }

    /// Wraps this merger so that only the newest (first) occurrence of
    /// each key survives, with tombstones optionally dropped — the
    /// dedup pass every compaction build action performs (§4.F).
    #[must_use]
    pub fn dedup(self, drop_tombstones: bool) -> MergeDedup<'a> {
        MergeDedup {
            inner: self,
            last_key: None,
            drop_tombstones,
        }
    }
}

impl Iterator for Merger<'_> {
    type Item = KvsetItem;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            self.initialize();
        }

        let min_item = self.heap.pop_min()?;

        if let Some(next_item) = self.iterators[min_item.0].next() {
            self.heap.push(HeapItem(min_item.0, next_item));
        }

        Some(min_item.1)
    }
}

/// A [`Merger`] that keeps only the newest occurrence of each key and,
/// optionally, drops tombstones entirely (`drop_tombstones = true`,
/// set when the compacted mark reaches the tail of the node's kvset
/// list — there's nothing older left for the tombstone to shadow).
pub struct MergeDedup<'a> {
    inner: Merger<'a>,
    last_key: Option<crate::UserKey>,
    drop_tombstones: bool,
}

impl Iterator for MergeDedup<'_> {
    type Item = KvsetItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.inner.next()?;

            if self.last_key.as_ref() == Some(&item.key) {
                // Shadowed by a newer occurrence already emitted.
                continue;
            }
            self.last_key = Some(item.key.clone());

            if self.drop_tombstones && item.is_tombstone() {
                continue;
            }

            return Some(item);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::value::KvsetItem;
    use test_log::test;

    fn stream(items: Vec<KvsetItem>) -> BoxedIterator<'static> {
        Box::new(items.into_iter())
    }

    #[test]
    fn merges_in_key_order() {
        let a = stream(vec![
            KvsetItem::new_value("a", "1", 1),
            KvsetItem::new_value("c", "3", 1),
        ]);
        let b = stream(vec![KvsetItem::new_value("b", "2", 1)]);

        let merged: Vec<_> = Merger::new(vec![a, b]).map(|i| i.key.to_vec()).collect();
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], merged);
    }

    #[test]
    fn dedup_keeps_newest_and_drops_shadowed() {
        let newer = stream(vec![KvsetItem::new_value("k", "v2", 2)]);
        let older = stream(vec![KvsetItem::new_value("k", "v1", 1)]);

        let merged: Vec<_> = Merger::new(vec![newer, older]).dedup(false).collect();
        assert_eq!(1, merged.len());
        assert_eq!(b"v2".as_slice(), merged[0].value.as_ref().unwrap().as_ref());
    }

    #[test]
    fn dedup_drops_tombstones_when_requested() {
        let a = stream(vec![KvsetItem::new_tombstone("k", 2)]);
        let b = stream(vec![KvsetItem::new_value("k", "v1", 1)]);

        let merged: Vec<_> = Merger::new(vec![a, b]).dedup(true).collect();
        assert!(merged.is_empty());

        let a = stream(vec![KvsetItem::new_tombstone("k", 2)]);
        let b = stream(vec![KvsetItem::new_value("k", "v1", 1)]);
        let merged: Vec<_> = Merger::new(vec![a, b]).dedup(false).collect();
        assert_eq!(1, merged.len());
        assert!(merged[0].is_tombstone());
    }
}
