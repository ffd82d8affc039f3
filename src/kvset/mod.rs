// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A minimal in-memory kvset: the concrete stand-in the rest of the crate
//! is built and tested against. Real key-block/value-block/head-block
//! layout, bloom filters, and b-tree readers are explicitly out of scope
//! (§1) — `Kvset` only exposes the opaque operations the tree assumes.

pub mod builder;
pub mod stats;

use crate::{
    hll::Hll,
    lookup::LookupResult,
    value::{KvsetItem, SeqNo, ValueType},
    UserKey,
};
use stats::KvsetStats;
use std::sync::atomic::{AtomicU64, Ordering};

pub use builder::Builder;

/// Sentinel meaning "not enlisted in any in-flight job".
const NO_WORKID: u64 = 0;

/// An immutable, ref-counted (via [`std::sync::Arc`]) sorted run.
#[derive(Debug)]
pub struct Kvset {
    /// Stable 64-bit identity, assigned at commit time.
    pub kvset_id: u64,

    /// Data-generation stamp; strictly decreasing head-to-tail within a
    /// node's kvset list.
    pub dgen: u64,

    /// Compaction counter, biases scheduler against re-compacting
    /// recently-produced runs.
    pub compc: u32,

    /// Size/shape accounting.
    pub stats: KvsetStats,

    /// Cardinality sketch over this kvset's keys.
    pub hlog: Option<Hll>,

    min_key: UserKey,
    max_key: UserKey,
    seqno_max: SeqNo,
    created_at: u64,

    /// Mutual-exclusion marker: the id of the in-flight compaction job
    /// this kvset is enlisted as an input to, or `NO_WORKID`.
    workid: AtomicU64,

    /// Sorted ascending by key, then descending by seqno (newest first
    /// per key) — see [`KvsetItem`]'s `Ord` impl.
    items: Vec<KvsetItem>,
}

impl Kvset {
    pub(crate) fn from_items(
        kvset_id: u64,
        dgen: u64,
        compc: u32,
        hll_precision: u8,
        created_at: u64,
        mut items: Vec<KvsetItem>,
    ) -> Self {
        items.sort();

        let mut hlog = Hll::new(hll_precision);
        let mut stats = KvsetStats::default();
        let mut seqno_max = 0;

        for item in &items {
            hlog.insert(&item.key);
            stats.total_keys += 1;
            stats.kalen += item.key.len() as u64;
            stats.kwlen += item.key.len() as u64;
            if let Some(value) = &item.value {
                stats.valen += value.len() as u64;
                stats.vwlen += value.len() as u64;
            }
            seqno_max = seqno_max.max(item.seqno);
        }

        // Stand-ins for real key-block/value-block counts (§1 Non-goals:
        // kvset-internal layout is out of scope). Scaled off item/byte
        // volume so `Node::scatter` and the compaction runtime's "does
        // this output look large" check (§4.F compc rules) have something
        // non-trivial to observe instead of a constant.
        stats.kblks = u32::try_from(items.len().div_ceil(4)).unwrap_or(u32::MAX).max(1);
        stats.vblks = u32::try_from((stats.valen as usize).div_ceil(4096)).unwrap_or(u32::MAX);
        stats.vgroups = stats.vblks.max(u32::from(stats.valen > 0));
        stats.halen = 64;

        let min_key = items.first().map_or_else(UserKey::empty, |i| i.key.clone());
        let max_key = items
            .iter()
            .map(|i| i.key.clone())
            .max()
            .unwrap_or_else(UserKey::empty);

        Self {
            kvset_id,
            dgen,
            compc,
            stats,
            hlog: Some(hlog),
            min_key,
            max_key,
            seqno_max,
            created_at,
            workid: AtomicU64::new(NO_WORKID),
            items,
        }
    }

    /// Wall-clock timestamp (seconds) this kvset was built, used by
    /// `capped_evict`'s TTL scan (§4.H). Not a tunable — supplied by the
    /// caller building the kvset rather than read from the system clock,
    /// so capped-kvs eviction stays deterministic and testable.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Lexicographically smallest key in this kvset.
    #[must_use]
    pub fn min_key(&self) -> &UserKey {
        &self.min_key
    }

    /// Lexicographically largest key in this kvset.
    #[must_use]
    pub fn max_key(&self) -> &UserKey {
        &self.max_key
    }

    /// Largest sequence number of any entry in this kvset.
    #[must_use]
    pub fn seqno_max(&self) -> SeqNo {
        self.seqno_max
    }

    /// `true` if this kvset is enlisted as the input of an in-flight job.
    #[must_use]
    pub fn workid(&self) -> Option<u64> {
        match self.workid.load(Ordering::Acquire) {
            NO_WORKID => None,
            id => Some(id),
        }
    }

    /// Marks this kvset as enlisted in job `id` (invariant 4, §3).
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the kvset is already enlisted in a
    /// different job.
    pub fn mark_enlisted(&self, id: u64) {
        let prev = self.workid.swap(id, Ordering::AcqRel);
        debug_assert!(
            prev == NO_WORKID || prev == id,
            "kvset {} re-enlisted while already enlisted in job {prev}",
            self.kvset_id
        );
    }

    /// Clears the enlistment marker (on commit success or cleanup).
    pub fn clear_enlisted(&self) {
        self.workid.store(NO_WORKID, Ordering::Release);
    }

    /// Point lookup. Scans this kvset's items for `key`, visible as of
    /// `view_seqno`, returning the highest-seqno match at or below it.
    pub fn lookup(&self, key: &[u8], view_seqno: SeqNo) -> crate::Result<LookupResult> {
        let hit = self
            .items
            .iter()
            .filter(|item| item.key.as_ref() == key && item.seqno <= view_seqno)
            .max_by_key(|item| item.seqno);

        Ok(match hit {
            None => LookupResult::NotFound,
            Some(item) => match item.vtype {
                ValueType::Value => {
                    LookupResult::FoundValue(item.value.clone().unwrap_or_else(UserKey::empty))
                }
                ValueType::Tombstone => LookupResult::FoundTombstone,
                ValueType::PrefixTombstone => LookupResult::FoundPrefixTombstone,
            },
        })
    }

    /// Prefix probe. Scans this kvset's items whose key starts with
    /// `prefix`, visible as of `view_seqno`, accumulating into `seen`.
    pub fn pfx_lookup(
        &self,
        prefix: &[u8],
        view_seqno: SeqNo,
        seen: &mut u32,
    ) -> crate::Result<LookupResult> {
        if let Some(ptomb) = self
            .items
            .iter()
            .find(|i| i.vtype == ValueType::PrefixTombstone && i.key.as_ref() == prefix && i.seqno <= view_seqno)
        {
            let _ = ptomb;
            return Ok(LookupResult::FoundPrefixTombstone);
        }

        let mut last = LookupResult::NotFound;

        for item in self
            .items
            .iter()
            .filter(|i| i.key.starts_with(prefix) && i.seqno <= view_seqno)
        {
            *seen += 1;
            last = match item.vtype {
                ValueType::Value => {
                    LookupResult::FoundValue(item.value.clone().unwrap_or_else(UserKey::empty))
                }
                ValueType::Tombstone => LookupResult::FoundTombstone,
                ValueType::PrefixTombstone => LookupResult::FoundPrefixTombstone,
            };

            if *seen > 1 {
                return Ok(LookupResult::FoundMultiple);
            }
        }

        Ok(last)
    }

    /// A forward iterator over this kvset's items, oldest-duplicate-last
    /// ordering preserved (ascending key, descending seqno per key) —
    /// the order the compaction build merger expects.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &KvsetItem> {
        self.items.iter()
    }

    /// All items partitioned into those falling at or below `split_key`
    /// (left) and strictly above it (right), used by `SPLIT` builds.
    #[must_use]
    pub fn partition_at(&self, split_key: &[u8]) -> (Vec<KvsetItem>, Vec<KvsetItem>) {
        self.items
            .iter()
            .cloned()
            .partition(|item| item.key.as_ref() <= split_key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn kvset(items: Vec<KvsetItem>) -> Kvset {
        Kvset::from_items(1, 1, 0, 11, 0, items)
    }

    #[test]
    fn lookup_finds_newest_visible_value() {
        let kv = kvset(vec![
            KvsetItem::new_value("k", "v1", 1),
            KvsetItem::new_value("k", "v2", 2),
        ]);

        assert_eq!(
            LookupResult::FoundValue("v2".into()),
            kv.lookup(b"k", 10).unwrap()
        );
        assert_eq!(
            LookupResult::FoundValue("v1".into()),
            kv.lookup(b"k", 1).unwrap()
        );
        assert_eq!(LookupResult::NotFound, kv.lookup(b"missing", 10).unwrap());
    }

    #[test]
    fn enlistment_is_exclusive_in_debug() {
        let kv = kvset(vec![KvsetItem::new_value("k", "v", 1)]);
        assert_eq!(None, kv.workid());
        kv.mark_enlisted(42);
        assert_eq!(Some(42), kv.workid());
        kv.clear_enlisted();
        assert_eq!(None, kv.workid());
    }
}
