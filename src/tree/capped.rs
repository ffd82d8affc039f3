// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Capped-kvs trimming (component H, §4.H): retires root kvsets whose
//! entire contents are shadowed by the tree's most recent prefix
//! tombstone, and separately advises the media pool to page out
//! vblocks that have aged past a TTL.

use super::Tree;
use crate::{collab::media_pool::Advice, sampling, value::SeqNo};
use std::sync::Arc;

/// Dwell time before an unreferenced vblock becomes eligible for
/// `madvise(DontNeed)` during the eviction half of capped trimming.
pub const CAPPED_EVICT_TTL_SECS: u64 = 300;

/// `true` if `max_key`'s `ptomb_len`-byte prefix falls strictly below
/// `ptomb_bytes`: the kvset's entire contents sit below the tombstone's
/// prefix, so in a capped (monotonically-keyed, queue-like) tree it is
/// stale data already superseded by the watermark the tombstone records
/// — not data the tombstone itself deletes (§4.H, scenario 6).
fn max_key_precedes_ptomb(max_key: &[u8], ptomb_bytes: &[u8], ptomb_len: u8) -> bool {
    let len = usize::from(ptomb_len).min(max_key.len());
    max_key.get(..len).unwrap_or(max_key) < ptomb_bytes
}

impl Tree {
    /// Runs one round of capped-kvs TTL trimming (§4.H). A no-op on
    /// non-capped trees. `global_seqno_horizon` is the oldest snapshot
    /// still live; `now_secs` is the current wall-clock time — both are
    /// supplied by the caller since the tree has no clock/snapshot
    /// registry of its own (§1 Non-goals).
    ///
    /// Returns `true` if any root kvsets were retired this round.
    ///
    /// # Errors
    ///
    /// Propagates a journal or media-pool failure from the retire step.
    pub fn capped_compact(&self, global_seqno_horizon: SeqNo, now_secs: u64) -> crate::Result<bool> {
        if !self.create_params.capped {
            return Ok(false);
        }

        let retire_ids = {
            let state = self.state.read().expect("lock is poisoned");

            let Some(ptomb) = state.last_ptomb.as_ref() else {
                drop(state);
                self.capped_evict(now_secs)?;
                return Ok(false);
            };

            let horizon = global_seqno_horizon.min(ptomb.seqno);
            let mut retire = Vec::new();

            // Walk tail (oldest) toward head (newest); stop at the first
            // kvset that isn't fully shadowed.
            for kvset in state.root().kvsets.iter().rev() {
                let eligible = ptomb.len == 0
                    || kvset.seqno_max() < horizon
                    || max_key_precedes_ptomb(kvset.max_key(), &ptomb.bytes, ptomb.len);

                if !eligible {
                    break;
                }
                retire.push(kvset.kvset_id);
            }

            retire
        };

        if retire_ids.is_empty() {
            return self.capped_evict(now_secs).map(|()| false);
        }

        let txn = self.journal.txstart(self.cnid, 0, global_seqno_horizon, 0, retire_ids.len() as u32)?;
        for id in &retire_ids {
            self.journal.record_kvset_delete(txn, *id)?;
        }

        let retired = {
            let mut state = self.state.write().expect("lock is poisoned");
            let pre = state.root().samp;

            let mut retired = Vec::new();
            state.root_mut().kvsets.retain(|k| {
                if retire_ids.contains(&k.kvset_id) {
                    retired.push(Arc::clone(k));
                    false
                } else {
                    true
                }
            });

            sampling::update_compact(state.root_mut(), self.create_params.hll_precision);
            let post = state.root().samp;
            state.samp.add_delta(&post.delta_from(&pre));

            retired
        };

        for kvset in &retired {
            self.media_pool.delete_mblocks(&[kvset.kvset_id])?;
            kvset.clear_enlisted();
        }

        log::debug!("capped_compact cnid={} retired={}", self.cnid, retired.len());

        Ok(true)
    }

    /// Advises the media pool to page out root vblocks older than
    /// [`CAPPED_EVICT_TTL_SECS`], resuming from `capped_evict_cursor` so
    /// repeated calls don't rescan already-advised kvsets.
    fn capped_evict(&self, now_secs: u64) -> crate::Result<()> {
        let (to_advise, new_cursor) = {
            let state = self.state.read().expect("lock is poisoned");
            let mut to_advise = Vec::new();
            let mut new_cursor = state.capped_evict_cursor;

            for kvset in state.root().kvsets.iter().rev() {
                if kvset.dgen <= state.capped_evict_cursor {
                    continue;
                }
                if now_secs.saturating_sub(kvset.created_at()) < CAPPED_EVICT_TTL_SECS {
                    break;
                }
                to_advise.push(kvset.kvset_id);
                new_cursor = new_cursor.max(kvset.dgen);
            }

            (to_advise, new_cursor)
        };

        for id in &to_advise {
            self.media_pool.madvise(*id, Advice::DontNeed)?;
        }

        if new_cursor != 0 {
            let mut state = self.state.write().expect("lock is poisoned");
            state.capped_evict_cursor = state.capped_evict_cursor.max(new_cursor);
        }

        log::debug!("capped_evict cnid={} advised={}", self.cnid, to_advise.len());

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        config::{CreateParams, RuntimeParams},
        kvset::builder::Builder,
        tree::ingest::PtombUpdate,
        value::KvsetItem,
    };
    use test_log::test;

    fn capped_tree() -> Tree {
        Tree::with_in_memory_collaborators(1, CreateParams::new().capped(true).prefix_len(4), RuntimeParams::new())
    }

    #[test]
    fn retires_root_kvsets_fully_covered_by_prefix_tombstone() {
        let tree = capped_tree();

        let old = Arc::new(
            Builder::new()
                .add(KvsetItem::new_value("aaaa1", "v", 1))
                .build(tree.next_kvset_id(), tree.next_dgen(), 0, tree.create_params.hll_precision),
        );
        tree.ingest_update(Arc::clone(&old), None).unwrap();

        let ptomb_item = KvsetItem::new_prefix_tombstone("aaaa", 5);
        let with_ptomb = Arc::new(
            Builder::new()
                .add(ptomb_item)
                .build(tree.next_kvset_id(), tree.next_dgen(), 0, tree.create_params.hll_precision),
        );
        tree.ingest_update(
            with_ptomb,
            Some(PtombUpdate {
                bytes: "aaaa".into(),
                len: 4,
                seqno: 5,
            }),
        )
        .unwrap();

        assert_eq!(2, tree.state.read().unwrap().root().kvsets.len());

        let retired = tree.capped_compact(10, 0).unwrap();
        assert!(retired);

        let remaining: Vec<_> = tree.state.read().unwrap().root().kvsets.iter().map(|k| k.kvset_id).collect();
        assert_eq!(vec![with_ptomb_kvset_id(&tree)], remaining);
    }

    fn with_ptomb_kvset_id(tree: &Tree) -> u64 {
        tree.state.read().unwrap().root().kvsets.first().expect("tombstone kvset survives").kvset_id
    }

    #[test]
    fn non_capped_tree_is_a_no_op() {
        let tree = Tree::with_in_memory_collaborators(1, CreateParams::new(), RuntimeParams::new());
        assert!(!tree.capped_compact(0, 0).unwrap());
    }
}
