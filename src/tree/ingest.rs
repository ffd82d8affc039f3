// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ingest (component G, §4.G): atomically attaches a newly-built kvset
//! to the root and folds its stats into the running samp aggregate.

use super::{inner::PrefixTombstone, Tree};
use crate::{collab::scheduler::IngestDelta, kvset::Kvset, sampling, value::SeqNo};
use std::sync::Arc;

/// Prefix-tombstone metadata accompanying an ingest, for capped trees
/// only (§3/§4.G). Plain data, not a [`crate::value::KvsetItem`] — the
/// tombstone's *entry* is already part of `kvset`'s items; this is just
/// the bookkeeping `capped_compact` needs later.
#[derive(Clone, Debug)]
pub struct PtombUpdate {
    /// The tombstone's key.
    pub bytes: crate::UserKey,
    /// Its declared prefix length.
    pub len: u8,
    /// The sequence number it was written at.
    pub seqno: SeqNo,
}

impl Tree {
    /// Attaches `kvset` to the root's kvset list and updates sampling
    /// incrementally (§4.G): insert under the write lock, run
    /// `update_ingest`, fold the delta into the tree aggregate, then
    /// notify the scheduler outside the lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corruption`] if `kvset`'s dgen collides
    /// with an existing root kvset (node invariant 1, §3).
    pub fn ingest_update(&self, kvset: Arc<Kvset>, ptomb: Option<PtombUpdate>) -> crate::Result<()> {
        let delta = {
            let mut state = self.state.write().expect("lock is poisoned");
            let pre = state.root().samp;

            state.root_mut().insert_kvset(kvset)?;

            if self.create_params.capped {
                if let Some(p) = ptomb {
                    state.last_ptomb = Some(PrefixTombstone {
                        bytes: p.bytes,
                        len: p.len,
                        seqno: p.seqno,
                    });
                }
            }

            let _ = sampling::update_ingest(state.root_mut());

            let post = state.root().samp;
            let delta = post.delta_from(&pre);
            state.samp.add_delta(&delta);

            debug_assert!(delta.r_wlen >= 0, "ingest should only grow root written length");

            delta
        };

        log::debug!("ingest_update cnid={} delta={:?}", self.cnid, delta);

        self.scheduler.notify_ingest(IngestDelta {
            r_alen: delta.r_alen,
            r_wlen: delta.r_wlen,
        });

        Ok(())
    }
}
