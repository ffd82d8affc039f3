// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Node (component B): an ordered list of kvsets plus the per-node
//! concurrency tokens and accounting described in §3/§5.

use crate::{hll::Hll, kvset::stats::KvsetStats, kvset::Kvset, UserKey};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
};

/// A node's 64-bit identity. `0` is reserved for the root.
pub type NodeId = u64;

const COMPACTING_FREE: u8 = 0;
const COMPACTING_HELD: u8 = 1;

/// Space-amplification accounting (§4.D).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Samp {
    /// Root allocated length.
    pub r_alen: i64,
    /// Root written length.
    pub r_wlen: i64,
    /// Internal-node allocated length.
    pub i_alen: i64,
    /// Leaf allocated length.
    pub l_alen: i64,
    /// Leaf "good" (compacted) length.
    pub l_good: i64,
}

impl Samp {
    /// Component-wise delta `post - self` (`self` treated as `orig`).
    #[must_use]
    pub fn delta_from(&self, orig: &Self) -> Self {
        Self {
            r_alen: self.r_alen - orig.r_alen,
            r_wlen: self.r_wlen - orig.r_wlen,
            i_alen: self.i_alen - orig.i_alen,
            l_alen: self.l_alen - orig.l_alen,
            l_good: self.l_good - orig.l_good,
        }
    }

    /// Adds `delta` in place, used to fold a node's delta into the tree
    /// aggregate.
    pub fn add_delta(&mut self, delta: &Self) {
        self.r_alen += delta.r_alen;
        self.r_wlen += delta.r_wlen;
        self.i_alen += delta.i_alen;
        self.l_alen += delta.l_alen;
        self.l_good += delta.l_good;
    }
}

/// A point-in-time copy of a node's stats/samp, safe to hand to the
/// scheduler collaborator without holding the tree lock (§2 addendum).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    /// Aggregated kvset stats.
    pub ns: KvsetStats,
    /// Space-amp accounting.
    pub samp: Samp,
    /// Change-generation at the time of the snapshot.
    pub cgen: u64,
}

/// An in-flight root-spill job tracked on the root's `rspills` FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootSpill {
    /// Job identity, matches the compaction work's id.
    pub job_id: u64,
    /// Set once Build has completed for this spill.
    pub done: bool,
    /// Set once a thread has claimed this (head-of-queue) spill for
    /// Commit -> Apply -> Release.
    pub commit_in_progress: bool,
}

#[derive(Debug, Default)]
struct BusyState {
    jobs: u32,
    kvsets_in_flight: u32,
    rspills: VecDeque<RootSpill>,
    wedged: bool,
}

/// A tree node: an ordered list of kvsets plus concurrency bookkeeping.
///
/// Fields documented as "guarded by the tree lock" are mutated only by a
/// caller already holding `Tree`'s write lock (or reading with its read
/// lock); `Node` itself enforces nothing about them. `compacting` and the
/// busy/rspill state are independent of that lock by design (§5).
#[derive(Debug)]
pub struct Node {
    /// 64-bit node identity. `0` is the root.
    pub nodeid: NodeId,

    /// `true` only for the root.
    pub isroot: bool,

    /// Back-pointer into the route map's edge-key (`None` for the root).
    /// Guarded by the tree lock.
    pub route_node: Option<UserKey>,

    /// Kvsets ordered strictly decreasing by dgen (head = newest).
    /// Guarded by the tree lock.
    pub kvsets: Vec<Arc<Kvset>>,

    /// Aggregated kvset stats. Guarded by the tree lock.
    pub ns: KvsetStats,

    /// Space-amp accounting. Guarded by the tree lock.
    pub samp: Samp,

    /// Union of per-kvset HLL sketches. Guarded by the tree lock.
    pub hlog: Option<Hll>,

    /// Bumped on every successful mutation. Guarded by the tree lock.
    pub cgen: u64,

    /// High-watermark dgen for incremental sampling updates
    /// (`update_ingest`). Guarded by the tree lock.
    pub update_incr_dgen: u64,

    compacting: AtomicU8,
    busy: Mutex<BusyState>,
}

impl Node {
    /// Creates a new, empty node.
    #[must_use]
    pub fn new(nodeid: NodeId, isroot: bool, route_node: Option<UserKey>) -> Self {
        Self {
            nodeid,
            isroot,
            route_node,
            kvsets: Vec::new(),
            ns: KvsetStats::default(),
            samp: Samp::default(),
            hlog: None,
            cgen: 0,
            update_incr_dgen: 0,
            compacting: AtomicU8::new(COMPACTING_FREE),
            busy: Mutex::new(BusyState::default()),
        }
    }

    /// Inserts `kvset` so the list remains strictly decreasing by dgen.
    ///
    /// Only valid during construction (tree/kvset loading) or while the
    /// caller holds the tree write lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corruption`] if a kvset with the same
    /// dgen is already present (undefined by contract; refused here).
    pub fn insert_kvset(&mut self, kvset: Arc<Kvset>) -> crate::Result<()> {
        let pos = self
            .kvsets
            .iter()
            .position(|existing| existing.dgen <= kvset.dgen)
            .unwrap_or(self.kvsets.len());

        if let Some(existing) = self.kvsets.get(pos) {
            if existing.dgen == kvset.dgen {
                debug_assert!(false, "duplicate dgen {} on node {}", kvset.dgen, self.nodeid);
                log::error!("refusing duplicate dgen {} on node {}", kvset.dgen, self.nodeid);
                return Err(crate::Error::Corruption);
            }
        }

        log::debug!(
            "node {} insert kvset {} dgen={}",
            self.nodeid,
            kvset.kvset_id,
            kvset.dgen
        );
        self.kvsets.insert(pos, kvset);
        self.cgen += 1;

        Ok(())
    }

    /// Lexicographically smallest key across all of this node's kvsets.
    /// Caller must hold at least the tree read lock.
    #[must_use]
    pub fn get_min_key(&self) -> Option<UserKey> {
        self.kvsets.iter().map(|k| k.min_key().clone()).min()
    }

    /// Lexicographically largest key across all of this node's kvsets.
    /// Caller must hold at least the tree read lock.
    #[must_use]
    pub fn get_max_key(&self) -> Option<UserKey> {
        self.kvsets.iter().map(|k| k.max_key().clone()).max()
    }

    /// Sum of `vgroups` across all kvsets except the oldest kvsets whose
    /// cumulative vgroup count is `<= 1` — a proxy for virtual-memory
    /// fragmentation of value placement.
    #[must_use]
    pub fn scatter(&self) -> u64 {
        let mut cumulative_from_tail = 0u32;
        let mut scatter = 0u64;

        for kvset in self.kvsets.iter().rev() {
            cumulative_from_tail += kvset.stats.vgroups;
            if cumulative_from_tail <= 1 {
                continue;
            }
            scatter += u64::from(kvset.stats.vgroups);
        }

        scatter
    }

    /// A point-in-time copy of this node's stats/samp/cgen.
    #[must_use]
    pub fn stats_snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            ns: self.ns,
            samp: self.samp,
            cgen: self.cgen,
        }
    }

    /// Attempts to acquire the exclusive compaction token (K/KV/SPLIT/
    /// idle-compact). Spills never call this.
    #[must_use]
    pub fn compact_token_try_acquire(&self) -> bool {
        self.compacting
            .compare_exchange(
                COMPACTING_FREE,
                COMPACTING_HELD,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Releases the exclusive compaction token.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the token was not held.
    pub fn compact_token_release(&self) {
        let prev = self.compacting.swap(COMPACTING_FREE, Ordering::AcqRel);
        debug_assert_eq!(prev, COMPACTING_HELD, "released an unheld compaction token");
    }

    /// `true` if the exclusive compaction token is currently held.
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire) == COMPACTING_HELD
    }

    /// Increments `busycnt` when a job is enlisted on this node.
    pub fn busycnt_inc(&self, kvsets_in_flight: u32) {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        busy.jobs += 1;
        busy.kvsets_in_flight += kvsets_in_flight;
    }

    /// Decrements `busycnt` at commit/cleanup.
    pub fn busycnt_dec(&self, kvsets_in_flight: u32) {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        busy.jobs = busy.jobs.saturating_sub(1);
        busy.kvsets_in_flight = busy.kvsets_in_flight.saturating_sub(kvsets_in_flight);
    }

    /// `true` if this node has at least one in-flight job.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let busy = self.busy.lock().expect("lock is poisoned");
        busy.jobs != 0
    }

    /// Current `(jobs, kvsets_in_flight)` snapshot.
    #[must_use]
    pub fn busycnt(&self) -> (u32, u32) {
        let busy = self.busy.lock().expect("lock is poisoned");
        (busy.jobs, busy.kvsets_in_flight)
    }

    /// Enqueues a root-spill job onto `rspills`. Root-only.
    pub fn rspill_enqueue(&self, job_id: u64) {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        busy.rspills.push_back(RootSpill {
            job_id,
            done: false,
            commit_in_progress: false,
        });
    }

    /// Marks `job_id` as having completed Build.
    pub fn rspill_mark_done(&self, job_id: u64) {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        if let Some(entry) = busy.rspills.iter_mut().find(|e| e.job_id == job_id) {
            entry.done = true;
        }
    }

    /// If the head of `rspills` is done and not already claimed, claims
    /// it for Commit -> Apply -> Release and returns its job id.
    #[must_use]
    pub fn rspill_try_claim_head(&self) -> Option<u64> {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        let head = busy.rspills.front_mut()?;

        if head.done && !head.commit_in_progress {
            head.commit_in_progress = true;
            Some(head.job_id)
        } else {
            None
        }
    }

    /// Removes `job_id` from `rspills`. Must be the current head.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corruption`] if `job_id` is not the head
    /// of the queue — a head-of-queue dequeue is the only legal state.
    pub fn rspill_remove_head(&self, job_id: u64) -> crate::Result<()> {
        let mut busy = self.busy.lock().expect("lock is poisoned");

        match busy.rspills.front() {
            Some(head) if head.job_id == job_id => {
                busy.rspills.pop_front();
                Ok(())
            }
            _ => {
                debug_assert!(false, "rspill release of non-head job {job_id}");
                log::error!("rspill release of non-head job {job_id} on node {}", self.nodeid);
                Err(crate::Error::Corruption)
            }
        }
    }

    /// Sets the root's `wedged` flag after a failed spill Apply.
    pub fn rspill_set_wedged(&self) {
        let mut busy = self.busy.lock().expect("lock is poisoned");
        busy.wedged = true;
    }

    /// `true` if an earlier spill failure has wedged this root.
    #[must_use]
    pub fn is_wedged(&self) -> bool {
        let busy = self.busy.lock().expect("lock is poisoned");
        busy.wedged
    }

    /// `true` while a split may not be selected for this node (§3
    /// addendum): a spill is still in flight on it.
    #[must_use]
    pub fn has_spill_fence(&self) -> bool {
        let busy = self.busy.lock().expect("lock is poisoned");
        !busy.rspills.is_empty()
    }
}
