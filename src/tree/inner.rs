// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! [`TreeInner`]/[`TreeState`]: the data a [`super::Tree`] wraps in an
//! `Arc` plus the single read-mostly lock guarding its structure (§5).

use crate::{
    collab::{health::KvdbHealth, journal::MetadataJournal, media_pool::MediaPool, scheduler::Scheduler},
    config::{CreateParams, RuntimeParams},
    node::{Node, NodeId, Samp},
    route_map::RouteMap,
    value::SeqNo,
    UserKey,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64},
    Arc, RwLock,
};

/// The tree's most-recently-seen prefix tombstone, tracked for capped-kvs
/// trimming (§4.H). Only meaningful when `create_params.capped`.
#[derive(Clone, Debug)]
pub struct PrefixTombstone {
    /// The tombstone's key (the prefix it deletes).
    pub bytes: UserKey,
    /// Declared prefix length; `0` means "whole-tree" semantics are not
    /// engaged yet (no eligible trim).
    pub len: u8,
    /// The sequence number the tombstone was written at.
    pub seqno: SeqNo,
}

/// Everything guarded by the tree's single `RwLock` (§5): the node list,
/// route map, and tree-aggregate samp. A plain `Vec`/`BTreeMap` pair
/// suffices here — the lock already serializes every structural
/// mutation, so there's nothing for a lock-free structure to buy (the
/// same reasoning [`RouteMap`] documents for itself).
pub struct TreeState {
    /// Ordered nodes; invariant: `nodes[0]` is always the root.
    pub nodes: Vec<Node>,

    /// Key-range ownership for every leaf.
    pub route_map: RouteMap,

    /// Tree-wide aggregate of every node's samp (§4.D).
    pub samp: Samp,

    /// The most recent prefix tombstone ingested, if any (capped trees
    /// only).
    pub last_ptomb: Option<PrefixTombstone>,

    /// Resume cursor for `capped_evict`'s madvise scan (§4.H), keyed by
    /// the highest dgen already advised.
    pub capped_evict_cursor: u64,
}

impl TreeState {
    /// The root node. Every tree has exactly one, for its entire life.
    #[must_use]
    pub fn root(&self) -> &Node {
        self.nodes.first().expect("tree always has a root")
    }

    /// Mutable access to the root node.
    #[must_use]
    pub fn root_mut(&mut self) -> &mut Node {
        self.nodes.first_mut().expect("tree always has a root")
    }

    /// Finds a node by id.
    #[must_use]
    pub fn find_node(&self, nodeid: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.nodeid == nodeid)
    }

    /// Finds a node by id, mutably.
    #[must_use]
    pub fn find_node_mut(&mut self, nodeid: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.nodeid == nodeid)
    }
}

/// The tree's shared, reference-counted state (§4.C). Wrapped by
/// [`super::Tree`] as `Tree(Arc<TreeInner>)` plus `Deref`, so clones are
/// cheap handles to the same tree.
pub struct TreeInner {
    /// The identity this tree is known to its collaborators by.
    pub cnid: u64,

    /// Immutable creation-time parameters.
    pub create_params: CreateParams,

    /// Adjustable runtime parameters.
    pub runtime_params: RwLock<RuntimeParams>,

    /// Node list, route map, and aggregate samp (§5).
    pub state: RwLock<TreeState>,

    pub(crate) media_pool: Arc<dyn MediaPool>,
    pub(crate) journal: Arc<dyn MetadataJournal>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) kvdb_health: Arc<dyn KvdbHealth>,

    /// Set once the media pool has reported `ENOSPC` (§3/§7).
    pub nospace: AtomicBool,

    /// Cooperative cancellation flag checked by in-flight Build steps.
    pub cancel_request: AtomicBool,

    pub(crate) next_nodeid: AtomicU64,
    pub(crate) next_kvset_id: AtomicU64,
    pub(crate) next_dgen: AtomicU64,
    pub(crate) next_job_id: AtomicU64,

    /// Root-spill jobs that finished Build but are not yet Committed,
    /// keyed by job id (§4.F commit-ordering). A spill's own `Work`
    /// lives here between `compact_build` and the moment it becomes
    /// head-of-queue and eligible to run Commit -> Apply -> Release.
    pub(crate) pending_spills: std::sync::Mutex<rustc_hash::FxHashMap<u64, crate::compaction::Work>>,
}

impl std::fmt::Debug for TreeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeInner").field("cnid", &self.cnid).finish_non_exhaustive()
    }
}

impl Drop for TreeInner {
    fn drop(&mut self) {
        log::debug!("tree {} dropped", self.cnid);
    }
}
