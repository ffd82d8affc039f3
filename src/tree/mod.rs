// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree (component C): the root-plus-leaves structure described in §3,
//! under the single read-mostly lock described in §5.

pub mod capped;
pub mod ingest;
pub mod inner;
pub mod traversal;

use crate::{
    collab::{
        health::{InMemoryHealth, KvdbHealth},
        journal::{InMemoryJournal, MetadataJournal},
        media_pool::{InMemoryMediaPool, MediaPool},
        scheduler::{NullScheduler, Scheduler},
    },
    config::{CreateParams, RuntimeParams},
    kvset::Kvset,
    lookup::{self, LookupResult, QueryType},
    node::{Node, NodeId, NodeStatsSnapshot, Samp},
    route_map::RouteMap,
    value::SeqNo,
};
use inner::{TreeInner, TreeState};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};

/// A cN tree: a root node plus leaves, navigated through a route map
/// (§3/§4.C). Cheap to clone — clones share the same underlying state
/// via `Arc`, the same `Tree(Arc<TreeInner>)` pattern used throughout.
#[derive(Clone)]
pub struct Tree(Arc<TreeInner>);

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tree").field(&self.0).finish()
    }
}

impl std::ops::Deref for Tree {
    type Target = TreeInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Tree {
    /// Creates a new, empty tree (root only, no leaves yet) bound to the
    /// given collaborators.
    ///
    /// # Panics
    ///
    /// Panics if `create_params.fanout` or `.prefix_len` are out of
    /// range (already enforced by [`CreateParams`]'s own setters, this
    /// is a last-line defense against a params value built some other
    /// way).
    #[must_use]
    pub fn create(
        cnid: u64,
        create_params: CreateParams,
        runtime_params: RuntimeParams,
        kvdb_health: Arc<dyn KvdbHealth>,
        media_pool: Arc<dyn MediaPool>,
        journal: Arc<dyn MetadataJournal>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        assert!(
            (crate::config::FANOUT_MIN..=crate::config::FANOUT_MAX).contains(&create_params.fanout),
            "fanout out of range"
        );
        assert!(create_params.prefix_len <= crate::config::PFX_LEN_MAX, "prefix length too large");

        let route_map = RouteMap::with_fanout_hint(create_params.fanout);
        let root = Node::new(0, true, None);

        log::debug!(
            "tree {cnid} created: fanout={} prefix_len={} capped={}",
            create_params.fanout,
            create_params.prefix_len,
            create_params.capped
        );

        let state = TreeState {
            nodes: vec![root],
            route_map,
            samp: Samp::default(),
            last_ptomb: None,
            capped_evict_cursor: 0,
        };

        Self(Arc::new(TreeInner {
            cnid,
            create_params,
            runtime_params: RwLock::new(runtime_params),
            state: RwLock::new(state),
            media_pool,
            journal,
            scheduler,
            kvdb_health,
            nospace: AtomicBool::new(false),
            cancel_request: AtomicBool::new(false),
            next_nodeid: AtomicU64::new(1), // 0 is reserved for the root
            next_kvset_id: AtomicU64::new(1),
            next_dgen: AtomicU64::new(1),
            next_job_id: AtomicU64::new(1),
            pending_spills: Mutex::new(rustc_hash::FxHashMap::default()),
        }))
    }

    /// Creates a tree wired to in-memory collaborator test doubles —
    /// convenient for tests and for embedding without a real media
    /// pool/journal.
    #[must_use]
    pub fn with_in_memory_collaborators(cnid: u64, create_params: CreateParams, runtime_params: RuntimeParams) -> Self {
        Self::create(
            cnid,
            create_params,
            runtime_params,
            Arc::new(InMemoryHealth::new()),
            Arc::new(InMemoryMediaPool::new()),
            Arc::new(InMemoryJournal::new()),
            Arc::new(NullScheduler),
        )
    }

    /// Point or prefix lookup (component E, §4.E).
    ///
    /// # Errors
    ///
    /// Propagates any error raised while scanning a kvset.
    pub fn lookup(&self, key: &[u8], view_seqno: SeqNo, query: QueryType) -> crate::Result<LookupResult> {
        lookup::lookup(self, key, view_seqno, query)
    }

    /// A point-in-time stats/samp/cgen snapshot for `nodeid`, or `None`
    /// if unknown.
    #[must_use]
    pub fn find_node(&self, nodeid: NodeId) -> Option<NodeStatsSnapshot> {
        self.state.read().expect("lock is poisoned").find_node(nodeid).map(Node::stats_snapshot)
    }

    /// The tree-wide samp aggregate (§4.D).
    #[must_use]
    pub fn tree_samp(&self) -> Samp {
        self.state.read().expect("lock is poisoned").samp
    }

    /// Current runtime params.
    #[must_use]
    pub fn runtime_params(&self) -> RuntimeParams {
        self.runtime_params.read().expect("lock is poisoned").clone()
    }

    /// Replaces the tree's runtime params.
    pub fn set_runtime_params(&self, params: RuntimeParams) {
        *self.runtime_params.write().expect("lock is poisoned") = params;
    }

    pub(crate) fn next_nodeid(&self) -> NodeId {
        self.next_nodeid.fetch_add(1, Ordering::AcqRel)
    }

    /// Mints a fresh kvset id for a new kvset about to be ingested.
    /// Writers outside this crate call this (and [`Self::next_dgen`])
    /// before building the kvset they hand to [`Self::ingest_update`].
    pub fn next_kvset_id(&self) -> u64 {
        self.next_kvset_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Mints a fresh, strictly-increasing dgen for a new kvset about to
    /// be ingested onto the root.
    pub fn next_dgen(&self) -> u64 {
        self.next_dgen.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Requests cooperative cancellation of in-flight compaction Build
    /// steps (shutdown path, §7).
    pub fn request_cancel(&self) {
        self.cancel_request.store(true, Ordering::Release);
    }

    /// `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_request.load(Ordering::Acquire)
    }

    /// `true` once a media-pool `ENOSPC` has been observed (§3/§7).
    #[must_use]
    pub fn is_nospace(&self) -> bool {
        self.nospace.load(Ordering::Acquire)
    }

    pub(crate) fn set_nospace(&self) {
        self.nospace.store(true, Ordering::Release);
    }

    /// Loader entry point (§6): inserts a persisted kvset into the
    /// identified node, preserving dgen order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Corruption`] if `nodeid` is unknown, or
    /// if `kvset`'s dgen collides with one already on the node.
    pub fn load_kvset(&self, kvset: Arc<Kvset>, nodeid: NodeId) -> crate::Result<()> {
        let mut state = self.state.write().expect("lock is poisoned");

        let node = state.find_node_mut(nodeid).ok_or_else(|| {
            log::error!("load_kvset: unknown node {nodeid}");
            crate::Error::Corruption
        })?;

        node.insert_kvset(kvset)
    }

    /// Inserts a new, empty leaf node routed by `edge_key`, used by the
    /// loader to reconstruct a persisted route map before loading its
    /// kvsets (§6).
    ///
    /// # Errors
    ///
    /// Propagates a route-map insert failure.
    pub fn load_node(&self, nodeid: NodeId, edge_key: crate::UserKey) -> crate::Result<()> {
        let mut state = self.state.write().expect("lock is poisoned");
        state.route_map.insert(edge_key.clone(), nodeid)?;
        state.nodes.push(Node::new(nodeid, false, Some(edge_key)));
        Ok(())
    }

    /// Destroys the tree: releases every node's kvset refs through a
    /// scoped thread per node so the releases overlap (§4.C), then waits
    /// for all of them to quiesce before returning. Nodes are handed to
    /// the scope leaves-first, root last, though release order has no
    /// observable effect once every node's kvsets are plain owned `Arc`s.
    pub fn destroy(self) {
        let mut nodes = {
            let mut state = self.state.write().expect("lock is poisoned");
            state.route_map = RouteMap::new();
            std::mem::take(&mut state.nodes)
        };

        nodes.reverse();
        log::debug!("destroying tree {} ({} nodes)", self.cnid, nodes.len());

        std::thread::scope(|scope| {
            for node in &mut nodes {
                let kvsets = std::mem::take(&mut node.kvsets);
                let nodeid = node.nodeid;
                scope.spawn(move || {
                    log::debug!("releasing {} kvsets on node {nodeid}", kvsets.len());
                    drop(kvsets);
                });
            }
        });
    }
}
