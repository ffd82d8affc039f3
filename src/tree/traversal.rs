// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Traversal and views (component I, §4.I): a callback-driven preorder
//! walk for tools/debugging, and a flat, mutation-tolerant [`View`] for
//! longer-lived scans (e.g. full-tree export).

use super::Tree;
use crate::{kvset::Kvset, node::NodeId, UserKey};
use std::sync::Arc;

/// The order to walk a node's kvset list in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Order {
    /// Head (newest) to tail (oldest) — the order lookups scan in.
    NewestFirst,
    /// Tail (oldest) to head (newest).
    OldestFirst,
}

/// One step handed to a [`Tree::preorder_walk`] callback.
pub enum Step<'a> {
    /// A kvset belonging to `node`.
    Kvset {
        /// The node `kvset` belongs to.
        node: NodeId,
        /// The kvset itself.
        kvset: &'a Arc<Kvset>,
    },
    /// All of `node`'s kvsets have been visited.
    NodeBoundary {
        /// The node whose kvsets were just visited.
        node: NodeId,
    },
    /// The walk has visited every node.
    TreeEnd,
}

impl Tree {
    /// Walks every node's kvsets under a single read-lock hold, newest
    /// or oldest first per `order`, invoking `cb` for each step. `cb`
    /// returning `true` aborts the walk early (§4.I).
    ///
    /// Held for the whole walk — callers that need something longer-
    /// lived or tolerant of concurrent mutation should use
    /// [`Tree::view_create`] instead.
    pub fn preorder_walk(&self, order: Order, mut cb: impl FnMut(Step<'_>) -> bool) {
        let state = self.state.read().expect("lock is poisoned");

        for node in &state.nodes {
            let aborted = match order {
                Order::NewestFirst => node.kvsets.iter().any(|k| cb(Step::Kvset { node: node.nodeid, kvset: k })),
                Order::OldestFirst => node
                    .kvsets
                    .iter()
                    .rev()
                    .any(|k| cb(Step::Kvset { node: node.nodeid, kvset: k })),
            };

            if aborted {
                return;
            }

            if cb(Step::NodeBoundary { node: node.nodeid }) {
                return;
            }
        }

        cb(Step::TreeEnd);
    }
}

/// One entry in a [`View`]: a node boundary (with its edge-key copied,
/// `None` for the root) or a kvset reference.
pub enum ViewEntry {
    /// Marks the start of `nodeid`'s kvsets.
    Node {
        /// The node this boundary introduces.
        nodeid: NodeId,
        /// The node's edge-key, copied at view-build time (`None` for the
        /// root).
        edge_key: Option<UserKey>,
    },
    /// A kvset belonging to the most recently emitted `Node` entry.
    Kvset {
        /// The node `kvset` belongs to.
        nodeid: NodeId,
        /// The kvset itself, ref-counted independently of the live tree.
        kvset: Arc<Kvset>,
    },
}

/// A consistent, read-only flat snapshot of a tree's nodes and kvsets
/// (§4.I). Because entries copy node ids/edge-keys and clone `Arc`
/// kvset handles rather than borrowing, a view tolerates concurrent
/// mutation after it's built: a kvset retired from the live tree after
/// the view was taken stays alive (and visible through the view) until
/// the view itself is dropped.
pub struct View {
    entries: Vec<ViewEntry>,
}

impl View {
    /// The view's flat entry list, in node-then-kvset order.
    #[must_use]
    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }
}

impl Tree {
    /// Builds a [`View`] over every node and kvset, releasing and
    /// re-acquiring the read lock every `runtime_params.view_yield_interval`
    /// nodes so a long view build doesn't starve writers (§4.I).
    #[must_use]
    pub fn view_create(&self) -> View {
        let yield_interval = usize::try_from(self.runtime_params().view_yield_interval.max(1)).unwrap_or(usize::MAX);

        let mut entries = Vec::new();
        let mut cursor = 0usize;

        loop {
            let state = self.state.read().expect("lock is poisoned");
            let end = (cursor + yield_interval).min(state.nodes.len());

            for node in state.nodes.get(cursor..end).unwrap_or_default() {
                entries.push(ViewEntry::Node {
                    nodeid: node.nodeid,
                    edge_key: node.route_node.clone(),
                });
                for kvset in &node.kvsets {
                    entries.push(ViewEntry::Kvset {
                        nodeid: node.nodeid,
                        kvset: Arc::clone(kvset),
                    });
                }
            }

            let done = end >= state.nodes.len();
            drop(state);

            cursor = end;
            if done {
                break;
            }
        }

        View { entries }
    }
}
