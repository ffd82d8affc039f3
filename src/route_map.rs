// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Route map (component A): maps a key to the leaf node owning its range.
//!
//! Backed by a [`BTreeMap`] keyed on edge-keys (the inclusive upper bound
//! of each leaf's key range) rather than the original's intrusive sorted
//! list — the tree write lock already serializes every mutation, so there
//! is nothing for a lock-free structure to buy here.

use crate::{NodeId, UserKey};
use std::collections::BTreeMap;

/// A route-map entry: the node owning the key range up to (and including)
/// its edge-key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    /// The node id this edge-key routes to.
    pub nodeid: NodeId,
}

/// Ordered edge-key → node mapping.
#[derive(Clone, Debug, Default)]
pub struct RouteMap {
    entries: BTreeMap<UserKey, RouteEntry>,
}

impl RouteMap {
    /// Creates an empty route map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty route map pre-sized for `fanout` leaves.
    ///
    /// `BTreeMap` has no `with_capacity`, so this is a hint recorded for
    /// symmetry with the create-params contract rather than a real
    /// preallocation.
    #[must_use]
    pub fn with_fanout_hint(fanout: u32) -> Self {
        log::trace!("route map sized for fanout hint {fanout}");
        Self::new()
    }

    /// Number of leaves currently routed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the route map has no leaves yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the node whose edge-key is the smallest key `>= key`
    /// (the least upper bound). Returns `None` only when the map is
    /// completely empty; a fully-populated map always resolves.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        self.entries
            .range::<[u8], _>((std::ops::Bound::Included(key), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, entry)| entry.nodeid)
    }

    /// Inserts a new edge-key routing to `nodeid`.
    ///
    /// Returns [`crate::Error::OutOfMemory`] on allocation failure; in
    /// safe Rust this path is unreachable (a `BTreeMap` insert aborts the
    /// process on OOM rather than returning), but the signature stays
    /// fallible for fidelity to the route-map contract.
    pub fn insert(&mut self, edge_key: UserKey, nodeid: NodeId) -> crate::Result<()> {
        log::debug!("route map insert edge_key={edge_key:?} nodeid={nodeid}");
        self.entries.insert(edge_key, RouteEntry { nodeid });
        Ok(())
    }

    /// Removes the entry for `edge_key`.
    ///
    /// Must only be called under the tree write lock, never while
    /// readers may be mid-descent through this map.
    pub fn delete(&mut self, edge_key: &[u8]) -> Option<RouteEntry> {
        log::debug!("route map delete edge_key={edge_key:?}");
        self.entries.remove(edge_key)
    }

    /// Rewrites the edge-key for the entry currently stored at
    /// `old_edge_key`, leaving its routed node unchanged (the split
    /// edge-key fixup corner case, §4.F Apply/SPLIT).
    ///
    /// Returns `false` if `old_edge_key` was not present.
    pub fn key_modify(&mut self, old_edge_key: &[u8], new_edge_key: UserKey) -> bool {
        let Some(entry) = self.entries.remove(old_edge_key) else {
            return false;
        };

        log::debug!(
            "route map key_modify old={old_edge_key:?} new={new_edge_key:?} nodeid={}",
            entry.nodeid
        );
        self.entries.insert(new_edge_key, entry);
        true
    }

    /// Compares a stored edge-key against a supplied key.
    #[must_use]
    pub fn keycmp(&self, edge_key: &[u8], key: &[u8]) -> std::cmp::Ordering {
        edge_key.cmp(key)
    }

    /// `true` if `edge_key` is the maximum edge-key entry (owns
    /// `[prev_edge, +inf)`).
    #[must_use]
    pub fn islast(&self, edge_key: &[u8]) -> bool {
        self.entries
            .keys()
            .next_back()
            .is_some_and(|max| max.as_ref() == edge_key)
    }

    /// Iterates edge-keys in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&UserKey, &RouteEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn lookup_resolves_least_upper_bound() {
        let mut map = RouteMap::new();
        map.insert(UserKey::from("m"), 1).unwrap();
        map.insert(UserKey::from("z"), 2).unwrap();

        assert_eq!(Some(1), map.lookup(b"apple"));
        assert_eq!(Some(1), map.lookup(b"m"));
        assert_eq!(Some(2), map.lookup(b"n"));
        assert_eq!(Some(2), map.lookup(b"zzz_wont_exist_but_still_routes_last"));
    }

    #[test]
    fn islast_tracks_max_edge_key() {
        let mut map = RouteMap::new();
        map.insert(UserKey::from("m"), 1).unwrap();
        map.insert(UserKey::from("z"), 2).unwrap();

        assert!(!map.islast(b"m"));
        assert!(map.islast(b"z"));
    }

    #[test]
    fn key_modify_rewrites_edge_preserving_node() {
        let mut map = RouteMap::new();
        map.insert(UserKey::from("mango"), 7).unwrap();

        assert!(map.key_modify(b"mango", UserKey::from("peach")));
        assert_eq!(Some(7), map.lookup(b"mango"));
        assert_eq!(Some(7), map.lookup(b"orange"));
        assert!(map.islast(b"peach"));
        assert!(!map.islast(b"mango"));
    }
}
