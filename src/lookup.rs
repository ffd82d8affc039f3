// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Lookup (component E): descent + per-kvset probe for `GET` and
//! `PROBE_PFX` queries (§4.E).

use crate::{node::Node, tree::Tree, value::SeqNo};

/// The outcome of a point or prefix lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupResult {
    /// No matching, visible entry was found.
    NotFound,
    /// A live value was found.
    FoundValue(crate::UserValue),
    /// A point tombstone shadows the key.
    FoundTombstone,
    /// A prefix tombstone shadows the key (or the whole probed prefix).
    FoundPrefixTombstone,
    /// A `PROBE_PFX` query matched more than one key under the prefix.
    FoundMultiple,
}

impl LookupResult {
    /// `true` if this result should stop a `GET` descent (§4.E: "any
    /// kvset returns `FOUND_*` or an error").
    fn stops_get(&self) -> bool {
        !matches!(self, Self::NotFound)
    }

    /// `true` if this result should stop a `PROBE_PFX` descent (§4.E:
    /// "`seen > 1`, or a `FOUND_PTMB`").
    fn stops_probe(&self) -> bool {
        matches!(self, Self::FoundPrefixTombstone | Self::FoundMultiple)
    }
}

/// The kind of lookup being performed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryType {
    /// Point lookup: resolve a single key.
    Get,
    /// Prefix probe: determine whether a prefix is unambiguous (at most
    /// one matching key visible).
    ProbePfx,
}

/// Scans `node`'s kvsets newest -> oldest, stopping per the query-type's
/// stop condition. `seen` accumulates `PROBE_PFX` match counts across
/// every node visited during the descent (root, then leaf).
fn scan_node(node: &Node, key: &[u8], view_seqno: SeqNo, query: QueryType, seen: &mut u32) -> crate::Result<LookupResult> {
    let mut last_match = LookupResult::NotFound;

    for kvset in &node.kvsets {
        let result = match query {
            QueryType::Get => kvset.lookup(key, view_seqno)?,
            QueryType::ProbePfx => kvset.pfx_lookup(key, view_seqno, seen)?,
        };

        let stop = match query {
            QueryType::Get => result.stops_get(),
            QueryType::ProbePfx => result.stops_probe(),
        };

        if stop {
            return Ok(result);
        }

        if !matches!(result, LookupResult::NotFound) {
            // A single PROBE_PFX match so far: not yet a stop condition
            // (seen == 1, no FOUND_PTMB), but if nothing else in this
            // node or the next one bumps `seen` past 1, this is the
            // answer — not NOT_FOUND.
            last_match = result;
        }
    }

    Ok(last_match)
}

/// Descends the tree under the read lock: root's kvsets first, then (if
/// still unresolved) the owning leaf's, per the route map. A cN tree is
/// exactly two levels deep (§4.E) — there is no further descent.
///
/// # Errors
///
/// Propagates any error returned by a kvset's own lookup/probe.
pub fn lookup(tree: &Tree, key: &[u8], view_seqno: SeqNo, query: QueryType) -> crate::Result<LookupResult> {
    let state = tree.state.read().expect("lock is poisoned");
    let mut seen = 0u32;

    log::trace!("lookup key={key:?} view_seqno={view_seqno} query={query:?}");

    let root = state.nodes.first().expect("tree always has a root");
    let root_result = scan_node(root, key, view_seqno, query, &mut seen)?;

    let done = match query {
        QueryType::Get => root_result.stops_get(),
        QueryType::ProbePfx => root_result.stops_probe(),
    };

    if done {
        return Ok(root_result);
    }

    let Some(leaf_id) = state.route_map.lookup(key) else {
        // Unpopulated route map (no leaves yet): nothing below the root.
        return Ok(root_result);
    };

    let Some(leaf) = state.find_node(leaf_id) else {
        debug_assert!(false, "route map points at missing node {leaf_id}");
        log::error!("route map points at missing node {leaf_id}");
        return Err(crate::Error::Corruption);
    };

    // `seen` carries over from the root scan, so a match in the root
    // plus one in the leaf still correctly reports `FoundMultiple`
    // (enforced inside `Kvset::pfx_lookup` as soon as the count crosses
    // 1, whichever node it's scanning).
    let leaf_result = scan_node(leaf, key, view_seqno, query, &mut seen)?;

    // The leaf added nothing of its own; fall back to whatever the root
    // scan already found rather than reporting NOT_FOUND over a single
    // visible root match.
    if matches!(leaf_result, LookupResult::NotFound) {
        return Ok(root_result);
    }

    Ok(leaf_result)
}
