// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `PROBE_PFX` must draw from the same 5-value result enum `GET` uses
//! (§4.E): a probe matching exactly one visible entry under the prefix
//! reports `FoundValue`/`FoundTombstone`, not `NotFound`.

use cn_tree::{
    config::{CreateParams, RuntimeParams},
    kvset::builder::Builder,
    lookup::{LookupResult, QueryType},
    value::KvsetItem,
    Tree,
};
use std::sync::Arc;
use test_log::test;

#[test]
fn probe_pfx_single_match_reports_found_value() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_value("alpha:1", "1", 1))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(
        LookupResult::FoundValue("1".into()),
        tree.lookup(b"alpha:", 10, QueryType::ProbePfx).unwrap()
    );
}

#[test]
fn probe_pfx_single_tombstone_match_reports_found_tombstone() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_tombstone("alpha:1", 1))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(
        LookupResult::FoundTombstone,
        tree.lookup(b"alpha:", 10, QueryType::ProbePfx).unwrap()
    );
}

#[test]
fn probe_pfx_no_match_reports_not_found() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_value("alpha:1", "1", 1))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(LookupResult::NotFound, tree.lookup(b"zzz:", 10, QueryType::ProbePfx).unwrap());
}

#[test]
fn probe_pfx_two_matches_reports_found_multiple() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_value("alpha:1", "1", 1))
        .add(KvsetItem::new_value("alpha:2", "2", 1))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(
        LookupResult::FoundMultiple,
        tree.lookup(b"alpha:", 10, QueryType::ProbePfx).unwrap()
    );
}

#[test]
fn probe_pfx_matches_only_below_view_seqno() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_value("alpha:1", "1", 5))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(LookupResult::NotFound, tree.lookup(b"alpha:", 1, QueryType::ProbePfx).unwrap());
    assert_eq!(
        LookupResult::FoundValue("1".into()),
        tree.lookup(b"alpha:", 5, QueryType::ProbePfx).unwrap()
    );
}
