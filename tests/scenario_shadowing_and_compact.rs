// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 2 (§8): a key shadowed across two kvsets resolves to the
//! newest value both before and after a k-compact folds them together.

use cn_tree::{
    compaction::Action,
    config::{CreateParams, RuntimeParams},
    kvset::builder::Builder,
    lookup::{LookupResult, QueryType},
    value::KvsetItem,
    Tree,
};
use std::sync::Arc;
use test_log::test;

#[test]
fn shadowed_key_resolves_newest_then_survives_compaction() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new(), RuntimeParams::new());

    let first = Builder::new().add(KvsetItem::new_value("k", "v1", 1)).build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(first), None).unwrap();

    let second = Builder::new().add(KvsetItem::new_value("k", "v2", 2)).build(2, 2, 0, 11);
    tree.ingest_update(Arc::new(second), None).unwrap();

    assert_eq!(LookupResult::FoundValue("v2".into()), tree.lookup(b"k", 10, QueryType::Get).unwrap());

    let ran = tree.compact(0, Action::CompactK, 2, None).unwrap();
    assert!(ran);

    assert_eq!(1, tree.state.read().unwrap().root().kvsets.len());
    assert_eq!(LookupResult::FoundValue("v2".into()), tree.lookup(b"k", 10, QueryType::Get).unwrap());
}
