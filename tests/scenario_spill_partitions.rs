// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 3 (§8): a root kvset spilled across two leaves lands each
//! key on the leaf its edge-key routes it to, emptying the root.

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
fn spill_routes_each_key_to_its_leaf_and_empties_root() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new(), RuntimeParams::new());

    tree.load_node(1, "m".into()).unwrap();
    tree.load_node(2, "z".into()).unwrap();

    let kvset = Builder::new()
        .add(KvsetItem::new_value("a", "1", 1))
        .add(KvsetItem::new_value("n", "2", 2))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    let ran = tree.compact(0, Action::Spill, 1, None).unwrap();
    assert!(ran);

    assert!(tree.state.read().unwrap().root().kvsets.is_empty());
    assert_eq!(LookupResult::FoundValue("1".into()), tree.lookup(b"a", 10, QueryType::Get).unwrap());
    assert_eq!(LookupResult::FoundValue("2".into()), tree.lookup(b"n", 10, QueryType::Get).unwrap());

    let left_kvsets = tree.state.read().unwrap().find_node(1).unwrap().kvsets.len();
    let right_kvsets = tree.state.read().unwrap().find_node(2).unwrap().kvsets.len();
    assert_eq!(1, left_kvsets);
    assert_eq!(1, right_kvsets);
}
