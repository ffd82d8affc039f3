// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 1 (§8): a fresh tree, one ingested kvset, a hit and a miss.

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
fn ingest_then_get_hit_and_miss() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(16).prefix_len(0), RuntimeParams::new());

    let kvset = Builder::new()
        .add(KvsetItem::new_value("alpha", "1", 1))
        .build(1, 1, 0, 11);
    tree.ingest_update(Arc::new(kvset), None).unwrap();

    assert_eq!(
        LookupResult::FoundValue("1".into()),
        tree.lookup(b"alpha", 10, QueryType::Get).unwrap()
    );
    assert_eq!(LookupResult::NotFound, tree.lookup(b"beta", 10, QueryType::Get).unwrap());
}
