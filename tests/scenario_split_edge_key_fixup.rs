// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 4 (§8): splitting the last leaf at its own edge-key moves
//! that key left and rewrites the route map's edge-key to the right
//! side's new (smaller) max key.

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
fn split_at_last_edge_key_moves_it_left_and_rewrites_edge() {
    let tree = Tree::with_in_memory_collaborators(1, CreateParams::new(), RuntimeParams::new());

    let leaf_id = tree.next_nodeid();
    tree.load_node(leaf_id, "mango".into()).unwrap();

    let kvset = Builder::new()
        .add(KvsetItem::new_value("apple", "1", 1))
        .add(KvsetItem::new_value("banana", "2", 2))
        .add(KvsetItem::new_value("mango", "3", 3))
        .add(KvsetItem::new_value("peach", "4", 4))
        .build(tree.next_kvset_id(), 1, 0, 11);

    {
        let mut state = tree.state.write().unwrap();
        state.find_node_mut(leaf_id).unwrap().insert_kvset(Arc::new(kvset)).unwrap();
    }

    let ran = tree.compact(leaf_id, Action::Split, 1, Some("mango".into())).unwrap();
    assert!(ran);

    assert_eq!(LookupResult::FoundValue("1".into()), tree.lookup(b"apple", 10, QueryType::Get).unwrap());
    assert_eq!(LookupResult::FoundValue("2".into()), tree.lookup(b"banana", 10, QueryType::Get).unwrap());
    assert_eq!(LookupResult::FoundValue("3".into()), tree.lookup(b"mango", 10, QueryType::Get).unwrap());
    assert_eq!(LookupResult::FoundValue("4".into()), tree.lookup(b"peach", 10, QueryType::Get).unwrap());

    let state = tree.state.read().unwrap();
    assert!(state.route_map.islast(b"peach"));
    assert!(!state.route_map.islast(b"mango"));
    assert_ne!(Some(leaf_id), state.route_map.lookup(b"mango"));
    assert_eq!(Some(leaf_id), state.route_map.lookup(b"peach"));
}
