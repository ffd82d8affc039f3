// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 6 (§8): a capped tree's root carries three kvsets, newest to
//! oldest `z.. / m.. / a..`. A prefix tombstone at `"m"` retires only the
//! kvset whose max key sits below the tombstone on the first round; a
//! second round with the horizon advanced past every remaining seqno
//! retires the rest.

use cn_tree::{
    config::{CreateParams, RuntimeParams},
    kvset::builder::Builder,
    tree::ingest::PtombUpdate,
    value::KvsetItem,
    Tree,
};
use std::sync::Arc;
use test_log::test;

fn capped_tree() -> Tree {
    Tree::with_in_memory_collaborators(1, CreateParams::new().capped(true).prefix_len(4), RuntimeParams::new())
}

#[test]
fn prefix_tombstone_trims_below_watermark_then_horizon_trims_the_rest() {
    let tree = capped_tree();

    for (kvset_id, dgen, key, seqno) in [(1u64, 1u64, "a", 1u64), (2, 2, "m", 2), (3, 3, "z", 3)] {
        let kvset = Builder::new().add(KvsetItem::new_value(key, "v", seqno)).build(kvset_id, dgen, 0, 11);
        tree.ingest_update(Arc::new(kvset), None).unwrap();
    }

    let ptomb = Builder::new()
        .add(KvsetItem::new_prefix_tombstone("m", 9))
        .build(4, 4, 0, 11);
    tree.ingest_update(
        Arc::new(ptomb),
        Some(PtombUpdate {
            bytes: "m".into(),
            len: 1,
            seqno: 9,
        }),
    )
    .unwrap();

    assert_eq!(4, tree.state.read().unwrap().root().kvsets.len());

    // Round 1: horizon 0 means only the prefix-tombstone clause can
    // retire anything. Only "a" sits strictly below the "m" watermark.
    let retired = tree.capped_compact(0, 0).unwrap();
    assert!(retired);

    let remaining_after_round_1: Vec<_> = {
        let state = tree.state.read().unwrap();
        state.root().kvsets.iter().map(|k| k.min_key().to_vec()).collect()
    };
    assert_eq!(3, remaining_after_round_1.len(), "only the \"a\" kvset should have been retired");
    assert!(!remaining_after_round_1.contains(&b"a".to_vec()));
    assert!(remaining_after_round_1.contains(&b"m".to_vec()));
    assert!(remaining_after_round_1.contains(&b"z".to_vec()));

    // Round 2: advance the horizon past every remaining seqno_max. The
    // tombstone's own kvset can never retire itself — its seqno_max is
    // the watermark's own seqno, and its max_key equals (not precedes)
    // the watermark it carries — so it alone survives the second round.
    let retired_again = tree.capped_compact(10, 0).unwrap();
    assert!(retired_again);

    let remaining_after_round_2: Vec<_> = {
        let state = tree.state.read().unwrap();
        state.root().kvsets.iter().map(|k| k.min_key().to_vec()).collect()
    };
    assert_eq!(vec![b"m".to_vec()], remaining_after_round_2, "only the tombstone's own kvset survives");
}
