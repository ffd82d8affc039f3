// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scenario 5 (§8): three root-spills are enqueued in order S1, S2, S3.
//! S1's commit fails with a simulated journal error; S2 and S3 must
//! terminate wedged regardless of their own build outcome, the root's
//! `wedged` flag must be set, `tree.nospace` must stay untouched, and
//! neither S2 nor S3's outputs may land on any leaf.

use cn_tree::{
    collab::{
        health::InMemoryHealth,
        journal::InMemoryJournal,
        media_pool::InMemoryMediaPool,
        scheduler::NullScheduler,
    },
    compaction::Action,
    config::{CreateParams, RuntimeParams},
    kvset::builder::Builder,
    value::KvsetItem,
    Error, Tree,
};
use std::sync::Arc;
use test_log::test;

#[test]
fn failed_spill_commit_wedges_root_and_blocks_queued_spills() {
    let health = Arc::new(InMemoryHealth::new());
    let journal = Arc::new(InMemoryJournal::new());
    let tree = Tree::create(
        1,
        CreateParams::new(),
        RuntimeParams::new(),
        Arc::clone(&health) as _,
        Arc::new(InMemoryMediaPool::new()),
        journal.clone(),
        Arc::new(NullScheduler),
    );

    // A single leaf covering everything, so spill outputs have somewhere
    // to land if (incorrectly) applied.
    tree.load_node(1, "zzz".into()).unwrap();

    for (kvset_id, dgen, key, seqno) in [(1u64, 1u64, "a", 1u64), (2, 2, "b", 2), (3, 3, "c", 3)] {
        let kvset = Builder::new().add(KvsetItem::new_value(key, "v", seqno)).build(kvset_id, dgen, 0, 11);
        tree.ingest_update(Arc::new(kvset), None).unwrap();
    }
    assert_eq!(3, tree.state.read().unwrap().root().kvsets.len());

    // Prepare + build all three spills before any of them commits, so
    // the FIFO genuinely has three distinct in-flight jobs.
    let mut s1 = tree.compact_prepare(0, Action::Spill, 1, None).unwrap().unwrap();
    tree.compact_build(&mut s1).unwrap();

    let mut s2 = tree.compact_prepare(0, Action::Spill, 1, None).unwrap().unwrap();
    tree.compact_build(&mut s2).unwrap();

    let mut s3 = tree.compact_prepare(0, Action::Spill, 1, None).unwrap().unwrap();
    tree.compact_build(&mut s3).unwrap();

    // Arm the one-shot journal failure: it fires on the first `txstart`,
    // which will be S1's commit once it reaches the head of the queue.
    journal.fail_next_txstart();

    // Finish out of enqueue order: S3 and S2 stash themselves (S1 is
    // still head-of-queue and not done), then S1 drives the drain that
    // wedges the root and cascades the failure onto S2 and S3.
    let s3_result = tree.compact_finish(s3);
    let s2_result = tree.compact_finish(s2);
    let s1_result = tree.compact_finish(s1);

    assert!(s3_result.is_ok(), "S3's own finish call only stashes it, no drain happens yet");
    assert!(s2_result.is_ok(), "S2's own finish call only stashes it, no drain happens yet");
    assert!(s1_result.is_err(), "S1's finish call drives the drain and surfaces a failure");

    assert!(tree.state.read().unwrap().root().is_wedged());
    assert!(!tree.is_nospace(), "a journal failure must not set nospace");
    assert!(health.is_fatal());

    // No leaked outputs: S2 and S3's spill outputs never got applied.
    let leaf_kvsets = tree.state.read().unwrap().find_node(1).unwrap().kvsets.len();
    assert_eq!(0, leaf_kvsets, "no spill output should have reached the leaf");

    // S1's own input was never actually removed either (Apply never ran
    // for it — Commit failed first).
    assert_eq!(3, tree.state.read().unwrap().root().kvsets.len());

    // The armed failure fires on `txstart` itself, before any transaction
    // exists to nak — so no transaction is ever opened, let alone aborted.
    assert!(journal.naks().is_empty());

    match s1_result {
        Err(Error::Journal | Error::Wedged) => {}
        other => panic!("unexpected result from the drain: {other:?}"),
    }
}
