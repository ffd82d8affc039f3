// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sampling (component D): per-node stats/HLL maintenance and the
//! space-amp (`samp`) accounting that feeds the scheduler.

use crate::{hll::Hll, kvset::stats::KvsetStats, node::Node};

/// Reference node size used to normalize `pcap` (§4.D step 6). Not a
/// tunable in this design — the original derives it from the mpool's
/// mblock size; we fix it since mblock sizing is out of scope (§1).
const SIZE_MAX: u64 = 32 * 1024 * 1024;

/// Folds one kvset's stats/HLL into an accumulator.
fn fold(acc_stats: &mut KvsetStats, acc_hlog: &mut Option<Hll>, kvset_stats: &KvsetStats, kvset_hlog: Option<&Hll>) {
    *acc_stats += *kvset_stats;

    if let Some(kv_hlog) = kvset_hlog {
        match acc_hlog {
            Some(existing) => existing.union(kv_hlog),
            None => *acc_hlog = Some(kv_hlog.clone()),
        }
    }
}

/// Computed "finish" outputs for one fold pass (§4.D steps 1-6).
struct Finish {
    kclen: u64,
    vclen: u64,
    hclen: u64,
    #[allow(dead_code, reason = "pcap retained for parity with the source contract")]
    pcap: u16,
}

fn finish(stats: &KvsetStats, hlog: Option<&Hll>) -> Finish {
    let total = stats.total_keys;

    let unique = hlog.map_or(total, |h| h.estimate().min(total));

    let pct = if total == 0 {
        1024
    } else {
        1024 * unique / total
    };

    let kclen = stats.kalen.min(stats.kwlen * pct / 1024);
    let vclen = stats.valen.min(stats.vwlen * pct / 1024);
    let hclen = stats.halen;

    let clen = kclen + vclen + hclen;
    let pcap = u16::try_from((100 * clen / SIZE_MAX.max(1)).min(u64::from(u16::MAX))).unwrap_or(u16::MAX);

    Finish {
        kclen,
        vclen,
        hclen,
        pcap,
    }
}

/// Distributes a fold's finish outputs into `node.samp`, zeroing it
/// first (full recomputation semantics of `update_compact`).
fn distribute(node: &mut Node, finish: &Finish) {
    let alen = node.ns.kalen + node.ns.valen + node.ns.halen;
    let wlen = node.ns.kwlen + node.ns.vwlen;
    let clen = finish.kclen + finish.vclen + finish.hclen;

    if node.isroot {
        node.samp.r_alen = alen as i64;
        node.samp.r_wlen = wlen as i64;
    }

    if is_leaf(node) {
        node.samp.l_alen = alen as i64;
        node.samp.l_good = clen as i64;
    } else {
        // Internal node (in this two-level design, only the root):
        // i_alen tracks allocated length the same way a deeper tree's
        // interior nodes would, on top of the root's own r_alen/r_wlen.
        node.samp.i_alen = alen as i64;
    }
}

/// In this two-level design every non-root node is a leaf (§9: "treat
/// the route-map descent as the only descent" — there are no interior
/// nodes between root and leaves).
fn is_leaf(node: &Node) -> bool {
    !node.isroot
}

/// Full recomputation: zero the node's stats/HLL, then fold every kvset
/// forward. Returns the pre-update samp, so the caller can fold the
/// delta into the tree aggregate.
pub fn update_compact(node: &mut Node, hll_precision: u8) -> crate::node::Samp {
    let orig = node.samp;

    node.ns = KvsetStats::default();
    node.hlog = None;

    for kvset in &node.kvsets {
        fold(&mut node.ns, &mut node.hlog, &kvset.stats, kvset.hlog.as_ref());
    }

    if node.hlog.is_none() && !node.kvsets.is_empty() {
        node.hlog = Some(Hll::new(hll_precision));
    }

    let outcome = finish(&node.ns, node.hlog.as_ref());
    distribute(node, &outcome);

    if let Some(max_dgen) = node.kvsets.first().map(|k| k.dgen) {
        node.update_incr_dgen = max_dgen;
    }

    log::debug!(
        "update_compact node={} total_keys={} samp={:?}",
        node.nodeid,
        node.ns.total_keys,
        node.samp
    );

    orig
}

/// Incremental: fold only the newest (head) kvset if its dgen exceeds
/// the node's high-watermark. Returns the pre-update samp.
pub fn update_ingest(node: &mut Node) -> crate::node::Samp {
    let orig = node.samp;

    let Some(head) = node.kvsets.first().cloned() else {
        return orig;
    };

    if head.dgen <= node.update_incr_dgen {
        return orig;
    }

    fold(&mut node.ns, &mut node.hlog, &head.stats, head.hlog.as_ref());
    node.update_incr_dgen = head.dgen;

    let outcome = finish(&node.ns, node.hlog.as_ref());
    distribute(node, &outcome);

    log::debug!(
        "update_ingest node={} head_dgen={} samp={:?}",
        node.nodeid,
        head.dgen,
        node.samp
    );

    orig
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kvset::builder::Builder;
    use crate::value::KvsetItem;
    use test_log::test;

    #[test]
    fn update_ingest_only_folds_new_head() {
        let mut node = Node::new(1, false, Some(crate::UserKey::from("zzz")));

        let kv1 = Builder::new()
            .add(KvsetItem::new_value("a", "1", 1))
            .build(1, 1, 0, 11);
        node.insert_kvset(std::sync::Arc::new(kv1)).unwrap();
        let _ = update_compact(&mut node, 11);

        let kv2 = Builder::new()
            .add(KvsetItem::new_value("b", "2", 2))
            .build(2, 2, 0, 11);
        node.insert_kvset(std::sync::Arc::new(kv2)).unwrap();
        let pre = update_ingest(&mut node);

        assert_eq!(2, node.ns.total_keys);
        assert!(node.samp.l_alen > pre.l_alen);
    }

    #[test]
    fn update_compact_sets_root_i_alen_alongside_r_alen() {
        let mut root = Node::new(0, true, None);

        let kv = Builder::new()
            .add(KvsetItem::new_value("a", "1", 1))
            .build(1, 1, 0, 11);
        root.insert_kvset(std::sync::Arc::new(kv)).unwrap();
        let _ = update_compact(&mut root, 11);

        assert!(root.samp.r_alen > 0);
        assert_eq!(root.samp.r_alen, root.samp.i_alen);
        assert_eq!(0, root.samp.l_alen);
    }
}
