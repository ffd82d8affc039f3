// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The compaction runtime (component F, §4.F): the Prepare -> Build ->
//! Commit -> Apply -> Retire -> Release state machine shared by all four
//! actions (`COMPACT_K`, `COMPACT_KV`, `SPILL`, `SPLIT`).
//!
//! Prepare and Commit/Apply/Retire/Release run under the tree lock (or a
//! node's own tokens); Build runs off it, typically on a job-runner
//! thread (§6). A single [`Work`] value threads through every step.

use crate::{
    collab::journal::KvsetMeta,
    kvset::{builder::Builder, Kvset},
    merge::{BoxedIterator, Merger},
    node::{Node, NodeId},
    route_map::RouteMap,
    sampling,
    tree::Tree,
    value::KvsetItem,
    Error, UserKey,
};
use std::sync::Arc;

/// One of the four compaction actions a [`Work`] can carry out (§4.F).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Merge the oldest `kvset_cnt` kvsets on a node, keeping only the
    /// newest occurrence of each key (garbage-collecting shadowed
    /// values and, if nothing older survives, tombstones too).
    CompactK,

    /// Same merge as `CompactK`; distinguished only so a scheduler can
    /// bias selection by vgroup scatter rather than kvset count.
    CompactKv,

    /// Drains the oldest `kvset_cnt` root kvsets, partitions their
    /// merged contents by the route map, and appends one new kvset per
    /// touched leaf.
    Spill,

    /// Partitions every kvset on a node around `split_key`, minting a
    /// new leaf for the left half and leaving the right half in place.
    Split,
}

/// A staged build output before it has been assigned a kvset id or
/// committed to the journal: the merged items destined for one output
/// kvset, plus the dgen it should carry.
#[derive(Clone, Debug, Default)]
struct StagedOutput {
    dgen: u64,
    items: Vec<KvsetItem>,
}

/// The per-action staging area `compact_build` fills in and
/// `compact_commit` consumes.
#[derive(Clone, Debug)]
enum OutputSlot {
    /// `CompactK`/`CompactKv`: a single merged output, empty if every
    /// input item was shadowed or (at the tail) a dropped tombstone.
    Single(StagedOutput),

    /// `Spill`: one staged output per destination leaf.
    Spill(Vec<(NodeId, StagedOutput)>),

    /// `Split`: left-half outputs (destined for a newly minted leaf)
    /// and right-half outputs (staying on `Work::nodeid`), each kept
    /// per-source so dgens survive the partition untouched.
    Split {
        left: Vec<StagedOutput>,
        right: Vec<StagedOutput>,
    },
}

/// A committed output, ready for `compact_apply`.
struct PreparedOutput {
    nodeid: NodeId,
    kvset: Arc<Kvset>,
}

/// A compaction job threaded through Prepare -> Build -> Commit -> Apply
/// -> Retire -> Release (§4.F). Travels between `Tree::compact_prepare`,
/// a job runner's worker thread (`compact_build`), and back to the tree
/// (`compact_finish`) crossing no lock but carrying everything both
/// sides need.
#[derive(Debug)]
pub struct Work {
    /// Identity assigned at Prepare; also the root-spill FIFO key.
    pub job_id: u64,

    /// The node this job was selected against (the root, for `Spill`).
    pub nodeid: NodeId,

    /// Which action this job performs.
    pub action: Action,

    /// Number of oldest kvsets selected as input.
    pub kvset_cnt: usize,

    /// Smallest dgen among the selected inputs.
    pub dgen_lo: u64,

    /// Largest dgen among the selected inputs.
    pub dgen_hi: u64,

    /// Highest compc among the selected inputs, the seed for the
    /// compc rules applied at Commit.
    pub compc: u32,

    /// `true` once a tombstone with nothing older to shadow may be
    /// dropped outright rather than carried forward.
    pub drop_tombstones: bool,

    /// The key `Split` partitions around. `None` for every other
    /// action.
    pub split_key: Option<UserKey>,

    /// Set by Build on failure, or by Prepare/Commit/Apply short-
    /// circuiting; inspected by `compact_finish` to decide nak/cleanup
    /// vs. commit.
    pub err: Option<Error>,

    /// `true` if this job was short-circuited by cooperative
    /// cancellation rather than failing outright.
    pub canceled: bool,

    inputs: Vec<Arc<Kvset>>,
    route_snapshot: Option<RouteMap>,
    output: Option<OutputSlot>,
    split_left_nodeid: Option<NodeId>,
}

impl Tree {
    /// Prepare (§4.F): selects the oldest `kvset_cnt` kvsets on
    /// `nodeid`, acquires the node's concurrency token (or enqueues on
    /// `rspills` for a spill), and returns a [`Work`] ready for
    /// `compact_build`.
    ///
    /// Returns `Ok(None)` if the node is unknown, has fewer than
    /// `kvset_cnt` kvsets, is already mid-compaction (K/KV/SPLIT), or is
    /// wedged (SPILL on the root) — none of these are errors, just
    /// "nothing to do right now".
    ///
    /// # Errors
    ///
    /// Propagates a route-map failure while snapshotting for `Spill`.
    pub fn compact_prepare(
        &self,
        nodeid: NodeId,
        action: Action,
        kvset_cnt: usize,
        split_key: Option<UserKey>,
    ) -> crate::Result<Option<Work>> {
        if kvset_cnt == 0 {
            return Ok(None);
        }

        let state = self.state.read().expect("lock is poisoned");
        let Some(node) = state.find_node(nodeid) else {
            return Ok(None);
        };

        if matches!(action, Action::Spill) && node.is_wedged() {
            return Ok(None);
        }

        if node.kvsets.len() < kvset_cnt {
            return Ok(None);
        }

        // K/KV/SPLIT hold the node's exclusive compaction token for their
        // whole Prepare-through-Apply lifetime, so only one such job is
        // ever selecting against a node at a time and it may simply take
        // the literal tail. Spills hold no token — several may be
        // prepared back to back before any of them has applied (and thus
        // physically removed its inputs), so a spill's Prepare must skip
        // kvsets already enlisted by an earlier, still-in-flight spill
        // (invariant 4, §3) rather than re-select the same tail entries.
        let inputs: Vec<Arc<Kvset>> = if matches!(action, Action::Spill) {
            let unenlisted: Vec<&Arc<Kvset>> = node.kvsets.iter().rev().filter(|k| k.workid().is_none()).collect();
            if unenlisted.len() < kvset_cnt {
                return Ok(None);
            }
            unenlisted.into_iter().take(kvset_cnt).rev().map(Arc::clone).collect()
        } else {
            node.kvsets.iter().rev().take(kvset_cnt).rev().map(Arc::clone).collect()
        };
        let dgen_lo = inputs.first().map(|k| k.dgen).unwrap_or_default();
        let dgen_hi = inputs.last().map(|k| k.dgen).unwrap_or_default();
        let compc = inputs.iter().map(|k| k.compc).max().unwrap_or_default();

        // Every tail selection removes the oldest kvsets on the node, so
        // there is nothing older left for a tombstone in this merge to
        // shadow once the merge actually runs.
        let drop_tombstones = !matches!(action, Action::Spill) && kvset_cnt == node.kvsets.len();

        let route_snapshot = matches!(action, Action::Spill).then(|| state.route_map.clone());

        if matches!(action, Action::Spill) {
            // Spills never take the exclusive token; ordering is
            // enforced by the rspills FIFO instead (§5).
        } else if !node.compact_token_try_acquire() {
            return Ok(None);
        }

        let job_id = self.next_job_id();
        node.busycnt_inc(kvset_cnt as u32);

        if matches!(action, Action::Spill) {
            node.rspill_enqueue(job_id);
        }

        for kvset in &inputs {
            kvset.mark_enlisted(job_id);
        }

        log::debug!(
            "compact_prepare job={job_id} node={nodeid} action={action:?} kvset_cnt={kvset_cnt} dgen=[{dgen_lo},{dgen_hi}]"
        );

        Ok(Some(Work {
            job_id,
            nodeid,
            action,
            kvset_cnt,
            dgen_lo,
            dgen_hi,
            compc,
            drop_tombstones,
            split_key,
            err: None,
            canceled: false,
            inputs,
            route_snapshot,
            output: None,
            split_left_nodeid: None,
        }))
    }

    /// Build (§4.F): runs the merge (or partition, for `Split`) off the
    /// tree lock, staging its output on `work`. Always returns `Ok(())`
    /// — a failed or cancelled build is recorded in `work.err` so
    /// `compact_finish` can still run Cleanup; an `Err` here means the
    /// node this job was prepared against is gone, a corruption that no
    /// amount of cleanup fixes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if `work`'s node vanished between
    /// Prepare and Build.
    pub fn compact_build(&self, work: &mut Work) -> crate::Result<()> {
        if self.is_cancel_requested() || self.kvdb_health.is_fatal() {
            work.err = Some(Error::Cancelled);
            work.canceled = true;
            return Ok(());
        }

        let result = match work.action {
            Action::CompactK | Action::CompactKv => self.build_compact(work),
            Action::Spill => self.build_spill(work),
            Action::Split => self.build_split(work),
        };

        if let Err(err) = result {
            work.err = Some(err);
        }

        Ok(())
    }

    fn build_compact(&self, work: &mut Work) -> crate::Result<()> {
        let items: Vec<KvsetItem> = Merger::new(work.inputs.iter().map(|k| Box::new(k.iter().cloned()) as BoxedIterator<'_>).collect())
            .dedup(work.drop_tombstones)
            .take_while(|_| !self.is_cancel_requested())
            .collect();

        work.output = Some(OutputSlot::Single(StagedOutput {
            dgen: work.dgen_hi,
            items,
        }));

        Ok(())
    }

    fn build_spill(&self, work: &mut Work) -> crate::Result<()> {
        let route = work
            .route_snapshot
            .as_ref()
            .ok_or_else(|| {
                debug_assert!(false, "spill work missing its route snapshot");
                Error::Corruption
            })?;

        let merged = Merger::new(work.inputs.iter().map(|k| Box::new(k.iter().cloned()) as BoxedIterator<'_>).collect())
            .dedup(false)
            .take_while(|_| !self.is_cancel_requested());

        let mut by_dest: Vec<(NodeId, StagedOutput)> = Vec::new();

        for item in merged {
            let Some(dest) = route.lookup(&item.key) else {
                debug_assert!(false, "spill item routes to no leaf: {:?}", item.key);
                log::error!("spill job {} dropped item routing to no leaf", work.job_id);
                continue;
            };

            match by_dest.iter_mut().find(|(id, _)| *id == dest) {
                Some((_, staged)) => staged.items.push(item),
                None => by_dest.push((dest, StagedOutput { dgen: 0, items: vec![item] })),
            }
        }

        work.output = Some(OutputSlot::Spill(by_dest));

        Ok(())
    }

    fn build_split(&self, work: &mut Work) -> crate::Result<()> {
        let split_key = work.split_key.clone().ok_or_else(|| {
            debug_assert!(false, "split work missing its split key");
            Error::Corruption
        })?;

        let mut left = Vec::with_capacity(work.inputs.len());
        let mut right = Vec::with_capacity(work.inputs.len());

        for kvset in &work.inputs {
            if self.is_cancel_requested() {
                return Err(Error::Cancelled);
            }

            let (left_items, right_items) = kvset.partition_at(&split_key);

            if !left_items.is_empty() {
                left.push(StagedOutput {
                    dgen: kvset.dgen,
                    items: left_items,
                });
            }
            if !right_items.is_empty() {
                right.push(StagedOutput {
                    dgen: kvset.dgen,
                    items: right_items,
                });
            }
        }

        work.output = Some(OutputSlot::Split { left, right });

        Ok(())
    }

    /// Assembles the list of `(destination, dgen, items)` triples Commit
    /// must turn into kvsets, minting the fresh ids each action needs
    /// (a single dgen for every `Spill` destination, a single new leaf
    /// id for `Split`'s left half). Empty staged outputs are dropped —
    /// an all-shadowed merge or an empty split half produces no kvset.
    fn stage_outputs(&self, work: &mut Work) -> Vec<(NodeId, u64, Vec<KvsetItem>)> {
        match work.output.take() {
            None => Vec::new(),

            Some(OutputSlot::Single(staged)) => {
                if staged.items.is_empty() {
                    Vec::new()
                } else {
                    vec![(work.nodeid, staged.dgen, staged.items)]
                }
            }

            Some(OutputSlot::Spill(by_dest)) => {
                let nonempty: Vec<_> = by_dest.into_iter().filter(|(_, s)| !s.items.is_empty()).collect();
                if nonempty.is_empty() {
                    return Vec::new();
                }
                let dgen = self.next_dgen();
                nonempty.into_iter().map(|(dest, s)| (dest, dgen, s.items)).collect()
            }

            Some(OutputSlot::Split { left, right }) => {
                let mut out = Vec::with_capacity(left.len() + right.len());

                if !left.is_empty() {
                    let left_nodeid = self.next_nodeid();
                    work.split_left_nodeid = Some(left_nodeid);
                    for staged in left {
                        out.push((left_nodeid, staged.dgen, staged.items));
                    }
                }

                for staged in right {
                    out.push((work.nodeid, staged.dgen, staged.items));
                }

                out
            }
        }
    }

    /// Commit (§4.F): stages outputs, opens an MDJ transaction covering
    /// every add/delete, assigns compc per output, commits mblocks, and
    /// acks. Naks the transaction and propagates on any collaborator
    /// failure.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Journal`] or [`Error::NoSpace`] from the
    /// metadata journal / media pool.
    fn compact_commit(&self, work: &mut Work) -> crate::Result<Vec<PreparedOutput>> {
        let raw_outputs = self.stage_outputs(work);

        let n_add = u32::try_from(raw_outputs.len()).unwrap_or(u32::MAX);
        let n_del = u32::try_from(work.inputs.len()).unwrap_or(u32::MAX);

        let txn = self.journal.txstart(self.cnid, 0, work.dgen_hi, n_add, n_del)?;

        let commit_result = self.compact_commit_inner(work, txn, raw_outputs);

        match commit_result {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                if let Err(nak_err) = self.journal.nak(txn) {
                    log::error!("compact_commit: nak after failure also failed: {nak_err}");
                }
                Err(err)
            }
        }
    }

    fn compact_commit_inner(
        &self,
        work: &Work,
        txn: crate::collab::journal::Txn,
        raw_outputs: Vec<(NodeId, u64, Vec<KvsetItem>)>,
    ) -> crate::Result<Vec<PreparedOutput>> {
        for kvset in &work.inputs {
            self.journal.record_kvset_delete(txn, kvset.kvset_id)?;
        }

        let mut prepared = Vec::with_capacity(raw_outputs.len());
        let mut cookies = Vec::with_capacity(raw_outputs.len());
        let mut kvset_ids = Vec::with_capacity(raw_outputs.len());

        for (dest, dgen, items) in raw_outputs {
            let kvset_id = self.next_kvset_id();
            let compc = self.assign_compc(work, dest, &items);

            let cookie = self.journal.record_kvset_add(
                txn,
                self.cnid,
                dest,
                &KvsetMeta { kvset_id, dgen, compc },
            )?;

            let kvset = Builder::new()
                .extend(items)
                .build(kvset_id, dgen, compc, self.create_params.hll_precision);

            kvset_ids.push(kvset_id);
            cookies.push(cookie);
            prepared.push(PreparedOutput { nodeid: dest, kvset: Arc::new(kvset) });
        }

        self.media_pool.commit_mblocks(&kvset_ids)?;

        for cookie in cookies {
            self.journal.record_kvset_add_ack(txn, cookie)?;
        }

        Ok(prepared)
    }

    /// compc rule (§4.F): a `Spill` output seeds `compc = 7` only if the
    /// destination leaf was empty before this spill and the output
    /// itself looks large (more than two key-blocks, or more than 32
    /// value-blocks, by the same proxy `Kvset::from_items` uses). Every
    /// other output inherits `work.compc + 1`.
    ///
    /// Prepare always selects a node's oldest kvsets, so a committed
    /// output never has a surviving older neighbor to cap against — the
    /// "older neighbor" capping the compc rule otherwise calls for
    /// cannot trigger under this selection policy (see `DESIGN.md`).
    fn assign_compc(&self, work: &Work, dest: NodeId, items: &[KvsetItem]) -> u32 {
        match work.action {
            Action::Spill => {
                let freshly_empty = {
                    let state = self.state.read().expect("lock is poisoned");
                    state.find_node(dest).is_none_or(|n| n.kvsets.is_empty())
                };

                let kblks = items.len().div_ceil(4).max(1);
                let valen: usize = items.iter().filter_map(|i| i.value.as_ref().map(|v| v.len())).sum();
                let vblks = valen.div_ceil(4096);
                let looks_large = kblks > 2 || vblks > 32;

                if freshly_empty && looks_large {
                    7
                } else {
                    0
                }
            }
            Action::CompactK | Action::CompactKv | Action::Split => work.compc.saturating_add(1),
        }
    }

    /// Apply (§4.F): splices committed outputs into the live tree under
    /// the write lock, updates sampling, and returns the retired inputs
    /// plus the ids of every node whose `cgen` advanced.
    fn compact_apply(&self, work: &mut Work, prepared: Vec<PreparedOutput>) -> crate::Result<(Vec<Arc<Kvset>>, Vec<NodeId>)> {
        match work.action {
            Action::CompactK | Action::CompactKv => self.apply_compact(work, prepared),
            Action::Spill => self.apply_spill(work, prepared),
            Action::Split => self.apply_split(work, prepared),
        }
    }

    fn apply_compact(&self, work: &Work, prepared: Vec<PreparedOutput>) -> crate::Result<(Vec<Arc<Kvset>>, Vec<NodeId>)> {
        let hll = self.create_params.hll_precision;
        let mut state = self.state.write().expect("lock is poisoned");

        let node = state.find_node_mut(work.nodeid).ok_or(Error::Corruption)?;
        let pre = node.samp;

        let start = node.kvsets.len().saturating_sub(work.kvset_cnt);
        let retired: Vec<Arc<Kvset>> = node.kvsets.drain(start..).collect();
        node.cgen += 1;

        if let Some(output) = prepared.into_iter().next() {
            node.insert_kvset(output.kvset)?;
        }

        sampling::update_compact(node, hll);
        let post = node.samp;
        state.samp.add_delta(&post.delta_from(&pre));

        Ok((retired, vec![work.nodeid]))
    }

    fn apply_spill(&self, work: &Work, prepared: Vec<PreparedOutput>) -> crate::Result<(Vec<Arc<Kvset>>, Vec<NodeId>)> {
        let hll = self.create_params.hll_precision;
        let mut state = self.state.write().expect("lock is poisoned");

        let mut touched = Vec::new();
        for output in prepared {
            let node = state.find_node_mut(output.nodeid).ok_or(Error::Corruption)?;
            node.insert_kvset(output.kvset)?;
            touched.push(output.nodeid);
        }

        let retired = {
            let root = state.root_mut();
            let pre = root.samp;
            let start = root.kvsets.len().saturating_sub(work.kvset_cnt);
            let retired: Vec<Arc<Kvset>> = root.kvsets.drain(start..).collect();
            root.cgen += 1;

            sampling::update_compact(root, hll);
            let post = root.samp;
            (retired, post.delta_from(&pre))
        };
        state.samp.add_delta(&retired.1);

        for &nodeid in &touched {
            let Some(leaf) = state.find_node_mut(nodeid) else { continue };
            let pre = leaf.samp;
            let _ = sampling::update_ingest(leaf);
            let post = leaf.samp;
            state.samp.add_delta(&post.delta_from(&pre));
        }

        touched.push(0);
        Ok((retired.0, touched))
    }

    fn apply_split(&self, work: &mut Work, prepared: Vec<PreparedOutput>) -> crate::Result<(Vec<Arc<Kvset>>, Vec<NodeId>)> {
        let hll = self.create_params.hll_precision;

        let (right_edge_key, right_max_before, right_islast) = {
            let state = self.state.read().expect("lock is poisoned");
            let right = state.find_node(work.nodeid).ok_or(Error::Corruption)?;
            let edge = right.route_node.clone();
            let islast = edge.as_ref().is_some_and(|e| state.route_map.islast(e));
            (edge, right.get_max_key(), islast)
        };

        let mut state = self.state.write().expect("lock is poisoned");

        if prepared.is_empty() {
            // Both halves of the split came back empty (every input
            // item vanished). Treat as a no-op: the inputs still
            // retire, but no new structure is created or removed.
            debug_assert!(false, "split job {} produced no output on either side", work.job_id);
            log::warn!("split job {} produced no outputs; treating as a no-op retirement", work.job_id);

            let right = state.find_node_mut(work.nodeid).ok_or(Error::Corruption)?;
            let pre = right.samp;
            let retired: Vec<Arc<Kvset>> = right.kvsets.drain(..).collect();
            right.cgen += 1;
            sampling::update_compact(right, hll);
            let post = right.samp;
            state.samp.add_delta(&post.delta_from(&pre));

            return Ok((retired, vec![work.nodeid]));
        }

        let pre_right = state.find_node(work.nodeid).ok_or(Error::Corruption)?.samp;
        let retired: Vec<Arc<Kvset>> = {
            let right = state.find_node_mut(work.nodeid).ok_or(Error::Corruption)?;
            let retired = right.kvsets.drain(..).collect();
            right.cgen += 1;
            retired
        };

        let mut changed = Vec::new();

        if let Some(left_nodeid) = work.split_left_nodeid {
            let split_key = work.split_key.clone().expect("split work always carries a split key");
            let mut left_node = Node::new(left_nodeid, false, Some(split_key.clone()));

            for output in &prepared {
                if output.nodeid == left_nodeid {
                    left_node.insert_kvset(Arc::clone(&output.kvset))?;
                }
            }

            sampling::update_compact(&mut left_node, hll);
            state.samp.add_delta(&left_node.samp);
            state.route_map.insert(split_key, left_nodeid)?;
            state.nodes.push(left_node);
            changed.push(left_nodeid);
        }

        {
            let right = state.find_node_mut(work.nodeid).ok_or(Error::Corruption)?;
            for output in &prepared {
                if output.nodeid == work.nodeid {
                    right.insert_kvset(Arc::clone(&output.kvset))?;
                }
            }
            sampling::update_compact(right, hll);
            let post = right.samp;
            state.samp.add_delta(&post.delta_from(&pre_right));
        }

        // Edge-key fixup corner case (§4.F Apply/SPLIT): if right was
        // the last leaf and the split key fell at or before its old
        // edge-key, the edge-key must be rewritten to right's pre-split
        // max key or the route map would stop covering right's tail.
        if right_islast {
            if let (Some(edge), Some(split_key), Some(max_before)) =
                (&right_edge_key, work.split_key.as_ref(), right_max_before.as_ref())
            {
                if split_key.as_ref() <= edge.as_ref() {
                    state.route_map.key_modify(edge, max_before.clone());
                    if let Some(right) = state.find_node_mut(work.nodeid) {
                        right.route_node = Some(max_before.clone());
                    }
                }
            }
        }

        changed.push(work.nodeid);
        Ok((retired, changed))
    }

    /// Retire (§4.F): advises the media pool to delete each retired
    /// kvset's mblocks and clears its enlistment marker. Best-effort —
    /// a delete failure here doesn't undo an already-applied commit, it
    /// just leaves physical reclamation for a later pass.
    fn compact_retire(&self, retired: &[Arc<Kvset>]) {
        for kvset in retired {
            if let Err(err) = self.media_pool.delete_mblocks(&[kvset.kvset_id]) {
                log::error!("compact_retire: delete_mblocks failed for kvset {}: {err}", kvset.kvset_id);
            }
            kvset.clear_enlisted();
        }
    }

    /// Release (§4.F): unconditional cleanup run whether or not
    /// Commit/Apply succeeded — clears every input's enlistment marker,
    /// decrements the node's busycnt, and (for non-spills) releases the
    /// compaction token.
    fn compact_cleanup(&self, work: &Work) {
        for kvset in &work.inputs {
            kvset.clear_enlisted();
        }

        let state = self.state.read().expect("lock is poisoned");
        if let Some(node) = state.find_node(work.nodeid) {
            node.busycnt_dec(work.kvset_cnt as u32);
            if !matches!(work.action, Action::Spill) {
                node.compact_token_release();
            }
        }
    }

    fn compact_finish_one(&self, mut work: Work) -> crate::Result<()> {
        if work.err.is_none() {
            match self.compact_commit(&mut work) {
                Ok(prepared) => match self.compact_apply(&mut work, prepared) {
                    Ok((retired, changed)) => {
                        self.compact_cleanup(&work);
                        self.compact_retire(&retired);
                        for nodeid in changed {
                            self.scheduler.notify_cgen(nodeid);
                        }
                    }
                    Err(err) => {
                        work.err = Some(err);
                        self.compact_cleanup(&work);
                    }
                },
                Err(err) => {
                    work.err = Some(err);
                    self.compact_cleanup(&work);
                }
            }
        } else {
            self.compact_cleanup(&work);
        }

        match &work.err {
            None => {}
            Some(Error::Cancelled) => log::debug!("compaction job {} cancelled", work.job_id),
            Some(err) => {
                self.kvdb_health.set_error(err);
                if matches!(err, Error::NoSpace) {
                    self.set_nospace();
                }
                log::error!("compaction job {} failed: {err}", work.job_id);
            }
        }

        match work.err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Finish (§4.F): runs Commit -> Apply -> Retire -> Release. For
    /// `Spill`, additionally enforces root-spill commit ordering (§5):
    /// the job marks itself done on the root's `rspills` FIFO, then
    /// this (or any other) thread drains every contiguous done-and-
    /// head-of-queue spill. A spill whose Apply fails wedges the root,
    /// so every spill still queued behind it inherits cancellation
    /// rather than racing ahead of a now-inconsistent root.
    ///
    /// # Errors
    ///
    /// Propagates the first job failure encountered while draining.
    pub fn compact_finish(&self, work: Work) -> crate::Result<()> {
        if !matches!(work.action, Action::Spill) {
            return self.compact_finish_one(work);
        }

        self.spill_finish(work)
    }

    fn spill_finish(&self, work: Work) -> crate::Result<()> {
        let root_nodeid = work.nodeid;
        let job_id = work.job_id;

        self.pending_spills.lock().expect("lock is poisoned").insert(job_id, work);

        {
            let state = self.state.read().expect("lock is poisoned");
            if let Some(root) = state.find_node(root_nodeid) {
                root.rspill_mark_done(job_id);
            }
        }

        let mut last_err = None;

        loop {
            let head_id = {
                let state = self.state.read().expect("lock is poisoned");
                let Some(root) = state.find_node(root_nodeid) else { break };
                root.rspill_try_claim_head()
            };

            let Some(head_id) = head_id else { break };

            let Some(mut head_work) = self.pending_spills.lock().expect("lock is poisoned").remove(&head_id) else {
                debug_assert!(false, "claimed rspill head {head_id} has no stashed work");
                log::error!("claimed rspill head {head_id} has no stashed work");
                continue;
            };

            let wedged = {
                let state = self.state.read().expect("lock is poisoned");
                state.find_node(root_nodeid).is_some_and(Node::is_wedged)
            };
            if wedged && head_work.err.is_none() {
                head_work.err = Some(Error::Wedged);
            }

            let result = self.compact_finish_one(head_work);

            {
                let state = self.state.read().expect("lock is poisoned");
                if let Some(root) = state.find_node(root_nodeid) {
                    if let Err(err) = root.rspill_remove_head(head_id) {
                        log::error!("rspill dequeue failed for job {head_id}: {err}");
                    }
                    if result.is_err() {
                        root.rspill_set_wedged();
                    }
                }
            }

            if let Err(err) = result {
                last_err = Some(err);
            }
        }

        match last_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Convenience wrapper running Prepare, Build, and Finish in one
    /// call on the current thread — useful for callers (and tests) that
    /// don't need the Build step off the tree lock. Returns `false` if
    /// Prepare found nothing to do.
    ///
    /// # Errors
    ///
    /// Propagates any error from Prepare or Finish.
    pub fn compact(&self, nodeid: NodeId, action: Action, kvset_cnt: usize, split_key: Option<UserKey>) -> crate::Result<bool> {
        let Some(mut work) = self.compact_prepare(nodeid, action, kvset_cnt, split_key)? else {
            return Ok(false);
        };

        self.compact_build(&mut work)?;
        self.compact_finish(work)?;

        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        collab::journal::InMemoryJournal,
        config::{CreateParams, RuntimeParams},
        kvset::builder::Builder,
        lookup::{LookupResult, QueryType},
    };
    use test_log::test;

    fn tree() -> Tree {
        Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(4), RuntimeParams::new())
    }

    fn ingest(tree: &Tree, items: Vec<KvsetItem>) {
        let kvset = Builder::new()
            .extend(items)
            .build(tree.next_kvset_id(), tree.next_dgen(), 0, tree.create_params.hll_precision);
        tree.ingest_update(Arc::new(kvset), None).unwrap();
    }

    #[test]
    fn compact_k_merges_and_shadows() {
        let tree = tree();
        ingest(&tree, vec![KvsetItem::new_value("k", "v1", 1)]);
        ingest(&tree, vec![KvsetItem::new_value("k", "v2", 2)]);

        assert_eq!(2, tree.state.read().unwrap().root().kvsets.len());

        let ran = tree.compact(0, Action::CompactK, 2, None).unwrap();
        assert!(ran);

        let root = tree.state.read().unwrap();
        assert_eq!(1, root.root().kvsets.len());
        drop(root);

        assert_eq!(
            LookupResult::FoundValue("v2".into()),
            tree.lookup(b"k", 10, QueryType::Get).unwrap()
        );
    }

    #[test]
    fn compact_k_drops_tombstone_at_tail() {
        let tree = tree();
        ingest(&tree, vec![KvsetItem::new_value("k", "v1", 1)]);
        ingest(&tree, vec![KvsetItem::new_tombstone("k", 2)]);

        tree.compact(0, Action::CompactK, 2, None).unwrap();

        assert_eq!(
            LookupResult::NotFound,
            tree.lookup(b"k", 10, QueryType::Get).unwrap()
        );
    }

    #[test]
    fn compact_prepare_refuses_concurrent_token() {
        let tree = tree();
        ingest(&tree, vec![KvsetItem::new_value("a", "1", 1)]);
        ingest(&tree, vec![KvsetItem::new_value("b", "2", 2)]);

        let first = tree.compact_prepare(0, Action::CompactK, 2, None).unwrap();
        assert!(first.is_some());

        let second = tree.compact_prepare(0, Action::CompactK, 2, None).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn split_partitions_by_key_and_fixes_up_last_edge() {
        let tree = tree();
        tree.load_node(1, UserKey::from("zzz")).unwrap();
        ingest(&tree, vec![]);

        {
            let mut state = tree.state.write().unwrap();
            let leaf = state.find_node_mut(1).unwrap();
            let kv = Builder::new()
                .add(KvsetItem::new_value("apple", "1", 1))
                .add(KvsetItem::new_value("mango", "2", 2))
                .add(KvsetItem::new_value("peach", "3", 3))
                .build(tree.next_kvset_id(), tree.next_dgen(), 0, 11);
            leaf.insert_kvset(Arc::new(kv)).unwrap();
        }

        let ran = tree.compact(1, Action::Split, 1, Some(UserKey::from("mango"))).unwrap();
        assert!(ran);

        let state = tree.state.read().unwrap();
        assert_eq!(3, state.nodes.len());
        assert!(state.route_map.islast(b"peach"));
        assert!(!state.route_map.islast(b"mango"));
        drop(state);

        assert_eq!(
            LookupResult::FoundValue("1".into()),
            tree.lookup(b"apple", 10, QueryType::Get).unwrap()
        );
        assert_eq!(
            LookupResult::FoundValue("3".into()),
            tree.lookup(b"peach", 10, QueryType::Get).unwrap()
        );
    }

    #[test]
    fn spill_partitions_root_kvsets_across_leaves() {
        let tree = tree();
        tree.load_node(1, UserKey::from("m")).unwrap();
        tree.load_node(2, UserKey::from("z")).unwrap();

        ingest(
            &tree,
            vec![KvsetItem::new_value("a", "1", 1), KvsetItem::new_value("n", "2", 2)],
        );

        let ran = tree.compact(0, Action::Spill, 1, None).unwrap();
        assert!(ran);

        assert_eq!(0, tree.state.read().unwrap().root().kvsets.len());
        assert_eq!(
            LookupResult::FoundValue("1".into()),
            tree.lookup(b"a", 10, QueryType::Get).unwrap()
        );
        assert_eq!(
            LookupResult::FoundValue("2".into()),
            tree.lookup(b"n", 10, QueryType::Get).unwrap()
        );
    }

    #[test]
    fn journal_failure_naks_and_marks_health() {
        let journal = Arc::new(InMemoryJournal::new());
        let tree = Tree::create(
            1,
            CreateParams::new(),
            RuntimeParams::new(),
            Arc::new(crate::collab::health::InMemoryHealth::new()),
            Arc::new(crate::collab::media_pool::InMemoryMediaPool::new()),
            journal.clone(),
            Arc::new(crate::collab::scheduler::NullScheduler),
        );

        ingest(&tree, vec![KvsetItem::new_value("a", "1", 1)]);
        ingest(&tree, vec![KvsetItem::new_value("b", "2", 2)]);

        journal.fail_next_txstart();
        let err = tree.compact(0, Action::CompactK, 2, None).unwrap_err();
        assert!(matches!(err, Error::Journal));

        assert!(tree.kvdb_health.is_fatal());
        assert_eq!(2, tree.state.read().unwrap().root().kvsets.len());
        assert!(!tree.state.read().unwrap().root().is_compacting());
    }

    #[test]
    fn cancellation_short_circuits_build() {
        let tree = tree();
        ingest(&tree, vec![KvsetItem::new_value("a", "1", 1)]);
        ingest(&tree, vec![KvsetItem::new_value("b", "2", 2)]);

        tree.request_cancel();

        let err = tree.compact(0, Action::CompactK, 2, None).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(2, tree.state.read().unwrap().root().kvsets.len());
    }
}
