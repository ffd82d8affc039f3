// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-kvset size/shape accounting (§4.D), summed across a node's
//! kvsets to drive sampling.

use std::ops::AddAssign;

/// Size/shape accounting for a single kvset, or the sum of a node's
/// kvsets (component B's `ns` field).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvsetStats {
    /// Number of distinct keys (prior to any cross-kvset dedup).
    pub total_keys: u64,

    /// Key bytes allocated on disk (includes key-block padding/overhead
    /// in the original; here a byte-accurate stand-in).
    pub kalen: u64,

    /// Key bytes actually written (payload only, no padding).
    pub kwlen: u64,

    /// Value bytes allocated on disk.
    pub valen: u64,

    /// Value bytes actually written.
    pub vwlen: u64,

    /// Head-block bytes allocated.
    pub halen: u64,

    /// Number of key-blocks.
    pub kblks: u32,

    /// Number of value-blocks.
    pub vblks: u32,

    /// Number of value-groups (used by [`crate::node::Node::scatter`]).
    pub vgroups: u32,
}

impl AddAssign for KvsetStats {
    fn add_assign(&mut self, rhs: Self) {
        self.total_keys += rhs.total_keys;
        self.kalen += rhs.kalen;
        self.kwlen += rhs.kwlen;
        self.valen += rhs.valen;
        self.vwlen += rhs.vwlen;
        self.halen += rhs.halen;
        self.kblks += rhs.kblks;
        self.vblks += rhs.vblks;
        self.vgroups += rhs.vgroups;
    }
}
