// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builder-style configuration for a [`crate::tree::Tree`].

/// Smallest fanout a tree may be created with.
pub const FANOUT_MIN: u32 = 2;

/// Largest fanout a tree may be created with.
pub const FANOUT_MAX: u32 = 32;

/// Largest key-prefix length a tree may be created with.
pub const PFX_LEN_MAX: u8 = 32;

/// Default register count exponent for a node's HLL sketch (2^11 registers).
pub const DEFAULT_HLL_PRECISION: u8 = 11;

/// Creation-time parameters for a tree, fixed for its lifetime.
///
/// A builder: every setter consumes and returns `Self` so trees are
/// assembled fluently, e.g.
/// `CreateParams::new().fanout(16).prefix_len(4).open()`.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// Number of leaves the route map is pre-sized for.
    pub fanout: u32,

    /// Length, in bytes, of the key prefix used for prefix tombstones
    /// and `PROBE_PFX` lookups. Zero disables prefix semantics.
    pub prefix_len: u8,

    /// Length, in bytes, of the key suffix appended after the prefix
    /// (opaque to the tree; carried for kvset key layout purposes).
    pub suffix_len: u8,

    /// Whether this tree runs capped-kvs TTL trimming (§4.H).
    pub capped: bool,

    /// HLL register-count exponent (registers = `2^precision`).
    pub hll_precision: u8,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            fanout: 16,
            prefix_len: 0,
            suffix_len: 0,
            capped: false,
            hll_precision: DEFAULT_HLL_PRECISION,
        }
    }
}

impl CreateParams {
    /// Initializes a new set of create-params with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fanout (number of leaves the route map is sized for).
    ///
    /// # Panics
    ///
    /// Panics if `n` is outside `[FANOUT_MIN, FANOUT_MAX]`.
    #[must_use]
    pub fn fanout(mut self, n: u32) -> Self {
        assert!((FANOUT_MIN..=FANOUT_MAX).contains(&n), "invalid fanout");

        self.fanout = n;
        self
    }

    /// Sets the key-prefix length used for prefix tombstones.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds `PFX_LEN_MAX`.
    #[must_use]
    pub fn prefix_len(mut self, n: u8) -> Self {
        assert!(n <= PFX_LEN_MAX, "prefix length too large");

        self.prefix_len = n;
        self
    }

    /// Sets the key-suffix length.
    #[must_use]
    pub fn suffix_len(mut self, n: u8) -> Self {
        self.suffix_len = n;
        self
    }

    /// Marks the tree as capped, enabling capped-kvs TTL trimming.
    #[must_use]
    pub fn capped(mut self, capped: bool) -> Self {
        self.capped = capped;
        self
    }

    /// Sets the HLL register-count exponent (registers = `2^precision`).
    ///
    /// Defaults to 11 (2048 registers).
    #[must_use]
    pub fn hll_precision(mut self, precision: u8) -> Self {
        self.hll_precision = precision;
        self
    }
}

/// Runtime parameters for a tree. Unlike [`CreateParams`] these may be
/// adjusted across the tree's lifetime (e.g. via a config reload), so a
/// runtime params set is cloned into the tree rather than consumed once.
#[derive(Clone, Debug)]
pub struct RuntimeParams {
    /// Number of oldest root kvsets a single `SPILL` reads at once.
    pub spill_kvset_cnt: u32,

    /// Interior nodes yield the tree lock after visiting this many
    /// nodes during a traversal (see §4.I).
    pub view_yield_interval: u32,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            spill_kvset_cnt: 4,
            view_yield_interval: 16,
        }
    }
}

impl RuntimeParams {
    /// Initializes a new set of runtime params with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many oldest root kvsets a single `SPILL` reads at once.
    #[must_use]
    pub fn spill_kvset_cnt(mut self, n: u32) -> Self {
        self.spill_kvset_cnt = n;
        self
    }

    /// Sets the traversal lock-yield interval (nodes visited per
    /// lock acquisition during `preorder_walk`).
    #[must_use]
    pub fn view_yield_interval(mut self, n: u32) -> Self {
        self.view_yield_interval = n;
        self
    }
}
