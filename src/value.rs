// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The key/value primitives every component shares: sequence numbers,
//! user keys/values, and the per-entry [`KvsetItem`] kvsets are built
//! from.

use crate::Slice;

/// A monotonically increasing sequence number.
pub type SeqNo = u64;

/// A user-supplied key.
pub type UserKey = Slice;

/// A user-supplied value.
pub type UserValue = Slice;

/// The kind of entry a kvset item represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// A live value.
    Value,

    /// A point tombstone for a single key.
    Tombstone,

    /// A prefix tombstone: deletes every key sharing the stored key as a
    /// prefix, as of `seqno`.
    PrefixTombstone,
}

/// A single key/value entry as stored inside a kvset, and as produced by
/// the k-way merge during compaction builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvsetItem {
    /// The entry's key.
    pub key: UserKey,

    /// The sequence number the entry was written at.
    pub seqno: SeqNo,

    /// What kind of entry this is.
    pub vtype: ValueType,

    /// The value, present only for [`ValueType::Value`].
    pub value: Option<UserValue>,
}

impl KvsetItem {
    /// Constructs a live value entry.
    #[must_use]
    pub fn new_value(key: impl Into<UserKey>, value: impl Into<UserValue>, seqno: SeqNo) -> Self {
        Self {
            key: key.into(),
            seqno,
            vtype: ValueType::Value,
            value: Some(value.into()),
        }
    }

    /// Constructs a point-tombstone entry.
    #[must_use]
    pub fn new_tombstone(key: impl Into<UserKey>, seqno: SeqNo) -> Self {
        Self {
            key: key.into(),
            seqno,
            vtype: ValueType::Tombstone,
            value: None,
        }
    }

    /// Constructs a prefix-tombstone entry.
    #[must_use]
    pub fn new_prefix_tombstone(prefix: impl Into<UserKey>, seqno: SeqNo) -> Self {
        Self {
            key: prefix.into(),
            seqno,
            vtype: ValueType::PrefixTombstone,
            value: None,
        }
    }

    /// Returns `true` if this entry is a tombstone of either kind.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.vtype, ValueType::Tombstone | ValueType::PrefixTombstone)
    }
}

impl Ord for KvsetItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Newest (highest seqno) first for equal keys, so a merge that
        // keeps the first occurrence of a key keeps the newest value.
        self.key
            .cmp(&other.key)
            .then_with(|| other.seqno.cmp(&self.seqno))
    }
}

impl PartialOrd for KvsetItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
