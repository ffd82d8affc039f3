// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The metadata journal (MDJ): atomically records kvset add/delete
//! operations. Adds and deletes become visible atomically at ack of the
//! final add — the tree keeps no separate on-disk file of its own.

use crate::node::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque transaction handle, returned by [`MetadataJournal::txstart`]
/// and consumed by every subsequent call in the same transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Txn(pub u64);

/// An opaque cookie identifying one logged "add" within a transaction,
/// used to later ack it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddCookie(pub u64);

/// Minimal metadata describing a kvset being added, sufficient for the
/// journal to record it; real key-block/value-block layout is out of
/// scope (§1).
#[derive(Clone, Debug)]
pub struct KvsetMeta {
    /// The new kvset's id.
    pub kvset_id: u64,
    /// Its dgen.
    pub dgen: u64,
    /// Its assigned compc.
    pub compc: u32,
}

/// The metadata journal collaborator contract (§6).
pub trait MetadataJournal: std::fmt::Debug + Send + Sync {
    /// Starts a transaction for `cnid` covering `n_add` adds and
    /// `n_del` deletes at `ingestid`/`horizon`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Journal`] if the journal cannot start a
    /// transaction.
    fn txstart(
        &self,
        cnid: u64,
        ingestid: u64,
        horizon: u64,
        n_add: u32,
        n_del: u32,
    ) -> crate::Result<Txn>;

    /// Logs an `add` record for a new kvset, returning a cookie to ack
    /// once its mblocks are committed.
    fn record_kvset_add(
        &self,
        txn: Txn,
        cnid: u64,
        nodeid: NodeId,
        meta: &KvsetMeta,
    ) -> crate::Result<AddCookie>;

    /// Acks a previously logged add, making it durable.
    fn record_kvset_add_ack(&self, txn: Txn, cookie: AddCookie) -> crate::Result<()>;

    /// Logs a `delete` record for a retiring kvset.
    fn record_kvset_delete(&self, txn: Txn, kvset_id: u64) -> crate::Result<()>;

    /// Aborts the transaction; none of its adds/deletes become visible.
    fn nak(&self, txn: Txn) -> crate::Result<()>;
}

/// An in-memory [`MetadataJournal`] test double. Transactions always
/// succeed unless `fail_next_txstart`/`fail_next_commit` is armed.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    next_txn: AtomicU64,
    next_cookie: AtomicU64,
    fail_next_txstart: std::sync::atomic::AtomicBool,
    naks: std::sync::Mutex<Vec<Txn>>,
}

impl InMemoryJournal {
    /// Creates a fresh, always-succeeding test double.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot failure for the next `txstart` call, used by
    /// tests that simulate an MDJ commit failure (scenario 5, §8).
    pub fn fail_next_txstart(&self) {
        self.fail_next_txstart.store(true, Ordering::Release);
    }

    /// Transactions that were nak-ed, in order.
    #[must_use]
    pub fn naks(&self) -> Vec<Txn> {
        self.naks.lock().expect("lock is poisoned").clone()
    }
}

impl MetadataJournal for InMemoryJournal {
    fn txstart(
        &self,
        _cnid: u64,
        _ingestid: u64,
        _horizon: u64,
        _n_add: u32,
        _n_del: u32,
    ) -> crate::Result<Txn> {
        if self.fail_next_txstart.swap(false, Ordering::AcqRel) {
            return Err(crate::Error::Journal);
        }

        Ok(Txn(self.next_txn.fetch_add(1, Ordering::AcqRel)))
    }

    fn record_kvset_add(
        &self,
        _txn: Txn,
        _cnid: u64,
        _nodeid: NodeId,
        _meta: &KvsetMeta,
    ) -> crate::Result<AddCookie> {
        Ok(AddCookie(self.next_cookie.fetch_add(1, Ordering::AcqRel)))
    }

    fn record_kvset_add_ack(&self, _txn: Txn, _cookie: AddCookie) -> crate::Result<()> {
        Ok(())
    }

    fn record_kvset_delete(&self, _txn: Txn, _kvset_id: u64) -> crate::Result<()> {
        Ok(())
    }

    fn nak(&self, txn: Txn) -> crate::Result<()> {
        self.naks.lock().expect("lock is poisoned").push(txn);
        Ok(())
    }
}
