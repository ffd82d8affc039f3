// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The media pool collaborator (§6): allocates, commits, and deletes
//! fixed-size mblocks on behalf of committed kvsets. Out of scope to
//! implement for real (§1) — the tree only depends on this contract.

/// Advice passed to [`MediaPool::madvise`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Advice {
    /// The kernel should page this mblock out; it is unlikely to be
    /// accessed again soon (capped-kvs eviction, §4.H).
    DontNeed,
}

/// The block-layer / media pool: allocate, commit, and delete fixed-size
/// mblocks. Out of scope to implement for real (§1) — the tree only
/// depends on this contract.
pub trait MediaPool: std::fmt::Debug + Send + Sync {
    /// Commits a list of mblocks, making them durable and visible.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NoSpace`] if the pool is out of capacity.
    fn commit_mblocks(&self, mblock_ids: &[u64]) -> crate::Result<()>;

    /// Marks a list of mblocks for deletion.
    fn delete_mblocks(&self, mblock_ids: &[u64]) -> crate::Result<()>;

    /// Advises the kernel about future access patterns for an mblock.
    fn madvise(&self, mblock_id: u64, advice: Advice) -> crate::Result<()>;
}

/// An in-memory [`MediaPool`] test double: records calls, never fails.
#[derive(Debug, Default)]
pub struct InMemoryMediaPool {
    committed: std::sync::Mutex<Vec<u64>>,
    deleted: std::sync::Mutex<Vec<u64>>,
}

impl InMemoryMediaPool {
    /// Creates a fresh, empty test double.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// mblocks committed so far, in call order.
    #[must_use]
    pub fn committed(&self) -> Vec<u64> {
        self.committed.lock().expect("lock is poisoned").clone()
    }

    /// mblocks deleted so far, in call order.
    #[must_use]
    pub fn deleted(&self) -> Vec<u64> {
        self.deleted.lock().expect("lock is poisoned").clone()
    }
}

impl MediaPool for InMemoryMediaPool {
    fn commit_mblocks(&self, mblock_ids: &[u64]) -> crate::Result<()> {
        self.committed
            .lock()
            .expect("lock is poisoned")
            .extend_from_slice(mblock_ids);
        Ok(())
    }

    fn delete_mblocks(&self, mblock_ids: &[u64]) -> crate::Result<()> {
        self.deleted
            .lock()
            .expect("lock is poisoned")
            .extend_from_slice(mblock_ids);
        Ok(())
    }

    fn madvise(&self, _mblock_id: u64, _advice: Advice) -> crate::Result<()> {
        Ok(())
    }
}
