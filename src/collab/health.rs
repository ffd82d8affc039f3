// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The kvdb-wide health monitor collaborator (§6/§7): compaction
//! failures (`ENOMEM`, `ENOSPC`, MDJ failures) mark this fatal, except
//! benign shutdown (`Cancelled`).

use std::sync::atomic::{AtomicBool, Ordering};

/// The health-monitor contract.
pub trait KvdbHealth: std::fmt::Debug + Send + Sync {
    /// Records a fault observed while running a job. `Cancelled` is
    /// deliberately not treated as a fault by callers of this trait.
    fn set_error(&self, err: &crate::Error);

    /// `true` once a fault has been recorded.
    fn is_fatal(&self) -> bool;
}

/// An in-memory [`KvdbHealth`] test double.
#[derive(Debug, Default)]
pub struct InMemoryHealth {
    fatal: AtomicBool,
}

impl InMemoryHealth {
    /// Creates a fresh, healthy test double.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvdbHealth for InMemoryHealth {
    fn set_error(&self, err: &crate::Error) {
        log::error!("kvdb health: {err}");
        self.fatal.store(true, Ordering::Release);
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }
}
