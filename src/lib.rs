// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A cN tree: the on-disk indexing core of a key-value storage engine.
//!
//! ##### NOTE
//!
//! > This crate implements the indexing structure only — a two-level
//! > root-plus-leaves tree, its concurrency protocol, and its compaction
//! > state machine. It does not ship a write-ahead log, a memtable, or a
//! > block cache: those are the media pool's, the journal's, and the
//! > caller's concerns, expressed here as collaborator traits (see
//! > [`collab`]).
//!
//! ##### About
//!
//! A tree is a root node plus a set of leaves, navigated through a
//! [`route_map::RouteMap`] keyed on each leaf's edge-key. Every node
//! holds an ordered list of immutable, sorted [`kvset::Kvset`] runs —
//! newest at the head, strictly decreasing `dgen` toward the tail.
//! Writers ingest new kvsets onto the root; readers descend root then
//! (if unresolved) the owning leaf, newest kvset first. A compaction
//! runtime (see [`compaction`]) merges, spills, and splits kvsets to
//! keep the structure from growing without bound, coordinated through a
//! tree-wide read-mostly lock plus per-node tokens (§5) rather than a
//! single global mutex.
//!
//! # Example usage
//!
//! ```
//! use cn_tree::{
//!     collab::{health::InMemoryHealth, job_runner::InlineJobRunner, journal::InMemoryJournal,
//!               media_pool::InMemoryMediaPool, scheduler::NullScheduler},
//!     compaction::Action,
//!     config::{CreateParams, RuntimeParams},
//!     kvset::builder::Builder,
//!     lookup::{LookupResult, QueryType},
//!     value::KvsetItem,
//!     Tree,
//! };
//! use std::sync::Arc;
//!
//! let tree = Tree::with_in_memory_collaborators(1, CreateParams::new().fanout(4), RuntimeParams::new());
//!
//! let kvset = Builder::new()
//!     .add(KvsetItem::new_value("my_key", "my_value", 0))
//!     .build(tree.next_kvset_id(), tree.next_dgen(), 0, 11);
//! tree.ingest_update(Arc::new(kvset), None)?;
//!
//! assert_eq!(
//!     LookupResult::FoundValue("my_value".into()),
//!     tree.lookup(b"my_key", 10, QueryType::Get)?,
//! );
//!
//! // Once enough kvsets have piled up on the root, fold them together.
//! tree.compact(0, Action::CompactK, 1, None)?;
//! # Ok::<(), cn_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod collab;
pub mod compaction;
pub mod config;
mod error;
mod hash;
pub mod hll;
pub mod kvset;
pub mod lookup;
pub mod merge;
pub mod node;
pub mod route_map;
pub mod sampling;
mod seqno;
mod slice;
pub mod tree;
pub mod value;

pub use {
    error::{Error, Result},
    seqno::SequenceNumberCounter,
    slice::Slice,
    tree::Tree,
    value::{SeqNo, UserKey, UserValue, ValueType},
};

#[doc(hidden)]
pub use merge::BoxedIterator;

/// KV-tuple, as produced by a [`tree::traversal::View`].
pub type KvPair = (UserKey, UserValue);
