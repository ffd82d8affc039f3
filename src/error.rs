// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur while operating a cn tree.
#[derive(Debug)]
pub enum Error {
    /// Allocation failed (e.g. node alloc during split). The triggering
    /// operation aborts and leaves retired state untouched.
    OutOfMemory,

    /// Media pool commit or block allocation failed. The tree's `nospace`
    /// flag is set and health is signalled; the current job fails and
    /// subsequent scheduler work is expected to back off.
    NoSpace,

    /// The metadata journal rejected or failed a transaction. The job
    /// issues a `nak` and fails; health is marked.
    Journal,

    /// Shutdown was requested (`cancel_request`) while a job was in
    /// flight. Not a fault: callers should treat this as a normal
    /// teardown path, not log it as an error.
    Cancelled,

    /// A root-spill failure wedged the root; all subsequently queued
    /// spills on that root inherit cancellation.
    Wedged,

    /// An assertion-level invariant was violated (e.g. head-of-rspills
    /// mismatch at release, missing node id, duplicate dgen). Fatal in
    /// debug builds; logged and surfaced in release.
    Corruption,

    /// Ambient I/O fault from a collaborator (media pool, journal).
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "allocation failed"),
            Self::NoSpace => write!(f, "media pool out of space"),
            Self::Journal => write!(f, "metadata journal failure"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Wedged => write!(f, "root is wedged by a prior spill failure"),
            Self::Corruption => write!(f, "tree invariant violated"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Tree result.
pub type Result<T> = std::result::Result<T, Error>;
