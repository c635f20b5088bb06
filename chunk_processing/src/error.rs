//! Contract violations reported by the locking and traversal APIs.
//!
//! These are caller bugs. They are logged and returned instead of aborting so
//! a locking mistake in tooling code can't take the editor down with it.

use std::error::Error;
use std::fmt;

use super::ChunkId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkError {
    /// Unlock or erase of a chunk that this table or holder does not have locked.
    NotLocked(ChunkId),
    /// Locking a chunk that is neither loaded nor loading.
    NotResident(ChunkId),
    /// A chunk-graph operation was called off the main thread.
    NotMainThread,
}

pub type Result<T> = ::std::result::Result<T, ChunkError>;

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ChunkError::NotLocked(id) => write!(f, "chunk {} is not locked", id),
            ChunkError::NotResident(id) => {
                write!(f, "chunk {} must be loaded or loading to be locked", id)
            }
            ChunkError::NotMainThread => {
                write!(f, "chunk graph traversal must run on the main thread")
            }
        }
    }
}

impl Error for ChunkError {}
