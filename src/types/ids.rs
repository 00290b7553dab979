//! File and folder identifiers.
//!
//! The remote store hands out positive 64-bit ids for committed files and
//! folders. Anything that exists only as a pending task in the local task
//! store is identified by the task id instead, and the two spaces are kept
//! apart by the [`FsId`] tag. The ordering of `FsId` matches the signed
//! integer encoding the rest of the system uses on the wire: a pending id
//! behaves like the negated task id, so all pending ids sort before all
//! committed ones and pending ids with larger task ids sort first.

use std::cmp::Ordering;
use std::fmt;

/// Identifier of a pending task in the task store.
pub type TaskId = u64;

/// Identifier of a file or folder, committed or pending.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FsId {
    /// Known to the remote store.
    Committed(u64),
    /// Exists only as the task with this id.
    Pending(TaskId),
}

impl FsId {
    pub const ROOT: FsId = FsId::Committed(0);

    /// Decodes the signed wire form: non-negative means committed, negative
    /// means the task with the magnitude as id.
    pub fn from_raw(raw: i64) -> FsId {
        if raw >= 0 {
            FsId::Committed(raw as u64)
        } else {
            FsId::Pending(raw.unsigned_abs())
        }
    }

    /// The signed wire form.
    pub fn as_raw(self) -> i64 {
        match self {
            FsId::Committed(id) => id as i64,
            FsId::Pending(task) => -(task as i64),
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, FsId::Pending(_))
    }

    pub fn committed_id(self) -> Option<u64> {
        match self {
            FsId::Committed(id) => Some(id),
            FsId::Pending(_) => None,
        }
    }

    pub fn task_id(self) -> Option<TaskId> {
        match self {
            FsId::Committed(_) => None,
            FsId::Pending(task) => Some(task),
        }
    }

    /// Name of the sparse data file in the cache directory. Only pending ids
    /// have cache files.
    pub fn data_file_name(self) -> Option<String> {
        self.task_id().map(|t| format!("{:016x}d", t))
    }

    /// Name of the write-index file in the cache directory.
    pub fn index_file_name(self) -> Option<String> {
        self.task_id().map(|t| format!("{:016x}i", t))
    }
}

impl Ord for FsId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_raw().cmp(&other.as_raw())
    }
}

impl PartialOrd for FsId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}
