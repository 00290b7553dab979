//! Interfaces to the collaborators outside the core.
//!
//! The core consumes the metadata database, the task store, the settings
//! store, the page cache, the upload worker, and the timer only through the
//! traits in this module, so tests (and embedders) can wire in synthetic
//! implementations. [`MemoryDb`] is the map-backed metadata store used by the
//! test suite.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::openfile::OpenFile;
use crate::types::{FsResult, Permissions, TaskId};

/// Committed folder row.
#[derive(Debug, Clone)]
pub struct FolderRow {
    pub id: u64,
    pub name: String,
    pub permissions: Permissions,
    pub ctime: i64,
    pub mtime: i64,
    pub subdircnt: u64,
}

/// Committed file row.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub hash: u64,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
}

/// Row of the task store. `fileid`/`hash` name the base revision a modified
/// file diverges from; `writeid` is the last write the upload should cover.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: TaskId,
    pub fileid: u64,
    pub writeid: u64,
    pub hash: u64,
    pub status: TaskStatus,
}

/// Metadata database and task store, one session guarded by the metadata
/// lock.
pub trait MetaDb: Send + Sync {
    fn folder_by_id(&self, id: u64) -> Option<FolderRow>;
    fn folder_by_name(&self, parent: u64, name: &str) -> Option<FolderRow>;
    fn folders_in(&self, parent: u64) -> Vec<FolderRow>;
    fn file_by_id(&self, id: u64) -> Option<FileRow>;
    fn file_by_name(&self, parent: u64, name: &str) -> Option<FileRow>;
    fn files_in(&self, parent: u64) -> Vec<FileRow>;
    /// Size of one file revision, by `(fileid, hash)`.
    fn revision_size(&self, fileid: u64, hash: u64) -> Option<u64>;

    /// Allocates a pending task recording the base revision.
    fn create_task(&self, base_fileid: u64, base_hash: u64) -> TaskId;
    fn task(&self, id: TaskId) -> Option<TaskRow>;
    /// Marks a still-pending task ready for upload and records `writeid`.
    /// Returns false when the task was not in the pending state.
    fn mark_task_ready(&self, id: TaskId, writeid: u64) -> bool;
    /// Raises the recorded writeid if `writeid` is larger.
    fn raise_task_writeid(&self, id: TaskId, writeid: u64);
    fn drop_task(&self, id: TaskId);

    /// Makes the store durable.
    fn sync(&self) -> io::Result<()>;
}

/// Settings the core reads.
pub trait SettingsStore: Send + Sync {
    fn quota(&self) -> u64;
    fn used_quota(&self) -> u64;
    /// Flat directory holding the per-pending-file cache pairs.
    fn cache_path(&self) -> PathBuf;
    fn mount_root(&self) -> PathBuf;
}

/// Remote-backed page cache. Entry points take the record unlocked, acquire
/// the per-record lock internally, and may pin the record across blocking
/// reads with the reader reference operations.
pub trait PageCache: Send + Sync {
    /// Read from a clean record: every byte comes from the base revision.
    fn read_unmodified(&self, of: &Arc<OpenFile>, size: usize, offset: u64) -> FsResult<Vec<u8>>;
    /// Read from a modified record: locally authoritative ranges come from
    /// the data file, the rest from the base revision.
    fn read_modified(&self, of: &Arc<OpenFile>, size: usize, offset: u64) -> FsResult<Vec<u8>>;
    /// Drops whatever is droppable; called on unmount.
    fn flush(&self) -> FsResult<()>;
}

/// Handle to the upload worker pool.
pub trait UploadWaker: Send + Sync {
    /// A task became ready; pick it up.
    fn wake(&self);
}

/// Second-granularity time source for the read-speed estimator.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Map-backed [`MetaDb`] for tests and synthetic setups.
#[derive(Default)]
pub struct MemoryDb {
    inner: Mutex<DbState>,
}

#[derive(Default)]
struct DbState {
    folders: BTreeMap<u64, (u64, FolderRow)>,
    files: BTreeMap<u64, (u64, FileRow)>,
    revisions: HashMap<(u64, u64), u64>,
    tasks: BTreeMap<TaskId, TaskRow>,
    next_folder: u64,
    next_file: u64,
    next_task: TaskId,
}

impl MemoryDb {
    /// An empty store whose root folder (id 0) carries `root_permissions`.
    pub fn new(root_permissions: Permissions) -> MemoryDb {
        let db = MemoryDb::default();
        {
            let mut state = db.inner.lock().unwrap();
            state.folders.insert(
                0,
                (
                    0,
                    FolderRow {
                        id: 0,
                        name: String::new(),
                        permissions: root_permissions,
                        ctime: 0,
                        mtime: 0,
                        subdircnt: 0,
                    },
                ),
            );
            state.next_folder = 1;
            state.next_file = 1;
            state.next_task = 1;
        }
        db
    }

    /// Seeds a committed folder and returns its id.
    pub fn add_folder(
        &self,
        parent: u64,
        name: &str,
        permissions: Permissions,
        ctime: i64,
        mtime: i64,
    ) -> u64 {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_folder;
        state.next_folder += 1;
        state.folders.insert(
            id,
            (
                parent,
                FolderRow {
                    id,
                    name: name.to_string(),
                    permissions,
                    ctime,
                    mtime,
                    subdircnt: 0,
                },
            ),
        );
        if let Some((_, row)) = state.folders.get_mut(&parent) {
            row.subdircnt += 1;
        }
        id
    }

    /// Seeds a committed file (and its revision row) and returns its id.
    pub fn add_file(
        &self,
        parent: u64,
        name: &str,
        size: u64,
        hash: u64,
        ctime: i64,
        mtime: i64,
    ) -> u64 {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_file;
        state.next_file += 1;
        state.files.insert(
            id,
            (
                parent,
                FileRow {
                    id,
                    name: name.to_string(),
                    size,
                    hash,
                    ctime,
                    mtime,
                },
            ),
        );
        state.revisions.insert((id, hash), size);
        id
    }
}

impl MetaDb for MemoryDb {
    fn folder_by_id(&self, id: u64) -> Option<FolderRow> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .get(&id)
            .map(|(_, row)| row.clone())
    }

    fn folder_by_name(&self, parent: u64, name: &str) -> Option<FolderRow> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .values()
            .find(|(p, row)| *p == parent && row.name == name)
            .map(|(_, row)| row.clone())
    }

    fn folders_in(&self, parent: u64) -> Vec<FolderRow> {
        self.inner
            .lock()
            .unwrap()
            .folders
            .values()
            .filter(|(p, row)| *p == parent && row.id != 0)
            .map(|(_, row)| row.clone())
            .collect()
    }

    fn file_by_id(&self, id: u64) -> Option<FileRow> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(&id)
            .map(|(_, row)| row.clone())
    }

    fn file_by_name(&self, parent: u64, name: &str) -> Option<FileRow> {
        self.inner
            .lock()
            .unwrap()
            .files
            .values()
            .find(|(p, row)| *p == parent && row.name == name)
            .map(|(_, row)| row.clone())
    }

    fn files_in(&self, parent: u64) -> Vec<FileRow> {
        self.inner
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|(p, _)| *p == parent)
            .map(|(_, row)| row.clone())
            .collect()
    }

    fn revision_size(&self, fileid: u64, hash: u64) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .revisions
            .get(&(fileid, hash))
            .copied()
    }

    fn create_task(&self, base_fileid: u64, base_hash: u64) -> TaskId {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_task;
        state.next_task += 1;
        state.tasks.insert(
            id,
            TaskRow {
                id,
                fileid: base_fileid,
                writeid: 0,
                hash: base_hash,
                status: TaskStatus::Pending,
            },
        );
        id
    }

    fn task(&self, id: TaskId) -> Option<TaskRow> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }

    fn mark_task_ready(&self, id: TaskId, writeid: u64) -> bool {
        let mut state = self.inner.lock().unwrap();
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Ready;
                task.writeid = writeid;
                true
            }
            _ => false,
        }
    }

    fn raise_task_writeid(&self, id: TaskId, writeid: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(&id) {
            if task.writeid < writeid {
                task.writeid = writeid;
            }
        }
    }

    fn drop_task(&self, id: TaskId) {
        self.inner.lock().unwrap().tasks.remove(&id);
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
