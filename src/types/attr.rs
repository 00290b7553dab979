//! Attribute structures returned to the kernel-facing layer.

/// Reported filesystem block size.
pub const FS_BLOCK_SIZE: u64 = 4096;
/// Largest single write the kernel is asked to send.
pub const FS_MAX_WRITE: u32 = 256 * 1024;
/// Reported name length limit.
pub const FS_NAME_MAX: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
}

/// Stat data for one entry, derived from a committed row, a pending task, or
/// the cache files of a modified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub nlink: u32,
    pub perm: u16,
}

impl FileStat {
    pub fn folder(ctime: i64, mtime: i64, subdircnt: u64) -> FileStat {
        FileStat {
            kind: FileKind::Directory,
            size: FS_BLOCK_SIZE,
            ctime,
            mtime,
            nlink: subdircnt as u32 + 2,
            perm: 0o755,
        }
    }

    pub fn file(size: u64, ctime: i64, mtime: i64) -> FileStat {
        FileStat {
            kind: FileKind::RegularFile,
            size,
            ctime,
            mtime,
            nlink: 1,
            perm: 0o644,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// Filesystem-wide characteristics reported by `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatVfs {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub name_max: u32,
    /// Mount flags; `ST_NOSUID` is always set.
    pub flags: u64,
}
