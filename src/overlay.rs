//! Pending-task overlays.
//!
//! Every folder can carry a set of not-yet-uploaded mutations: directory
//! creations, file creations or modifications, and deletion tombstones. Each
//! directory query merges the committed rows from the metadata store with
//! this overlay to produce the effective view. The maps are plain ordered
//! containers; the global metadata lock serialises every access.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::store::{FileRow, FolderRow};
use crate::types::{DirEntry, FileStat, FsId};

/// Pending directory creation.
#[derive(Debug, Clone)]
pub struct MkDir {
    /// Id of the created (or moved-in) folder.
    pub folderid: FsId,
    pub ctime: i64,
    pub mtime: i64,
    pub subdircnt: u64,
}

/// Pending file creation or modification. A committed `fileid` means an
/// existing file moved here by rename; a pending one is backed by cache files
/// and a task row holding the base revision.
#[derive(Debug, Clone)]
pub struct Creat {
    pub fileid: FsId,
    pub new_file: bool,
}

/// The overlay of one folder.
#[derive(Debug, Default)]
pub struct FolderTasks {
    pub mkdirs: BTreeMap<String, MkDir>,
    pub creats: BTreeMap<String, Creat>,
    pub rmdirs: BTreeSet<String>,
    pub unlinks: BTreeSet<String>,
}

impl FolderTasks {
    pub fn is_empty(&self) -> bool {
        self.mkdirs.is_empty()
            && self.creats.is_empty()
            && self.rmdirs.is_empty()
            && self.unlinks.is_empty()
    }
}

/// All folder overlays, keyed by folder id.
#[derive(Default)]
pub struct OverlayStore {
    folders: HashMap<FsId, FolderTasks>,
}

impl OverlayStore {
    pub fn get(&self, folderid: FsId) -> Option<&FolderTasks> {
        self.folders.get(&folderid)
    }

    pub fn entry(&mut self, folderid: FsId) -> &mut FolderTasks {
        self.folders.entry(folderid).or_default()
    }

    pub fn find_mkdir(&self, folderid: FsId, name: &str) -> Option<&MkDir> {
        self.get(folderid).and_then(|t| t.mkdirs.get(name))
    }

    pub fn find_creat(&self, folderid: FsId, name: &str) -> Option<&Creat> {
        self.get(folderid).and_then(|t| t.creats.get(name))
    }

    pub fn has_rmdir(&self, folderid: FsId, name: &str) -> bool {
        self.get(folderid).map_or(false, |t| t.rmdirs.contains(name))
    }

    pub fn has_unlink(&self, folderid: FsId, name: &str) -> bool {
        self.get(folderid)
            .map_or(false, |t| t.unlinks.contains(name))
    }

    pub fn remove_creat(&mut self, folderid: FsId, name: &str) -> Option<Creat> {
        let cr = self.folders.get_mut(&folderid)?.creats.remove(name);
        self.prune(folderid);
        cr
    }

    pub fn remove_mkdir(&mut self, folderid: FsId, name: &str) -> Option<MkDir> {
        let mk = self.folders.get_mut(&folderid)?.mkdirs.remove(name);
        self.prune(folderid);
        mk
    }

    /// Drops empty overlay entries left behind by removals.
    pub fn prune(&mut self, folderid: FsId) {
        if self.folders.get(&folderid).is_some_and(|t| t.is_empty()) {
            self.folders.remove(&folderid);
        }
    }
}

/// Merges committed rows with a folder's pending tasks into the effective
/// directory listing.
///
/// Committed subfolders are suppressed by an rmdir tombstone or by a pending
/// mkdir of the same name (the mkdir supplies the entry instead); committed
/// files are suppressed by an unlink tombstone or substituted by a pending
/// creat. All mkdirs and creats are then emitted. `creat_stat` derives the
/// stat of a creat entry; returning `None` skips the entry.
pub fn merged_entries(
    tasks: Option<&FolderTasks>,
    folder_rows: &[FolderRow],
    file_rows: &[FileRow],
    mut creat_stat: impl FnMut(&str, &Creat) -> Option<FileStat>,
) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    for row in folder_rows {
        if let Some(t) = tasks {
            if t.rmdirs.contains(&row.name) || t.mkdirs.contains_key(&row.name) {
                continue;
            }
        }
        entries.push(DirEntry {
            name: row.name.clone(),
            stat: FileStat::folder(row.ctime, row.mtime, row.subdircnt),
        });
    }
    for row in file_rows {
        if let Some(t) = tasks {
            if t.unlinks.contains(&row.name) || t.creats.contains_key(&row.name) {
                continue;
            }
        }
        entries.push(DirEntry {
            name: row.name.clone(),
            stat: FileStat::file(row.size, row.ctime, row.mtime),
        });
    }
    if let Some(t) = tasks {
        for (name, mk) in &t.mkdirs {
            entries.push(DirEntry {
                name: name.clone(),
                stat: FileStat::folder(mk.ctime, mk.mtime, mk.subdircnt),
            });
        }
        for (name, cr) in &t.creats {
            if let Some(stat) = creat_stat(name, cr) {
                entries.push(DirEntry {
                    name: name.clone(),
                    stat,
                });
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Permissions;

    fn folder_row(name: &str) -> FolderRow {
        FolderRow {
            id: 10,
            name: name.to_string(),
            permissions: Permissions::ALL,
            ctime: 1,
            mtime: 2,
            subdircnt: 0,
        }
    }

    fn file_row(name: &str, size: u64) -> FileRow {
        FileRow {
            id: 20,
            name: name.to_string(),
            size,
            hash: 0,
            ctime: 1,
            mtime: 2,
        }
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn committed_rows_pass_through_without_tasks() {
        let entries = merged_entries(
            None,
            &[folder_row("d")],
            &[file_row("f", 9)],
            |_, _| None,
        );
        assert_eq!(names(&entries), vec!["d", "f"]);
    }

    #[test]
    fn tombstones_suppress_committed_rows() {
        let mut tasks = FolderTasks::default();
        tasks.rmdirs.insert("d".into());
        tasks.unlinks.insert("f".into());
        let entries = merged_entries(
            Some(&tasks),
            &[folder_row("d"), folder_row("keep")],
            &[file_row("f", 9)],
            |_, _| None,
        );
        assert_eq!(names(&entries), vec!["keep"]);
    }

    #[test]
    fn creat_substitutes_committed_file_metadata() {
        let mut tasks = FolderTasks::default();
        tasks.creats.insert(
            "f".into(),
            Creat {
                fileid: FsId::Pending(3),
                new_file: false,
            },
        );
        let entries = merged_entries(Some(&tasks), &[], &[file_row("f", 9)], |_, _| {
            Some(FileStat::file(123, 5, 6))
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stat.size, 123);
    }

    #[test]
    fn mkdir_wins_over_committed_folder_and_rmdir() {
        let mut tasks = FolderTasks::default();
        tasks.rmdirs.insert("d".into());
        tasks.mkdirs.insert(
            "d".into(),
            MkDir {
                folderid: FsId::Pending(4),
                ctime: 7,
                mtime: 8,
                subdircnt: 0,
            },
        );
        let entries = merged_entries(Some(&tasks), &[folder_row("d")], &[], |_, _| None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stat.ctime, 7);
    }

    #[test]
    fn unstatable_creat_is_skipped() {
        let mut tasks = FolderTasks::default();
        tasks.creats.insert(
            "gone".into(),
            Creat {
                fileid: FsId::Pending(5),
                new_file: true,
            },
        );
        let entries = merged_entries(Some(&tasks), &[], &[], |_, _| None);
        assert!(entries.is_empty());
    }
}
