//! The filesystem operation layer.
//!
//! [`NimbusFs`] answers every kernel-facing operation from three sources: the
//! committed rows of the metadata store, the pending-task overlays, and the
//! registry of open-file records. Path operations resolve through the first
//! two; handle operations go straight to a record.
//!
//! Locking: the global metadata lock guards the registry, the overlays, and
//! the metadata session. The per-record lock guards one record's state and
//! nests inside the metadata lock. The clean-to-modified transition inside
//! `write` is the only place the order inverts, handled with a non-blocking
//! acquire and a re-check after reacquisition.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::openfile::{OpenFile, OpenFileState};
use crate::overlay::{Creat, MkDir, OverlayStore};
use crate::paths::{self, FsPath};
use crate::registry::OpenFileRegistry;
use crate::sparse;
use crate::store::{Clock, MetaDb, PageCache, SettingsStore, SystemClock, UploadWaker};
use crate::types::{
    DirEntry, FileStat, FsError, FsId, FsResult, OpenFlags, Permissions, StatVfs, TaskId,
    FS_BLOCK_SIZE, FS_NAME_MAX,
};

/// State behind the global metadata lock.
struct MetaState {
    registry: OpenFileRegistry,
    overlays: OverlayStore,
}

/// Destination of a rename after overlay-aware resolution. A `None` name
/// means "into an existing folder, keeping the source name".
struct RenameTarget {
    folderid: FsId,
    permissions: Permissions,
    name: Option<String>,
}

pub struct NimbusFs {
    meta: Mutex<MetaState>,
    db: Arc<dyn MetaDb>,
    settings: Arc<dyn SettingsStore>,
    pagecache: Arc<dyn PageCache>,
    uploads: Arc<dyn UploadWaker>,
    clock: Arc<dyn Clock>,
}

impl NimbusFs {
    pub fn new(
        db: Arc<dyn MetaDb>,
        settings: Arc<dyn SettingsStore>,
        pagecache: Arc<dyn PageCache>,
        uploads: Arc<dyn UploadWaker>,
    ) -> NimbusFs {
        Self::with_clock(db, settings, pagecache, uploads, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: Arc<dyn MetaDb>,
        settings: Arc<dyn SettingsStore>,
        pagecache: Arc<dyn PageCache>,
        uploads: Arc<dyn UploadWaker>,
        clock: Arc<dyn Clock>,
    ) -> NimbusFs {
        NimbusFs {
            meta: Mutex::new(MetaState {
                registry: OpenFileRegistry::default(),
                overlays: OverlayStore::default(),
            }),
            db,
            settings,
            pagecache,
            uploads,
            clock,
        }
    }

    // ---- path operations -------------------------------------------------

    pub fn getattr(&self, path: &str) -> FsResult<FileStat> {
        if paths::is_root(path) {
            return Ok(self.root_stat());
        }
        let meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(path))?;
        match self.stat_name(&meta, &fpath) {
            Some(stat) => Ok(stat),
            None => {
                debug!("returning ENOENT for {}", path);
                Err(FsError::not_found(path))
            }
        }
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        debug!("readdir {}", path);
        let meta = self.meta.lock().unwrap();
        let (folderid, _) = paths::resolve_folder(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(path))?;
        let (folder_rows, file_rows) = match folderid.committed_id() {
            Some(id) => (self.db.folders_in(id), self.db.files_in(id)),
            None => (Vec::new(), Vec::new()),
        };
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                stat: FileStat::folder(0, 0, 0),
            },
            DirEntry {
                name: "..".to_string(),
                stat: FileStat::folder(0, 0, 0),
            },
        ];
        entries.extend(crate::overlay::merged_entries(
            meta.overlays.get(folderid),
            &folder_rows,
            &file_rows,
            |_, cr| self.creat_stat(cr).ok(),
        ));
        Ok(entries)
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<Arc<OpenFile>> {
        debug!("open {}", path);
        let mut meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(format!("open {}, folder not found", path)))?;
        if flags.wants_write() && !fpath.permissions.contains(Permissions::MODIFY) {
            return Err(FsError::access_denied(path));
        }
        if let Some(cr) = meta.overlays.find_creat(fpath.folderid, &fpath.name).cloned() {
            return self.open_overlay(meta, &fpath, &cr, flags);
        }
        if !meta.overlays.has_unlink(fpath.folderid, &fpath.name) {
            if let Some(pid) = fpath.folderid.committed_id() {
                if let Some(row) = self.db.file_by_name(pid, &fpath.name) {
                    debug!("opening regular file {} {}", row.id, fpath.name);
                    let (of, _) = Self::open_record(
                        &mut meta,
                        FsId::Committed(row.id),
                        row.id,
                        row.size,
                        row.hash,
                        fpath.folderid,
                        &fpath.name,
                    );
                    return Ok(of);
                }
            }
        }
        debug!("returning ENOENT for {}", path);
        Err(FsError::not_found(path))
    }

    pub fn create(&self, path: &str, _mode: u32) -> FsResult<Arc<OpenFile>> {
        debug!("creat {}", path);
        let mut meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(format!("creat {}, folder not found", path)))?;
        if !fpath.permissions.contains(Permissions::CREATE) {
            return Err(FsError::access_denied(path));
        }
        let task = self.db.create_task(0, 0);
        let fileid = FsId::Pending(task);
        meta.overlays.entry(fpath.folderid).creats.insert(
            fpath.name.clone(),
            Creat {
                fileid,
                new_file: true,
            },
        );
        let (of, _) = Self::open_record(&mut meta, fileid, 0, 0, 0, fpath.folderid, &fpath.name);
        let mut st = of.lock();
        st.new_file = true;
        drop(meta);
        let ret = sparse::open_write_files(&mut st, &self.settings.cache_path(), true);
        drop(st);
        if let Err(e) = ret {
            let mut meta = self.meta.lock().unwrap();
            meta.overlays.remove_creat(fpath.folderid, &fpath.name);
            drop(meta);
            self.db.drop_task(task);
            self.release(&of);
            return Err(e);
        }
        Ok(of)
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        debug!("mkdir {}", path);
        let mut meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(path))?;
        if !fpath.permissions.contains(Permissions::CREATE) {
            return Err(FsError::access_denied(path));
        }
        if self.name_taken(&meta, &fpath) {
            return Err(FsError::exists(path));
        }
        let task = self.db.create_task(0, 0);
        let now = self.clock.now();
        meta.overlays.entry(fpath.folderid).mkdirs.insert(
            fpath.name.clone(),
            MkDir {
                folderid: FsId::Pending(task),
                ctime: now,
                mtime: now,
                subdircnt: 0,
            },
        );
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!("rmdir {}", path);
        let mut meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(path))?;
        if !fpath.permissions.contains(Permissions::DELETE) {
            return Err(FsError::access_denied(path));
        }
        if let Some(mk) = meta.overlays.find_mkdir(fpath.folderid, &fpath.name).cloned() {
            if !self.merged_is_empty(&meta, mk.folderid) {
                return Err(FsError::not_empty(path));
            }
            meta.overlays.remove_mkdir(fpath.folderid, &fpath.name);
            if let Some(task) = mk.folderid.task_id() {
                self.db.drop_task(task);
            }
            // A committed row the mkdir was shadowing stays hidden.
            if let Some(pid) = fpath.folderid.committed_id() {
                if self.db.folder_by_name(pid, &fpath.name).is_some() {
                    meta.overlays
                        .entry(fpath.folderid)
                        .rmdirs
                        .insert(fpath.name.clone());
                }
            }
            return Ok(());
        }
        if meta.overlays.has_rmdir(fpath.folderid, &fpath.name) {
            return Err(FsError::not_found(path));
        }
        let row = fpath
            .folderid
            .committed_id()
            .and_then(|pid| self.db.folder_by_name(pid, &fpath.name))
            .ok_or_else(|| FsError::not_found(path))?;
        if !self.merged_is_empty(&meta, FsId::Committed(row.id)) {
            return Err(FsError::not_empty(path));
        }
        meta.overlays
            .entry(fpath.folderid)
            .rmdirs
            .insert(fpath.name.clone());
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        debug!("unlink {}", path);
        let mut meta = self.meta.lock().unwrap();
        let fpath = paths::resolve_parent(&*self.db, &meta.overlays, path)
            .ok_or_else(|| FsError::not_found(path))?;
        if !fpath.permissions.contains(Permissions::DELETE) {
            return Err(FsError::access_denied(path));
        }
        let removed = meta.overlays.remove_creat(fpath.folderid, &fpath.name);
        if let Some(cr) = &removed {
            if let Some(task) = cr.fileid.task_id() {
                self.db.drop_task(task);
            }
        }
        let mut found = removed.is_some();
        let committed = fpath
            .folderid
            .committed_id()
            .and_then(|pid| self.db.file_by_name(pid, &fpath.name));
        if committed.is_some() && !meta.overlays.has_unlink(fpath.folderid, &fpath.name) {
            meta.overlays
                .entry(fpath.folderid)
                .unlinks
                .insert(fpath.name.clone());
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(FsError::not_found(path))
        }
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        debug!("rename {} to {}", old_path, new_path);
        let mut meta = self.meta.lock().unwrap();
        let fold = paths::resolve_parent(&*self.db, &meta.overlays, old_path);
        let fnew = paths::resolve_parent(&*self.db, &meta.overlays, new_path);
        let (fold, target) = match (fold, fnew) {
            (Some(fold), Some(fnew)) => {
                let target = self.resolve_rename_target(&meta, &fnew)?;
                (fold, target)
            }
            (Some(fold), None) if paths::is_root(new_path) => (
                fold,
                RenameTarget {
                    folderid: FsId::ROOT,
                    permissions: Permissions::ALL,
                    name: None,
                },
            ),
            _ => return Err(FsError::not_found(new_path)),
        };
        if let Some(mk) = meta.overlays.find_mkdir(fold.folderid, &fold.name).cloned() {
            return self.rename_folder_task(&mut meta, mk.folderid, &fold, &target);
        }
        if let Some(cr) = meta.overlays.find_creat(fold.folderid, &fold.name).cloned() {
            return self.rename_file_task(&mut meta, cr.fileid, cr.new_file, &fold, &target);
        }
        if !meta.overlays.has_rmdir(fold.folderid, &fold.name) {
            if let Some(pid) = fold.folderid.committed_id() {
                if let Some(row) = self.db.folder_by_name(pid, &fold.name) {
                    return self.rename_folder_task(
                        &mut meta,
                        FsId::Committed(row.id),
                        &fold,
                        &target,
                    );
                }
            }
        }
        if !meta.overlays.has_unlink(fold.folderid, &fold.name) {
            if let Some(pid) = fold.folderid.committed_id() {
                if let Some(row) = self.db.file_by_name(pid, &fold.name) {
                    return self.rename_file_task(
                        &mut meta,
                        FsId::Committed(row.id),
                        false,
                        &fold,
                        &target,
                    );
                }
            }
        }
        debug!("returning ENOENT, rename source not found");
        Err(FsError::not_found(old_path))
    }

    pub fn statfs(&self) -> StatVfs {
        let quota = self.settings.quota();
        let used = self.settings.used_quota();
        let blocks = quota / FS_BLOCK_SIZE;
        let bfree = blocks.saturating_sub(used / FS_BLOCK_SIZE);
        #[cfg(target_os = "linux")]
        let flags = libc::ST_NOSUID as u64;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;
        StatVfs {
            block_size: FS_BLOCK_SIZE as u32,
            fragment_size: FS_BLOCK_SIZE as u32,
            blocks,
            bfree,
            bavail: bfree,
            name_max: FS_NAME_MAX,
            flags,
        }
    }

    // ---- handle operations -----------------------------------------------

    pub fn read(&self, of: &Arc<OpenFile>, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let now = self.clock.now();
        let mut st = of.lock();
        st.note_read(size, now);
        if st.new_file {
            let data = st
                .data_file
                .as_ref()
                .ok_or_else(|| FsError::io("data file not open"))?;
            let mut buf = vec![0u8; size];
            let n = sparse::pread(data, &mut buf, offset)
                .map_err(|e| FsError::io(format!("data read: {}", e)))?;
            buf.truncate(n);
            return Ok(buf);
        }
        let modified = st.modified;
        drop(st);
        if modified {
            self.pagecache.read_modified(of, size, offset)
        } else {
            self.pagecache.read_unmodified(of, size, offset)
        }
    }

    pub fn write(&self, of: &Arc<OpenFile>, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut st = of.lock();
        if st.uploading {
            debug!(
                "write to {} during upload, stale completion will be discarded",
                st.name
            );
        }
        st.write_id += 1;
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if st.new_file {
                let data = st
                    .data_file
                    .as_ref()
                    .ok_or_else(|| FsError::io("data file not open"))?;
                data.write_all_at(buf, offset)
                    .map_err(|e| FsError::io(format!("data write: {}", e)))?;
                let end = offset + buf.len() as u64;
                if end > st.current_size {
                    st.current_size = end;
                }
                return Ok(buf.len());
            }
            if st.modified {
                break;
            }
            debug!("reopening file {} for writing", st.name);
            // The metadata lock must be taken before the per-record lock.
            // Try without blocking first; on contention drop the record lock,
            // take both in order, and re-check the flags (another writer may
            // have finished the transition in between).
            let mut registered = false;
            if let Ok(mut meta) = self.meta.try_lock() {
                self.register_modified_task(&mut meta, &mut st);
                registered = true;
            }
            if !registered {
                drop(st);
                let mut meta = self.meta.lock().unwrap();
                st = of.lock();
                if st.new_file || st.modified {
                    drop(meta);
                    continue;
                }
                self.register_modified_task(&mut meta, &mut st);
            }
            self.prepare_modified_files(&mut st)?;
            break;
        }
        sparse::write_record(&mut st, buf, offset)
    }

    pub fn flush(&self, of: &Arc<OpenFile>) -> FsResult<()> {
        let st = of.lock();
        if st.modified && !st.uploading {
            let task = match st.fileid.task_id() {
                Some(task) => task,
                None => return Ok(()),
            };
            let writeid = st.write_id;
            debug!("queueing {} for upload", st.name);
            drop(st);
            if self.db.mark_task_ready(task, writeid) {
                self.uploads.wake();
            } else {
                self.db.raise_task_writeid(task, writeid);
            }
        }
        Ok(())
    }

    pub fn fsync(&self, of: &Arc<OpenFile>) -> FsResult<()> {
        let st = of.lock();
        if !st.modified {
            return Ok(());
        }
        st.data_file
            .as_ref()
            .ok_or_else(|| FsError::io("data file not open"))?
            .sync_all()
            .map_err(|e| FsError::io(format!("data sync: {}", e)))?;
        if !st.new_file {
            st.index_file
                .as_ref()
                .ok_or_else(|| FsError::io("index file not open"))?
                .sync_all()
                .map_err(|e| FsError::io(format!("index sync: {}", e)))?;
        }
        drop(st);
        self.db
            .sync()
            .map_err(|e| FsError::io(format!("metadata sync: {}", e)))
    }

    pub fn fsyncdir(&self) -> FsResult<()> {
        self.db
            .sync()
            .map_err(|e| FsError::io(format!("metadata sync: {}", e)))
    }

    /// Drops one reference; the last reference removes the record from the
    /// registry and closes its cache files.
    pub fn release(&self, of: &Arc<OpenFile>) {
        let mut meta = self.meta.lock().unwrap();
        let mut st = of.lock();
        st.refcnt -= 1;
        Self::reap(&mut meta, &mut st);
    }

    /// Pins a record across blocking page-cache reads.
    pub fn add_reader(&self, of: &Arc<OpenFile>) {
        let mut st = of.lock();
        st.refcnt += 1;
        st.running_reads += 1;
    }

    pub fn remove_reader(&self, of: &Arc<OpenFile>) {
        let mut meta = self.meta.lock().unwrap();
        let mut st = of.lock();
        st.running_reads -= 1;
        st.refcnt -= 1;
        Self::reap(&mut meta, &mut st);
    }

    // ---- upload worker callbacks -----------------------------------------

    /// Upload completion. When the record's writeid still matches the one the
    /// upload was launched against, the record is promoted to the new
    /// committed identity and returns 0; otherwise only the uploading flag is
    /// cleared and -1 signals that newer writes need another pass.
    pub fn update_openfile(
        &self,
        taskid: TaskId,
        writeid: u64,
        new_fileid: u64,
        hash: u64,
        size: u64,
    ) -> i32 {
        let mut meta = self.meta.lock().unwrap();
        let of = match meta.registry.get(FsId::Pending(taskid)) {
            Some(of) => Arc::clone(of),
            None => return 0,
        };
        let mut st = of.lock();
        if st.write_id == writeid {
            let old = st.fileid;
            st.fileid = FsId::Committed(new_fileid);
            st.remote_fileid = new_fileid;
            st.hash = hash;
            st.modified = false;
            st.new_file = false;
            st.initial_size = size;
            st.current_size = size;
            st.uploading = false;
            st.close_cache_files();
            st.write_intervals.clear();
            st.index_off = 0;
            meta.registry.relink(old, st.fileid);
            0
        } else {
            st.uploading = false;
            -1
        }
    }

    pub fn uploading_openfile(&self, taskid: TaskId) {
        let meta = self.meta.lock().unwrap();
        if let Some(of) = meta.registry.get(FsId::Pending(taskid)) {
            of.lock().uploading = true;
        }
    }

    /// Writeid the upload should cover: the live record's if the file is
    /// open, else the task row's stored value, else -1.
    pub fn get_file_writeid(&self, taskid: TaskId) -> i64 {
        let meta = self.meta.lock().unwrap();
        if let Some(of) = meta.registry.get(FsId::Pending(taskid)) {
            return of.lock().write_id as i64;
        }
        drop(meta);
        match self.db.task(taskid) {
            Some(task) => task.writeid as i64,
            None => -1,
        }
    }

    /// Releases page-cache state on unmount.
    pub fn shutdown(&self) {
        let _ = self.pagecache.flush();
    }

    // ---- internals -------------------------------------------------------

    fn root_stat(&self) -> FileStat {
        match self.db.folder_by_id(0) {
            Some(row) => FileStat::folder(row.ctime, row.mtime, row.subdircnt),
            None => FileStat::folder(0, 0, 0),
        }
    }

    /// Single-name lookup with overlay precedence: a pending entry supplies
    /// the answer, a tombstone hides the committed row, otherwise the
    /// committed row stands.
    fn stat_name(&self, meta: &MetaState, fpath: &FsPath) -> Option<FileStat> {
        let tasks = meta.overlays.get(fpath.folderid);
        if let Some(mk) = tasks.and_then(|t| t.mkdirs.get(&fpath.name)) {
            return Some(FileStat::folder(mk.ctime, mk.mtime, mk.subdircnt));
        }
        if !tasks.map_or(false, |t| t.rmdirs.contains(&fpath.name)) {
            if let Some(pid) = fpath.folderid.committed_id() {
                if let Some(row) = self.db.folder_by_name(pid, &fpath.name) {
                    return Some(FileStat::folder(row.ctime, row.mtime, row.subdircnt));
                }
            }
        }
        if let Some(cr) = tasks.and_then(|t| t.creats.get(&fpath.name)) {
            return self.creat_stat(cr).ok();
        }
        if !tasks.map_or(false, |t| t.unlinks.contains(&fpath.name)) {
            if let Some(pid) = fpath.folderid.committed_id() {
                if let Some(row) = self.db.file_by_name(pid, &fpath.name) {
                    return Some(FileStat::file(row.size, row.ctime, row.mtime));
                }
            }
        }
        None
    }

    /// Stat of a pending creat. A moved committed file reads its row; a
    /// task-backed file stats the cache data file, raised to
    /// `copyfromoriginal` for non-new files.
    fn creat_stat(&self, cr: &Creat) -> FsResult<FileStat> {
        if let Some(id) = cr.fileid.committed_id() {
            let row = self
                .db
                .file_by_id(id)
                .ok_or_else(|| FsError::not_found("moved file row"))?;
            return Ok(FileStat::file(row.size, row.ctime, row.mtime));
        }
        let cache = self.settings.cache_path();
        let data_path = sparse::data_file_path(&cache, cr.fileid)
            .ok_or_else(|| FsError::io("no cache file name"))?;
        let md = std::fs::metadata(&data_path)
            .map_err(|e| FsError::not_found(format!("stat {}: {}", data_path.display(), e)))?;
        let mut size = md.len();
        if !cr.new_file {
            let index_path = sparse::index_file_path(&cache, cr.fileid)
                .ok_or_else(|| FsError::io("no cache file name"))?;
            let index = File::open(&index_path)
                .map_err(|e| FsError::io(format!("open {}: {}", index_path.display(), e)))?;
            let base = sparse::read_copy_from_original(&index)
                .map_err(|e| FsError::io(format!("read {}: {}", index_path.display(), e)))?;
            size = size.max(base);
        }
        Ok(FileStat::file(size, md.ctime(), md.mtime()))
    }

    /// Finds or creates the record for `fileid`. A fresh record carries one
    /// reference; an existing one gains one.
    fn open_record(
        meta: &mut MetaState,
        fileid: FsId,
        remote_fileid: u64,
        size: u64,
        hash: u64,
        folder: FsId,
        name: &str,
    ) -> (Arc<OpenFile>, bool) {
        let (of, created) = meta.registry.get_or_insert_with(fileid, || {
            Arc::new(OpenFile::new(fileid, remote_fileid, size, hash, folder, name))
        });
        if !created {
            let mut st = of.lock();
            st.refcnt += 1;
            debug_assert_eq!(st.name, name);
            debug!("found open file {}, refcnt {}", fileid, st.refcnt);
        }
        (of, created)
    }

    fn open_overlay(
        &self,
        mut meta: MutexGuard<'_, MetaState>,
        fpath: &FsPath,
        cr: &Creat,
        flags: OpenFlags,
    ) -> FsResult<Arc<OpenFile>> {
        match cr.fileid {
            FsId::Committed(id) => {
                let row = self
                    .db
                    .file_by_id(id)
                    .ok_or_else(|| FsError::not_found("moved file row"))?;
                debug!("opening moved regular file {} {}", id, fpath.name);
                let (of, _) = Self::open_record(
                    &mut meta,
                    cr.fileid,
                    row.id,
                    row.size,
                    row.hash,
                    fpath.folderid,
                    &fpath.name,
                );
                Ok(of)
            }
            FsId::Pending(_) if cr.new_file => {
                debug!("opening new file {} {}", cr.fileid, fpath.name);
                let (of, _) =
                    Self::open_record(&mut meta, cr.fileid, 0, 0, 0, fpath.folderid, &fpath.name);
                let mut st = of.lock();
                st.new_file = true;
                drop(meta);
                let ret = sparse::open_write_files(&mut st, &self.settings.cache_path(), flags.truncates());
                drop(st);
                if let Err(e) = ret {
                    self.release(&of);
                    return Err(e);
                }
                Ok(of)
            }
            FsId::Pending(task) => {
                debug!("opening sparse file {} {}", cr.fileid, fpath.name);
                let trow = self
                    .db
                    .task(task)
                    .ok_or_else(|| FsError::not_found("task row"))?;
                let size = if flags.truncates() {
                    0
                } else {
                    self.db
                        .revision_size(trow.fileid, trow.hash)
                        .ok_or_else(|| FsError::not_found("file revision"))?
                };
                let (of, created) = Self::open_record(
                    &mut meta,
                    cr.fileid,
                    trow.fileid,
                    size,
                    trow.hash,
                    fpath.folderid,
                    &fpath.name,
                );
                let mut st = of.lock();
                st.new_file = false;
                if created {
                    st.write_id = trow.writeid;
                }
                drop(meta);
                let ret = sparse::open_write_files(&mut st, &self.settings.cache_path(), flags.truncates());
                drop(st);
                if let Err(e) = ret {
                    self.release(&of);
                    return Err(e);
                }
                Ok(of)
            }
        }
    }

    /// Metadata half of the clean-to-modified transition: allocate the task,
    /// overlay the name, and rekey the record. Both locks are held.
    fn register_modified_task(&self, meta: &mut MetaState, st: &mut OpenFileState) {
        let task = self.db.create_task(st.remote_fileid, st.hash);
        let fileid = FsId::Pending(task);
        meta.overlays.entry(st.folder).creats.insert(
            st.name.clone(),
            Creat {
                fileid,
                new_file: false,
            },
        );
        meta.registry.relink(st.fileid, fileid);
        st.fileid = fileid;
    }

    /// File half of the transition, under the record lock only: open the
    /// cache pair and size the data file to the base revision.
    fn prepare_modified_files(&self, st: &mut OpenFileState) -> FsResult<()> {
        sparse::open_write_files(st, &self.settings.cache_path(), false)?;
        st.data_file
            .as_ref()
            .ok_or_else(|| FsError::io("data file not open"))?
            .set_len(st.initial_size)
            .map_err(|e| FsError::io(format!("truncate data file: {}", e)))?;
        st.current_size = st.initial_size;
        st.modified = true;
        st.index_off = 0;
        Ok(())
    }

    fn reap(meta: &mut MetaState, st: &mut OpenFileState) {
        if st.refcnt == 0 {
            debug!("releasing file {}", st.name);
            meta.registry.remove(st.fileid);
            st.close_cache_files();
        }
    }

    fn name_taken(&self, meta: &MetaState, fpath: &FsPath) -> bool {
        let tasks = meta.overlays.get(fpath.folderid);
        if let Some(t) = tasks {
            if t.mkdirs.contains_key(&fpath.name) || t.creats.contains_key(&fpath.name) {
                return true;
            }
        }
        if let Some(pid) = fpath.folderid.committed_id() {
            if !tasks.map_or(false, |t| t.rmdirs.contains(&fpath.name))
                && self.db.folder_by_name(pid, &fpath.name).is_some()
            {
                return true;
            }
            if !tasks.map_or(false, |t| t.unlinks.contains(&fpath.name))
                && self.db.file_by_name(pid, &fpath.name).is_some()
            {
                return true;
            }
        }
        false
    }

    fn merged_is_empty(&self, meta: &MetaState, folderid: FsId) -> bool {
        let tasks = meta.overlays.get(folderid);
        if let Some(t) = tasks {
            if !t.mkdirs.is_empty() || !t.creats.is_empty() {
                return false;
            }
        }
        if let Some(id) = folderid.committed_id() {
            for row in self.db.folders_in(id) {
                if !tasks.map_or(false, |t| {
                    t.rmdirs.contains(&row.name) || t.mkdirs.contains_key(&row.name)
                }) {
                    return false;
                }
            }
            for row in self.db.files_in(id) {
                if !tasks.map_or(false, |t| {
                    t.unlinks.contains(&row.name) || t.creats.contains_key(&row.name)
                }) {
                    return false;
                }
            }
        }
        true
    }

    fn resolve_rename_target(&self, meta: &MetaState, fnew: &FsPath) -> FsResult<RenameTarget> {
        if let Some(mk) = meta.overlays.find_mkdir(fnew.folderid, &fnew.name) {
            let permissions = match mk.folderid.committed_id() {
                Some(id) => {
                    self.db
                        .folder_by_id(id)
                        .ok_or_else(|| FsError::not_found("destination folder row"))?
                        .permissions
                        & fnew.permissions
                }
                None => fnew.permissions,
            };
            return Ok(RenameTarget {
                folderid: mk.folderid,
                permissions,
                name: None,
            });
        }
        if let Some(pid) = fnew.folderid.committed_id() {
            if !meta.overlays.has_rmdir(fnew.folderid, &fnew.name) {
                if let Some(row) = self.db.folder_by_name(pid, &fnew.name) {
                    return Ok(RenameTarget {
                        folderid: FsId::Committed(row.id),
                        permissions: row.permissions & fnew.permissions,
                        name: None,
                    });
                }
            }
        }
        Ok(RenameTarget {
            folderid: fnew.folderid,
            permissions: fnew.permissions,
            name: Some(fnew.name.clone()),
        })
    }

    fn check_rename_perms(
        &self,
        src_folder: FsId,
        src_perms: Permissions,
        target: &RenameTarget,
    ) -> FsResult<()> {
        if src_folder == target.folderid {
            if !src_perms.contains(Permissions::MODIFY) {
                return Err(FsError::access_denied("rename"));
            }
        } else if !src_perms.contains(Permissions::DELETE)
            || !target.permissions.contains(Permissions::CREATE)
        {
            return Err(FsError::access_denied("rename"));
        }
        Ok(())
    }

    fn rename_file_task(
        &self,
        meta: &mut MetaState,
        fileid: FsId,
        new_file: bool,
        fold: &FsPath,
        target: &RenameTarget,
    ) -> FsResult<()> {
        self.check_rename_perms(fold.folderid, fold.permissions, target)?;
        let new_name = target.name.clone().unwrap_or_else(|| fold.name.clone());
        let removed = meta.overlays.remove_creat(fold.folderid, &fold.name);
        let (moved, new_file) = match removed {
            Some(cr) => (cr.fileid, cr.new_file),
            None => (fileid, new_file),
        };
        if let Some(pid) = fold.folderid.committed_id() {
            if self.db.file_by_name(pid, &fold.name).is_some() {
                meta.overlays
                    .entry(fold.folderid)
                    .unlinks
                    .insert(fold.name.clone());
            }
        }
        let dst_committed = target
            .folderid
            .committed_id()
            .and_then(|pid| self.db.file_by_name(pid, &new_name))
            .is_some();
        let dst = meta.overlays.entry(target.folderid);
        if dst_committed {
            dst.unlinks.insert(new_name.clone());
        } else {
            dst.unlinks.remove(&new_name);
        }
        dst.creats.insert(
            new_name.clone(),
            Creat {
                fileid: moved,
                new_file,
            },
        );
        Self::rename_open_record(meta, moved, target.folderid, &new_name);
        Ok(())
    }

    fn rename_folder_task(
        &self,
        meta: &mut MetaState,
        folderid: FsId,
        fold: &FsPath,
        target: &RenameTarget,
    ) -> FsResult<()> {
        self.check_rename_perms(fold.folderid, fold.permissions, target)?;
        let new_name = target.name.clone().unwrap_or_else(|| fold.name.clone());
        let entry = match meta.overlays.remove_mkdir(fold.folderid, &fold.name) {
            Some(mk) => mk,
            None => {
                let row = folderid
                    .committed_id()
                    .and_then(|id| self.db.folder_by_id(id))
                    .ok_or_else(|| FsError::not_found("source folder row"))?;
                MkDir {
                    folderid,
                    ctime: row.ctime,
                    mtime: row.mtime,
                    subdircnt: row.subdircnt,
                }
            }
        };
        if let Some(pid) = fold.folderid.committed_id() {
            if self.db.folder_by_name(pid, &fold.name).is_some() {
                meta.overlays
                    .entry(fold.folderid)
                    .rmdirs
                    .insert(fold.name.clone());
            }
        }
        let dst_committed = target
            .folderid
            .committed_id()
            .and_then(|pid| self.db.folder_by_name(pid, &new_name))
            .is_some();
        let dst = meta.overlays.entry(target.folderid);
        if dst_committed {
            dst.rmdirs.insert(new_name.clone());
        } else {
            dst.rmdirs.remove(&new_name);
        }
        dst.mkdirs.insert(new_name, entry);
        Ok(())
    }

    /// Swaps the folder handle and name of an open record in place, if the
    /// file is open. Runs with the metadata lock held.
    fn rename_open_record(meta: &MetaState, fileid: FsId, folder: FsId, name: &str) -> bool {
        match meta.registry.get(fileid) {
            Some(of) => {
                let mut st = of.lock();
                st.folder = folder;
                st.name = name.to_string();
                true
            }
            None => false,
        }
    }
}
