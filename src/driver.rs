//! Kernel-facing adapter.
//!
//! Implements `fuser::Filesystem` on top of [`NimbusFs`], dispatching every
//! request onto a worker pool so the multi-threaded kernel dispatcher never
//! blocks on a slow operation. The driver owns the two tables the binding
//! needs and the core does not: inode number to path, and opaque file handle
//! to open-file record.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc::c_int;
use log::debug;
use threadpool::ThreadPool;

use fuser::consts::{FUSE_ASYNC_READ, FUSE_ATOMIC_O_TRUNC, FUSE_BIG_WRITES};
use fuser::{
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};

use crate::fs::NimbusFs;
use crate::openfile::OpenFile;
use crate::types::{FileKind, FileStat, OpenFlags, FS_BLOCK_SIZE, FS_MAX_WRITE};

const TTL: Duration = Duration::from_secs(1);

/// Inode number to path mapping. The kernel talks in inode numbers; the core
/// talks in paths. Numbers are assigned on first sight and reused for the
/// same path.
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> InodeTable {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(1, "/".to_string());
        by_path.insert("/".to_string(), 1);
        InodeTable {
            by_ino,
            by_path,
            next: 2,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Rewrites a renamed path and everything under it.
    fn rename(&mut self, old: &str, new: &str) {
        let prefix = format!("{}/", old);
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, &i)| (p.clone(), i))
            .collect();
        for (path, ino) in moved {
            self.by_path.remove(&path);
            let renamed = format!("{}{}", new, &path[old.len()..]);
            self.by_ino.insert(ino, renamed.clone());
            self.by_path.insert(renamed, ino);
        }
    }
}

/// Opaque handle to open-file record mapping.
#[derive(Default)]
struct HandleTable {
    handles: HashMap<u64, Arc<OpenFile>>,
    next: u64,
}

impl HandleTable {
    fn insert(&mut self, of: Arc<OpenFile>) -> u64 {
        self.next += 1;
        let fh = self.next;
        self.handles.insert(fh, of);
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.get(&fh).cloned()
    }

    fn remove(&mut self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.remove(&fh)
    }
}

pub struct FuseDriver {
    fs: Arc<NimbusFs>,
    inodes: Arc<Mutex<InodeTable>>,
    handles: Arc<Mutex<HandleTable>>,
    pool: ThreadPool,
    uid: u32,
    gid: u32,
}

impl FuseDriver {
    pub fn new(fs: NimbusFs, num_workers: usize) -> FuseDriver {
        FuseDriver {
            fs: Arc::new(fs),
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            handles: Arc::new(Mutex::new(HandleTable::default())),
            pool: ThreadPool::new(num_workers.max(1)),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

fn join(parent: &str, name: &OsStr) -> Option<String> {
    let name = name.to_str()?;
    if parent == "/" {
        Some(format!("/{}", name))
    } else {
        Some(format!("{}/{}", parent, name))
    }
}

fn epoch(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn to_fuse_attr(stat: &FileStat, ino: u64, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: (stat.size + 511) / 512,
        atime: epoch(stat.mtime),
        mtime: epoch(stat.mtime),
        ctime: epoch(stat.ctime),
        crtime: epoch(stat.ctime),
        kind: match stat.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::RegularFile => FileType::RegularFile,
        },
        perm: stat.perm,
        nlink: stat.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: FS_BLOCK_SIZE as u32,
        flags: 0,
    }
}

impl fuser::Filesystem for FuseDriver {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> Result<(), c_int> {
        let _ = config.add_capabilities(FUSE_ASYNC_READ | FUSE_ATOMIC_O_TRUNC | FUSE_BIG_WRITES);
        let _ = config.set_max_write(FS_MAX_WRITE);
        let _ = config.set_max_readahead(0);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("unmounting");
        self.fs.shutdown();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);
        let name: OsString = name.to_owned();
        self.pool.execute(move || {
            let parent_path = match inodes.lock().unwrap().path_of(parent) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            let path = match join(&parent_path, &name) {
                Some(p) => p,
                None => return reply.error(libc::EINVAL),
            };
            match fs.getattr(&path) {
                Ok(stat) => {
                    let ino = inodes.lock().unwrap().assign(&path);
                    reply.entry(&TTL, &to_fuse_attr(&stat, ino, uid, gid), 0);
                }
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);
        self.pool.execute(move || {
            let path = match inodes.lock().unwrap().path_of(ino) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            match fs.getattr(&path) {
                Ok(stat) => reply.attr(&TTL, &to_fuse_attr(&stat, ino, uid, gid)),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    // chmod, chown and utimens arrive here; they are accepted without effect.
    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);
        self.pool.execute(move || {
            let path = match inodes.lock().unwrap().path_of(ino) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            match fs.getattr(&path) {
                Ok(stat) => reply.attr(&TTL, &to_fuse_attr(&stat, ino, uid, gid)),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.pool.execute(move || {
            let path = match inodes.lock().unwrap().path_of(ino) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            match fs.readdir(&path) {
                Ok(entries) => {
                    for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
                        let child_ino = match entry.name.as_str() {
                            "." => ino,
                            ".." => 1,
                            name => match join(&path, OsStr::new(name)) {
                                Some(child) => inodes.lock().unwrap().assign(&child),
                                None => continue,
                            },
                        };
                        let kind = match entry.stat.kind {
                            FileKind::Directory => FileType::Directory,
                            FileKind::RegularFile => FileType::RegularFile,
                        };
                        if reply.add(child_ino, (i + 1) as i64, kind, &entry.name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let handles = Arc::clone(&self.handles);
        self.pool.execute(move || {
            let path = match inodes.lock().unwrap().path_of(ino) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            match fs.open(&path, OpenFlags::from_bits_retain(flags)) {
                Ok(of) => {
                    let fh = handles.lock().unwrap().insert(of);
                    reply.opened(fh, 0);
                }
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let handles = Arc::clone(&self.handles);
        let (uid, gid) = (self.uid, self.gid);
        let name: OsString = name.to_owned();
        self.pool.execute(move || {
            let parent_path = match inodes.lock().unwrap().path_of(parent) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            let path = match join(&parent_path, &name) {
                Some(p) => p,
                None => return reply.error(libc::EINVAL),
            };
            let of = match fs.create(&path, mode) {
                Ok(of) => of,
                Err(e) => return reply.error(e.raw_error()),
            };
            match fs.getattr(&path) {
                Ok(stat) => {
                    let ino = inodes.lock().unwrap().assign(&path);
                    let fh = handles.lock().unwrap().insert(of);
                    reply.created(&TTL, &to_fuse_attr(&stat, ino, uid, gid), 0, fh, 0);
                }
                Err(e) => {
                    fs.release(&of);
                    reply.error(e.raw_error());
                }
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        self.pool.execute(move || {
            let of = match handles.lock().unwrap().get(fh) {
                Some(of) => of,
                None => return reply.error(libc::EBADF),
            };
            match fs.read(&of, size as usize, offset.max(0) as u64) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        let data = data.to_vec();
        self.pool.execute(move || {
            let of = match handles.lock().unwrap().get(fh) {
                Some(of) => of,
                None => return reply.error(libc::EBADF),
            };
            match fs.write(&of, &data, offset.max(0) as u64) {
                Ok(written) => reply.written(written as u32),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        self.pool.execute(move || {
            let of = match handles.lock().unwrap().get(fh) {
                Some(of) => of,
                None => return reply.error(libc::EBADF),
            };
            match fs.flush(&of) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        self.pool.execute(move || {
            let of = match handles.lock().unwrap().get(fh) {
                Some(of) => of,
                None => return reply.error(libc::EBADF),
            };
            match fs.fsync(&of) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn fsyncdir(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        self.pool.execute(move || match fs.fsyncdir() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.raw_error()),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        self.pool.execute(move || {
            if let Some(of) = handles.lock().unwrap().remove(fh) {
                fs.release(&of);
            }
            reply.ok();
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);
        let name: OsString = name.to_owned();
        self.pool.execute(move || {
            let parent_path = match inodes.lock().unwrap().path_of(parent) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            let path = match join(&parent_path, &name) {
                Some(p) => p,
                None => return reply.error(libc::EINVAL),
            };
            if let Err(e) = fs.mkdir(&path) {
                return reply.error(e.raw_error());
            }
            match fs.getattr(&path) {
                Ok(stat) => {
                    let ino = inodes.lock().unwrap().assign(&path);
                    reply.entry(&TTL, &to_fuse_attr(&stat, ino, uid, gid), 0);
                }
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let name: OsString = name.to_owned();
        self.pool.execute(move || {
            let parent_path = match inodes.lock().unwrap().path_of(parent) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            let path = match join(&parent_path, &name) {
                Some(p) => p,
                None => return reply.error(libc::EINVAL),
            };
            match fs.rmdir(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let name: OsString = name.to_owned();
        self.pool.execute(move || {
            let parent_path = match inodes.lock().unwrap().path_of(parent) {
                Some(p) => p,
                None => return reply.error(libc::ENOENT),
            };
            let path = match join(&parent_path, &name) {
                Some(p) => p,
                None => return reply.error(libc::EINVAL),
            };
            match fs.unlink(&path) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let name: OsString = name.to_owned();
        let newname: OsString = newname.to_owned();
        self.pool.execute(move || {
            let (old, new) = {
                let table = inodes.lock().unwrap();
                let old_parent = match table.path_of(parent) {
                    Some(p) => p,
                    None => return reply.error(libc::ENOENT),
                };
                let new_parent = match table.path_of(newparent) {
                    Some(p) => p,
                    None => return reply.error(libc::ENOENT),
                };
                match (join(&old_parent, &name), join(&new_parent, &newname)) {
                    (Some(old), Some(new)) => (old, new),
                    _ => return reply.error(libc::EINVAL),
                }
            };
            match fs.rename(&old, &new) {
                Ok(()) => {
                    inodes.lock().unwrap().rename(&old, &new);
                    reply.ok();
                }
                Err(e) => reply.error(e.raw_error()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let fs = Arc::clone(&self.fs);
        self.pool.execute(move || {
            let s = fs.statfs();
            reply.statfs(
                s.blocks,
                s.bfree,
                s.bavail,
                0,
                0,
                s.block_size,
                s.name_max,
                s.fragment_size,
            );
        });
    }
}
