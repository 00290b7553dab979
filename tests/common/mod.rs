//! Shared fixture: an in-memory metadata store, a map-backed page cache that
//! composes base revisions with locally authoritative ranges, a recording
//! upload waker, and a manually advanced clock.
#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use nimbusfs::prelude::*;

/// Page cache over an in-memory map of base revisions keyed by
/// `(fileid, hash)`.
#[derive(Default)]
pub struct BasePageCache {
    base: Mutex<HashMap<(u64, u64), Vec<u8>>>,
}

impl BasePageCache {
    pub fn put_base(&self, fileid: u64, hash: u64, content: Vec<u8>) {
        self.base.lock().unwrap().insert((fileid, hash), content);
    }
}

impl PageCache for BasePageCache {
    fn read_unmodified(&self, of: &Arc<OpenFile>, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let (fileid, hash) = {
            let st = of.lock();
            (st.remote_fileid, st.hash)
        };
        let map = self.base.lock().unwrap();
        let content = match map.get(&(fileid, hash)) {
            Some(content) => content,
            None => return Ok(Vec::new()),
        };
        let start = (offset as usize).min(content.len());
        let end = (start + size).min(content.len());
        Ok(content[start..end].to_vec())
    }

    fn read_modified(&self, of: &Arc<OpenFile>, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let st = of.lock();
        let end = (offset + size as u64).min(st.current_size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let len = (end - offset) as usize;
        let mut buf = vec![0u8; len];
        {
            let map = self.base.lock().unwrap();
            if let Some(content) = map.get(&(st.remote_fileid, st.hash)) {
                let base_end = content.len().min(end as usize);
                if (offset as usize) < base_end {
                    let n = base_end - offset as usize;
                    buf[..n].copy_from_slice(&content[offset as usize..base_end]);
                }
            }
        }
        let data = st
            .data_file
            .as_ref()
            .ok_or_else(|| FsError::io("data file closed"))?;
        for range in st.write_intervals.overlapping(offset, end) {
            let s = range.start.max(offset);
            let e = range.end.min(end);
            let dst = &mut buf[(s - offset) as usize..(e - offset) as usize];
            data.read_exact_at(dst, s)
                .map_err(|err| FsError::io(err.to_string()))?;
        }
        Ok(buf)
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct WakeCounter {
    count: AtomicUsize,
}

impl WakeCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl UploadWaker for WakeCounter {
    fn wake(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> ManualClock {
        ManualClock {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, t: i64) {
        self.now.store(t, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub fs: Arc<NimbusFs>,
    pub db: Arc<MemoryDb>,
    pub pages: Arc<BasePageCache>,
    pub wakes: Arc<WakeCounter>,
    pub clock: Arc<ManualClock>,
    pub cache_dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with_root(Permissions::ALL)
}

pub fn harness_with_root(root_permissions: Permissions) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache_dir = TempDir::new().unwrap();
    let db = Arc::new(MemoryDb::new(root_permissions));
    let pages = Arc::new(BasePageCache::default());
    let wakes = Arc::new(WakeCounter::default());
    let clock = Arc::new(ManualClock::new(1_000));
    let config = Arc::new(Config {
        cache_path: cache_dir.path().to_path_buf(),
        mount_root: "unused".into(),
        quota: 8 << 30,
        used_quota: 1 << 30,
        workers: 2,
    });
    let fs = Arc::new(NimbusFs::with_clock(
        db.clone(),
        config,
        pages.clone(),
        wakes.clone(),
        clock.clone(),
    ));
    Harness {
        fs,
        db,
        pages,
        wakes,
        clock,
        cache_dir,
    }
}

pub fn rdwr() -> OpenFlags {
    OpenFlags::from_bits_retain(libc::O_RDWR)
}

pub fn names(entries: Vec<DirEntry>) -> Vec<String> {
    entries.into_iter().map(|e| e.name).collect()
}
