//! Sparse-write store: the data file and write-index file backing a modified
//! file.
//!
//! The data file has the same logical size as the remote original with holes
//! where nothing was written; the index file records which ranges of it are
//! authoritative. On disk the index file is a little-endian header holding
//! `copyfromoriginal` (the base revision's size, kept for recovery) followed
//! by an append-only array of `(offset, length)` records. The in-memory
//! [`IntervalSet`] of an open record always equals the union of the records
//! written so far.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::interval::IntervalSet;
use crate::openfile::OpenFileState;
use crate::types::{FsError, FsId, FsResult};

/// One little-endian u64: `copyfromoriginal`.
pub const INDEX_HEADER_SIZE: u64 = 8;
/// One `(offset: u64le, length: u64le)` record.
pub const INDEX_RECORD_SIZE: u64 = 16;
/// Records read per batch when rebuilding the interval set.
const LOAD_BATCH: usize = 512;

pub fn data_file_path(cache_dir: &Path, id: FsId) -> Option<PathBuf> {
    id.data_file_name().map(|n| cache_dir.join(n))
}

pub fn index_file_path(cache_dir: &Path, id: FsId) -> Option<PathBuf> {
    id.index_file_name().map(|n| cache_dir.join(n))
}

/// Reads `copyfromoriginal` from an index file.
pub fn read_copy_from_original(file: &File) -> io::Result<u64> {
    let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
    file.read_exact_at(&mut buf, 0)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_index_header(file: &File, copy_from_original: u64) -> io::Result<()> {
    file.write_all_at(&copy_from_original.to_le_bytes(), 0)
}

fn append_index_record(file: &File, ioff: u64, offset: u64, length: u64) -> io::Result<()> {
    let mut rec = [0u8; INDEX_RECORD_SIZE as usize];
    rec[..8].copy_from_slice(&offset.to_le_bytes());
    rec[8..].copy_from_slice(&length.to_le_bytes());
    file.write_all_at(&rec, INDEX_HEADER_SIZE + ioff * INDEX_RECORD_SIZE)
}

/// Rebuilds an interval set from an index file of `file_size` bytes and
/// returns the number of records read. A file shorter than the header is
/// treated as empty; anything else must be record-aligned.
pub fn load_intervals(file: &File, file_size: u64, set: &mut IntervalSet) -> io::Result<u64> {
    if file_size < INDEX_HEADER_SIZE {
        return Ok(0);
    }
    let payload = file_size - INDEX_HEADER_SIZE;
    assert!(
        payload % INDEX_RECORD_SIZE == 0,
        "index file length {} is not record aligned",
        file_size
    );
    let cnt = payload / INDEX_RECORD_SIZE;
    debug!("loading {} intervals", cnt);
    let mut buf = vec![0u8; LOAD_BATCH * INDEX_RECORD_SIZE as usize];
    let mut done: u64 = 0;
    while done < cnt {
        let batch = LOAD_BATCH.min((cnt - done) as usize);
        let bytes = &mut buf[..batch * INDEX_RECORD_SIZE as usize];
        file.read_exact_at(bytes, INDEX_HEADER_SIZE + done * INDEX_RECORD_SIZE)?;
        for rec in bytes.chunks_exact(INDEX_RECORD_SIZE as usize) {
            let offset = u64::from_le_bytes(rec[..8].try_into().unwrap());
            let length = u64::from_le_bytes(rec[8..].try_into().unwrap());
            set.insert(offset, offset + length);
        }
        done += batch as u64;
    }
    Ok(cnt)
}

/// `pread` semantics over [`FileExt`]: reads up to `buf.len()` bytes at
/// `offset`, short only at end of file.
pub(crate) fn pread(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset) {
            Ok(0) => break,
            Ok(n) => {
                done += n;
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Opens the cache files of a record for writing. Called on the first write
/// to a clean file and on any reopen of a pending one.
///
/// The data file is opened read-write, created if missing, truncated on
/// request, and its size becomes the record's current size. For non-new files
/// the index file is opened the same way and either receives its header
/// (first open) or is replayed into the interval set (reopen).
pub fn open_write_files(of: &mut OpenFileState, cache_dir: &Path, trunc: bool) -> FsResult<()> {
    if of.data_file.is_none() {
        let path = data_file_path(cache_dir, of.fileid)
            .ok_or_else(|| FsError::io("no cache file for a committed id"))?;
        let file = open_cache_file(&path, trunc)?;
        of.current_size = file
            .metadata()
            .map_err(|e| FsError::io(format!("stat {}: {}", path.display(), e)))?
            .len();
        of.data_file = Some(file);
    }
    if !of.new_file && of.index_file.is_none() {
        let path = index_file_path(cache_dir, of.fileid)
            .ok_or_else(|| FsError::io("no cache file for a committed id"))?;
        let file = open_cache_file(&path, trunc)?;
        if let Err(e) = load_index(of, &file) {
            error!("could not load cache file {}: {}", path.display(), e);
            return Err(FsError::io(format!("load {}: {}", path.display(), e)));
        }
        of.index_file = Some(file);
    }
    Ok(())
}

fn open_cache_file(path: &Path, trunc: bool) -> FsResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(trunc)
        .open(path)
        .map_err(|e| {
            error!("could not open cache file {}: {}", path.display(), e);
            FsError::io(format!("open {}: {}", path.display(), e))
        })
}

fn load_index(of: &mut OpenFileState, file: &File) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len < INDEX_HEADER_SIZE {
        write_index_header(file, of.initial_size)?;
        of.index_off = 0;
        return Ok(());
    }
    of.index_off = load_intervals(file, len, &mut of.write_intervals)?;
    Ok(())
}

/// Applies one write to a modified record: data write, index record append,
/// interval insert. Runs under the per-record lock.
pub fn write_record(of: &mut OpenFileState, buf: &[u8], offset: u64) -> FsResult<usize> {
    let ioff = of.index_off;
    of.index_off += 1;
    of.data_file
        .as_ref()
        .ok_or_else(|| FsError::io("data file not open"))?
        .write_all_at(buf, offset)
        .map_err(|e| FsError::io(format!("data write: {}", e)))?;
    let written = buf.len() as u64;
    let index = of
        .index_file
        .as_ref()
        .ok_or_else(|| FsError::io("index file not open"))?;
    append_index_record(index, ioff, offset, written)
        .map_err(|e| FsError::io(format!("index write: {}", e)))?;
    of.write_intervals.insert(offset, offset + written);
    if offset + written > of.current_size {
        of.current_size = offset + written;
    }
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn temp_index(copy_from_original: u64, records: &[(u64, u64)]) -> File {
        let file = tempfile::tempfile().unwrap();
        write_index_header(&file, copy_from_original).unwrap();
        for (i, &(off, len)) in records.iter().enumerate() {
            append_index_record(&file, i as u64, off, len).unwrap();
        }
        file
    }

    #[test]
    fn header_round_trip() {
        let file = temp_index(4242, &[]);
        assert_eq!(read_copy_from_original(&file).unwrap(), 4242);
    }

    #[test]
    fn empty_index_loads_zero_records() {
        let file = tempfile::tempfile().unwrap();
        let mut set = IntervalSet::new();
        assert_eq!(load_intervals(&file, 0, &mut set).unwrap(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn records_replay_as_union() {
        let file = temp_index(100, &[(0, 10), (5, 10), (40, 4)]);
        let mut set = IntervalSet::new();
        let len = file.metadata().unwrap().len();
        assert_eq!(load_intervals(&file, len, &mut set).unwrap(), 3);
        let ranges: Vec<_> = set.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(ranges, vec![(0, 15), (40, 44)]);
    }

    #[test]
    fn loader_handles_more_than_one_batch() {
        let records: Vec<(u64, u64)> = (0..1500).map(|i| (i * 10, 5)).collect();
        let file = temp_index(0, &records);
        let mut set = IntervalSet::new();
        let len = file.metadata().unwrap().len();
        assert_eq!(load_intervals(&file, len, &mut set).unwrap(), 1500);
        assert_eq!(set.len(), 1500);
    }

    #[test]
    fn cache_paths_use_the_task_magnitude() {
        let dir = tempdir().unwrap();
        let id = FsId::Pending(0x1f);
        let data = data_file_path(dir.path(), id).unwrap();
        assert!(data.ends_with("000000000000001fd"));
        assert!(data_file_path(dir.path(), FsId::Committed(7)).is_none());
    }
}
