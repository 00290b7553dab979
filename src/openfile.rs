//! In-memory record of one open logical file.
//!
//! The same logical file may exist as a remote immutable object, a pending
//! task, and a pair of cache files; the [`OpenFile`] record ties those
//! together for the lifetime of the open. All mutable state lives behind the
//! per-record lock. The lock nests inside the global metadata lock: code that
//! needs both takes the metadata lock first (see the write path for the one
//! sanctioned inversion).

use std::fs::File;
use std::sync::{Mutex, MutexGuard};

use crate::interval::IntervalSet;
use crate::types::FsId;

#[derive(Debug)]
pub struct OpenFile {
    state: Mutex<OpenFileState>,
}

/// Everything the per-record lock guards.
#[derive(Debug)]
pub struct OpenFileState {
    /// Current identity: committed remote file or pending task.
    pub fileid: FsId,
    /// Positive id of the base revision, 0 for a wholly new file.
    pub remote_fileid: u64,
    /// Content hash of the base revision, 0 for a new file.
    pub hash: u64,
    /// Size of the base revision.
    pub initial_size: u64,
    /// Current logical size.
    pub current_size: u64,
    /// Bumped on every write; matches upload completions to the state they
    /// were launched against.
    pub write_id: u64,
    /// No remote base; the data file is authoritative in full.
    pub new_file: bool,
    /// Local writes diverge from the base revision.
    pub modified: bool,
    /// An upload of this file is in flight.
    pub uploading: bool,
    pub refcnt: u32,
    pub running_reads: u32,
    pub data_file: Option<File>,
    pub index_file: Option<File>,
    /// Locally authoritative byte ranges of the data file.
    pub write_intervals: IntervalSet,
    /// Records already appended to the index file.
    pub index_off: u64,
    /// Folder the file currently lives in, by the folder-task key.
    pub folder: FsId,
    pub name: String,
    current_sec: i64,
    bytes_this_sec: u64,
    current_speed: u64,
}

impl OpenFile {
    pub(crate) fn new(
        fileid: FsId,
        remote_fileid: u64,
        size: u64,
        hash: u64,
        folder: FsId,
        name: &str,
    ) -> OpenFile {
        OpenFile {
            state: Mutex::new(OpenFileState {
                fileid,
                remote_fileid,
                hash,
                initial_size: size,
                current_size: size,
                write_id: 0,
                new_file: false,
                modified: fileid.is_pending(),
                uploading: false,
                refcnt: 1,
                running_reads: 0,
                data_file: None,
                index_file: None,
                write_intervals: IntervalSet::new(),
                index_off: 0,
                folder,
                name: name.to_string(),
                current_sec: 0,
                bytes_this_sec: 0,
                current_speed: 0,
            }),
        }
    }

    /// Takes the per-record lock.
    pub fn lock(&self) -> MutexGuard<'_, OpenFileState> {
        self.state.lock().unwrap()
    }
}

impl OpenFileState {
    /// Feeds one read into the speed estimator. Within a second the estimate
    /// only grows; across seconds it decays towards the observed rate, and a
    /// gap of more than ten seconds resets it.
    pub fn note_read(&mut self, size: usize, now: i64) {
        let size = size as u64;
        if self.current_sec == now {
            self.bytes_this_sec += size;
            if self.current_speed < self.bytes_this_sec {
                self.current_speed = self.bytes_this_sec;
            }
        } else {
            if self.current_sec < now - 10 {
                self.current_speed = size;
            } else if self.current_speed == 0 {
                self.current_speed = self.bytes_this_sec;
            } else {
                let elapsed = (now - self.current_sec).max(1) as u64;
                self.current_speed = (self.bytes_this_sec / elapsed + 3 * self.current_speed) / 4;
            }
            self.current_sec = now;
            self.bytes_this_sec = size;
        }
    }

    /// Current estimate in bytes per second, consumed for read-ahead sizing.
    pub fn read_speed(&self) -> u64 {
        self.current_speed
    }

    pub fn close_cache_files(&mut self) {
        self.data_file = None;
        self.index_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OpenFile {
        OpenFile::new(FsId::Committed(9), 9, 100, 1, FsId::ROOT, "f")
    }

    #[test]
    fn new_pending_record_starts_modified() {
        let of = OpenFile::new(FsId::Pending(3), 0, 0, 0, FsId::ROOT, "n");
        let st = of.lock();
        assert!(st.modified);
        assert_eq!(st.refcnt, 1);
    }

    #[test]
    fn same_second_reads_accumulate() {
        let of = record();
        let mut st = of.lock();
        st.note_read(100, 50);
        st.note_read(200, 50);
        assert_eq!(st.read_speed(), 300);
    }

    #[test]
    fn stale_estimator_resets_to_last_read() {
        let of = record();
        let mut st = of.lock();
        st.note_read(4096, 50);
        st.note_read(512, 100);
        assert_eq!(st.read_speed(), 512);
    }

    #[test]
    fn recent_seconds_blend() {
        let of = record();
        let mut st = of.lock();
        st.note_read(1000, 50);
        // One second later the estimate blends the observed 1000 B/s with the
        // previous estimate instead of resetting.
        st.note_read(2000, 51);
        assert_eq!(st.read_speed(), (1000 / 1 + 3 * 1000) / 4);
        assert_eq!(st.read_speed(), 1000);
    }

    #[test]
    fn zero_speed_adopts_bytes_of_previous_second() {
        let of = record();
        let mut st = of.lock();
        st.current_sec = 49;
        st.bytes_this_sec = 700;
        st.note_read(10, 50);
        assert_eq!(st.read_speed(), 700);
    }
}
