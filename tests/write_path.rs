//! Write-path properties: interval bookkeeping, index-file replay, reference
//! counting, and the documented boundary behaviors.

mod common;

use std::sync::Arc;

use common::*;
use nimbusfs::interval::IntervalSet;
use nimbusfs::prelude::*;
use nimbusfs::sparse;

fn seeded(h: &Harness, name: &str, size: u64, hash: u64) -> u64 {
    let fileid = h.db.add_file(0, name, size, hash, 1, 2);
    h.pages.put_base(fileid, hash, vec![b'x'; size as usize]);
    fileid
}

#[test]
fn every_write_lands_in_the_interval_set() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    for &(offset, len) in &[(0u64, 3usize), (50, 7), (98, 10)] {
        h.fs.write(&of, &vec![b'z'; len], offset).unwrap();
        let st = of.lock();
        assert!(st.write_intervals.covers(offset, offset + len as u64));
    }
    h.fs.release(&of);
}

#[test]
fn index_file_replay_equals_memory_state() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"abc", 5).unwrap();
    h.fs.write(&of, b"defgh", 40).unwrap();
    h.fs.write(&of, b"i", 6).unwrap();

    let st = of.lock();
    let task = st.fileid.task_id().unwrap();
    let index = std::fs::File::open(h.cache_dir.path().join(format!("{:016x}i", task))).unwrap();
    let mut replayed = IntervalSet::new();
    let len = index.metadata().unwrap().len();
    let cnt = sparse::load_intervals(&index, len, &mut replayed).unwrap();
    assert_eq!(cnt, st.index_off);
    assert_eq!(replayed, st.write_intervals);
    drop(st);
    h.fs.release(&of);
}

#[test]
fn rewriting_a_range_appends_a_record_without_changing_intervals() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"zz", 5).unwrap();
    let (intervals_before, ioff_before) = {
        let st = of.lock();
        (st.write_intervals.clone(), st.index_off)
    };
    h.fs.write(&of, b"zz", 5).unwrap();
    let st = of.lock();
    assert_eq!(st.write_intervals, intervals_before);
    assert_eq!(st.index_off, ioff_before + 1);
    drop(st);
    h.fs.release(&of);
}

#[test]
fn zero_byte_write_bumps_writeid_only() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    assert_eq!(h.fs.write(&of, b"", 0).unwrap(), 0);
    {
        let st = of.lock();
        assert_eq!(st.write_id, 1);
        // still clean: no task, no cache files
        assert!(!st.modified);
        assert!(st.data_file.is_none());
    }
    h.fs.release(&of);
}

#[test]
fn write_at_initial_size_extends_the_file() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"tail", 100).unwrap();
    assert_eq!(of.lock().current_size, 104);
    assert_eq!(h.fs.getattr("/b").unwrap().size, 104);
    h.fs.release(&of);
}

#[test]
fn write_past_the_end_leaves_an_unauthoritative_hole() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"far", 200).unwrap();
    let st = of.lock();
    assert_eq!(st.current_size, 203);
    assert!(st.write_intervals.covers(200, 203));
    // the hole between the old end and the write is not locally authoritative
    assert!(!st.write_intervals.contains(150));
    assert!(!st.write_intervals.covers(100, 200));
    drop(st);
    h.fs.release(&of);
}

#[test]
fn reopening_joins_the_live_record() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let first = h.fs.open("/b", rdwr()).unwrap();
    let second = h.fs.open("/b", rdwr()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.lock().refcnt, 2);
    h.fs.release(&second);
    assert_eq!(first.lock().refcnt, 1);
    h.fs.release(&first);

    // the record was destroyed; a new open builds a fresh one
    let third = h.fs.open("/b", rdwr()).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    h.fs.release(&third);
}

#[test]
fn reader_pins_keep_the_record_alive() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.add_reader(&of);
    assert_eq!(of.lock().running_reads, 1);
    h.fs.release(&of);
    // the reader pin still holds the record in the registry
    let again = h.fs.open("/b", rdwr()).unwrap();
    assert!(Arc::ptr_eq(&of, &again));
    h.fs.release(&again);
    h.fs.remove_reader(&of);
}

#[test]
fn writeid_query_prefers_the_live_record() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"a", 0).unwrap();
    h.fs.write(&of, b"b", 1).unwrap();
    let task = of.lock().fileid.task_id().unwrap();
    assert_eq!(h.fs.get_file_writeid(task), 2);
    h.fs.flush(&of).unwrap();
    h.fs.release(&of);
    // record gone: falls back to the task row recorded by flush
    assert_eq!(h.fs.get_file_writeid(task), 2);
    assert_eq!(h.fs.get_file_writeid(9999), -1);
}

#[test]
fn fsync_flushes_cache_files() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.fsync(&of).unwrap(); // clean record: nothing to sync
    h.fs.write(&of, b"abc", 0).unwrap();
    h.fs.fsync(&of).unwrap();
    h.fs.fsyncdir().unwrap();
    h.fs.release(&of);
}

#[test]
fn flush_without_ready_transition_still_raises_writeid() {
    let h = harness();
    seeded(&h, "b", 100, 7);
    let of = h.fs.open("/b", rdwr()).unwrap();
    h.fs.write(&of, b"a", 0).unwrap();
    let task = of.lock().fileid.task_id().unwrap();
    h.fs.flush(&of).unwrap();
    assert_eq!(h.wakes.count(), 1);
    // second flush after another write: the task is already ready, so only
    // the recorded writeid moves
    h.fs.write(&of, b"b", 1).unwrap();
    h.fs.flush(&of).unwrap();
    assert_eq!(h.wakes.count(), 1);
    assert_eq!(h.db.task(task).unwrap().writeid, 2);
    h.fs.release(&of);
}
