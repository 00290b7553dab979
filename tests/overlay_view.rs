//! Directory-view merging and the namespace operations over overlays.

mod common;

use common::*;
use nimbusfs::prelude::*;

#[test]
fn readdir_merges_committed_rows_with_overlays() {
    let h = harness();
    h.db.add_folder(0, "docs", Permissions::ALL, 1, 2);
    h.db.add_file(0, "keep.txt", 10, 1, 1, 2);
    h.db.add_file(0, "gone.txt", 10, 2, 1, 2);
    h.fs.mkdir("/fresh").unwrap();
    h.fs.unlink("/gone.txt").unwrap();
    let of = h.fs.create("/new.txt", 0o644).unwrap();
    h.fs.release(&of);

    let mut listing = names(h.fs.readdir("/").unwrap());
    listing.sort();
    let mut expected: Vec<String> = vec![".", "..", "docs", "fresh", "keep.txt", "new.txt"]
        .into_iter()
        .map(String::from)
        .collect();
    expected.sort();
    assert_eq!(listing, expected);
}

#[test]
fn mkdir_over_an_existing_name_fails() {
    let h = harness();
    h.db.add_folder(0, "d", Permissions::ALL, 1, 2);
    assert_eq!(h.fs.mkdir("/d").unwrap_err().raw_error(), libc::EEXIST);
    h.fs.mkdir("/e").unwrap();
    assert_eq!(h.fs.mkdir("/e").unwrap_err().raw_error(), libc::EEXIST);
}

#[test]
fn mkdir_after_rmdir_of_the_same_name_wins() {
    let h = harness();
    h.db.add_folder(0, "d", Permissions::ALL, 1, 2);
    h.fs.rmdir("/d").unwrap();
    assert_eq!(h.fs.getattr("/d").unwrap_err().raw_error(), libc::ENOENT);
    h.fs.mkdir("/d").unwrap();
    let stat = h.fs.getattr("/d").unwrap();
    assert!(stat.is_dir());
    // exactly one entry for the name
    let listing = names(h.fs.readdir("/").unwrap());
    assert_eq!(listing.iter().filter(|n| n.as_str() == "d").count(), 1);
}

#[test]
fn rmdir_of_a_pending_folder_removes_the_task() {
    let h = harness();
    h.fs.mkdir("/d").unwrap();
    h.fs.rmdir("/d").unwrap();
    assert_eq!(h.fs.getattr("/d").unwrap_err().raw_error(), libc::ENOENT);
    assert_eq!(h.fs.rmdir("/d").unwrap_err().raw_error(), libc::ENOENT);
}

#[test]
fn rmdir_refuses_non_empty_folders() {
    let h = harness();
    let d = h.db.add_folder(0, "d", Permissions::ALL, 1, 2);
    h.db.add_file(d, "f", 3, 1, 1, 2);
    assert_eq!(h.fs.rmdir("/d").unwrap_err().raw_error(), libc::ENOTEMPTY);
    // pending folders with pending content refuse too
    h.fs.mkdir("/e").unwrap();
    h.fs.mkdir("/e/sub").unwrap();
    assert_eq!(h.fs.rmdir("/e").unwrap_err().raw_error(), libc::ENOTEMPTY);
    h.fs.rmdir("/e/sub").unwrap();
    h.fs.rmdir("/e").unwrap();
}

#[test]
fn unlink_of_a_pending_creat_drops_the_task() {
    let h = harness();
    let of = h.fs.create("/f", 0o644).unwrap();
    let task = of.lock().fileid.task_id().unwrap();
    h.fs.release(&of);
    h.fs.unlink("/f").unwrap();
    assert!(h.db.task(task).is_none());
    assert_eq!(h.fs.getattr("/f").unwrap_err().raw_error(), libc::ENOENT);
    assert_eq!(h.fs.unlink("/f").unwrap_err().raw_error(), libc::ENOENT);
}

#[test]
fn rename_of_a_committed_folder_moves_the_whole_name() {
    let h = harness();
    let d = h.db.add_folder(0, "d", Permissions::ALL, 5, 6);
    h.db.add_file(d, "inner", 3, 1, 1, 2);
    h.fs.rename("/d", "/e").unwrap();

    assert_eq!(h.fs.getattr("/d").unwrap_err().raw_error(), libc::ENOENT);
    let stat = h.fs.getattr("/e").unwrap();
    assert!(stat.is_dir());
    assert_eq!(stat.ctime, 5);
    let root = names(h.fs.readdir("/").unwrap());
    assert!(root.contains(&"e".to_string()));
    assert!(!root.contains(&"d".to_string()));
    // the committed folder id travels with the overlay entry
    assert!(names(h.fs.readdir("/e").unwrap()).contains(&"inner".to_string()));
}

#[test]
fn rename_into_an_existing_folder_keeps_the_source_name() {
    let h = harness();
    h.db.add_folder(0, "sub", Permissions::ALL, 1, 2);
    h.db.add_file(0, "f", 3, 1, 1, 2);
    h.fs.rename("/f", "/sub").unwrap();
    assert!(h.fs.getattr("/sub/f").is_ok());
    assert_eq!(h.fs.getattr("/f").unwrap_err().raw_error(), libc::ENOENT);
}

#[test]
fn same_folder_rename_requires_modify() {
    let h = harness_with_root(Permissions::READ | Permissions::CREATE | Permissions::DELETE);
    h.db.add_file(0, "b", 3, 1, 1, 2);
    assert_eq!(
        h.fs.rename("/b", "/c").unwrap_err().raw_error(),
        libc::EACCES
    );
}

#[test]
fn cross_folder_rename_requires_delete_and_create() {
    let h = harness();
    h.db.add_folder(0, "ro", Permissions::READ, 1, 2);
    h.db.add_file(0, "b", 3, 1, 1, 2);
    // destination folder lacks CREATE
    assert_eq!(
        h.fs.rename("/b", "/ro/b").unwrap_err().raw_error(),
        libc::EACCES
    );
}

#[test]
fn rename_of_a_pending_file_moves_the_creat() {
    let h = harness();
    let of = h.fs.create("/f", 0o644).unwrap();
    h.fs.write(&of, b"data", 0).unwrap();
    h.fs.mkdir("/d").unwrap();
    h.fs.rename("/f", "/d/g").unwrap();
    // the open record follows the rename
    assert_eq!(of.lock().name, "g");
    assert_eq!(h.fs.getattr("/f").unwrap_err().raw_error(), libc::ENOENT);
    assert_eq!(h.fs.getattr("/d/g").unwrap().size, 4);
    h.fs.release(&of);
}

#[test]
fn getattr_root_reports_a_directory() {
    let h = harness();
    h.db.add_folder(0, "d", Permissions::ALL, 1, 2);
    let stat = h.fs.getattr("/").unwrap();
    assert!(stat.is_dir());
    assert_eq!(stat.nlink, 3);
}
