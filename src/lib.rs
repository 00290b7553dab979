//! nimbusfs exposes a remote cloud storage namespace as a mountable local
//! filesystem.
//!
//! Reads are satisfied from a local page cache backed by the remote object
//! store; writes land in sparse local cache files and are uploaded
//! asynchronously. The crate implements the open-file layer and write path:
//! the registry of open-file records, the sparse-write store (data file plus
//! write-index file plus interval set), the merge of committed metadata with
//! pending-task overlays, and the filesystem operations on top, plus a thin
//! `fuser` driver and mount helpers.
//!
//! External collaborators (the metadata database, the page cache, the upload
//! worker, the settings store and the clock) are consumed through the traits
//! in [`store`], so the core can be embedded and tested without any of them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nimbusfs::prelude::*;
//!
//! # fn pagecache() -> Arc<dyn PageCache> { unimplemented!() }
//! # fn uploads() -> Arc<dyn UploadWaker> { unimplemented!() }
//! let config = Arc::new(Config::load("nimbusfs.toml".as_ref()));
//! let db = Arc::new(MemoryDb::new(Permissions::ALL));
//! let fs = NimbusFs::new(db, config.clone(), pagecache(), uploads());
//! nimbusfs::mount(fs, &config.mount_root, &nimbusfs::default_mount_options(), config.workers).unwrap();
//! ```

pub mod config;
pub mod driver;
pub mod fs;
pub mod interval;
pub mod openfile;
pub mod overlay;
pub(crate) mod paths;
pub(crate) mod registry;
pub mod sparse;
pub mod store;
pub mod types;

pub use driver::FuseDriver;
pub use fs::NimbusFs;

pub mod prelude {
    //! Re-exports the types most embedders need.
    pub use crate::config::Config;
    pub use crate::driver::FuseDriver;
    pub use crate::fs::NimbusFs;
    pub use crate::openfile::{OpenFile, OpenFileState};
    pub use crate::store::{
        Clock, FileRow, FolderRow, MemoryDb, MetaDb, PageCache, SettingsStore, SystemClock,
        TaskRow, TaskStatus, UploadWaker,
    };
    pub use crate::types::*;
    pub use crate::{mount, spawn_mount};

    pub use fuser::{BackgroundSession, MountOption};
}

use std::io;
use std::path::Path;

use fuser::{mount2, spawn_mount2, BackgroundSession, MountOption};

/// Mounts the filesystem and blocks until it is unmounted.
pub fn mount<P: AsRef<Path>>(
    fs: NimbusFs,
    mountpoint: P,
    options: &[MountOption],
    num_threads: usize,
) -> io::Result<()> {
    let driver = FuseDriver::new(fs, num_threads);
    mount2(driver, mountpoint, options)
}

/// Mounts the filesystem in a background session.
pub fn spawn_mount<P: AsRef<Path>>(
    fs: NimbusFs,
    mountpoint: P,
    options: &[MountOption],
    num_threads: usize,
) -> io::Result<BackgroundSession> {
    let driver = FuseDriver::new(fs, num_threads);
    spawn_mount2(driver, mountpoint, options)
}

/// The mount options the filesystem is normally deployed with.
pub fn default_mount_options() -> Vec<MountOption> {
    vec![
        MountOption::FSName("nimbusfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::AllowRoot,
    ]
}
