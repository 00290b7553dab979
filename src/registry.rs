//! Ordered map of live open-file records.
//!
//! Keyed by [`FsId`] so lookups by task id (`Pending`) and by committed file
//! id use the same map. Structural changes happen only under the global
//! metadata lock; the per-record lock is taken after the record is found.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::openfile::OpenFile;
use crate::types::FsId;

#[derive(Default)]
pub(crate) struct OpenFileRegistry {
    files: BTreeMap<FsId, Arc<OpenFile>>,
}

impl OpenFileRegistry {
    pub fn get(&self, id: FsId) -> Option<&Arc<OpenFile>> {
        self.files.get(&id)
    }

    /// Returns the record for `id`, inserting a fresh one at its position if
    /// absent. The second element is true when the record was created.
    pub fn get_or_insert_with(
        &mut self,
        id: FsId,
        make: impl FnOnce() -> Arc<OpenFile>,
    ) -> (Arc<OpenFile>, bool) {
        match self.files.entry(id) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(v) => {
                let of = make();
                v.insert(Arc::clone(&of));
                (of, true)
            }
        }
    }

    pub fn remove(&mut self, id: FsId) -> Option<Arc<OpenFile>> {
        self.files.remove(&id)
    }

    /// Moves a record to a new key when its identity changes (clean to
    /// modified, or promotion after upload).
    pub fn relink(&mut self, from: FsId, to: FsId) {
        if let Some(of) = self.files.remove(&from) {
            debug_assert!(!self.files.contains_key(&to));
            self.files.insert(to, of);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}
