//! Path resolution over the committed tree merged with pending tasks.
//!
//! Walks a slash-separated path from the root folder, applying the same
//! precedence as directory listings at every step: a pending mkdir supplies
//! the folder, an rmdir tombstone hides the committed row, otherwise the
//! committed row is used. Effective permissions are the intersection of the
//! masks along the walk; folders that exist only as tasks inherit the mask of
//! their nearest committed ancestor.

use crate::overlay::OverlayStore;
use crate::store::MetaDb;
use crate::types::{FsId, Permissions};

/// A resolved path: the folder holding the final component, the component
/// itself, and the effective permissions of that folder.
#[derive(Debug, Clone)]
pub(crate) struct FsPath {
    pub folderid: FsId,
    pub name: String,
    pub permissions: Permissions,
}

pub(crate) fn is_root(path: &str) -> bool {
    path.split('/').all(|c| c.is_empty())
}

/// Resolves a full path to a folder id and its effective permissions.
pub(crate) fn resolve_folder(
    db: &dyn MetaDb,
    overlays: &OverlayStore,
    path: &str,
) -> Option<(FsId, Permissions)> {
    let mut id = FsId::ROOT;
    let mut perms = root_permissions(db);
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let (next, next_perms) = child_folder(db, overlays, id, perms, comp)?;
        id = next;
        perms = next_perms;
    }
    Some((id, perms))
}

/// Resolves a path to its parent folder plus basename. The root itself has no
/// parent and resolves to `None`.
pub(crate) fn resolve_parent(
    db: &dyn MetaDb,
    overlays: &OverlayStore,
    path: &str,
) -> Option<FsPath> {
    let trimmed = path.trim_end_matches('/');
    let (dir, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let (folderid, permissions) = resolve_folder(db, overlays, dir)?;
    Some(FsPath {
        folderid,
        name: name.to_string(),
        permissions,
    })
}

fn root_permissions(db: &dyn MetaDb) -> Permissions {
    db.folder_by_id(0)
        .map(|row| row.permissions)
        .unwrap_or(Permissions::ALL)
}

fn child_folder(
    db: &dyn MetaDb,
    overlays: &OverlayStore,
    parent: FsId,
    parent_perms: Permissions,
    name: &str,
) -> Option<(FsId, Permissions)> {
    if let Some(mk) = overlays.find_mkdir(parent, name) {
        let perms = match mk.folderid.committed_id() {
            Some(id) => db.folder_by_id(id)?.permissions & parent_perms,
            None => parent_perms,
        };
        return Some((mk.folderid, perms));
    }
    if overlays.has_rmdir(parent, name) {
        return None;
    }
    let parent_id = parent.committed_id()?;
    let row = db.folder_by_name(parent_id, name)?;
    Some((FsId::Committed(row.id), row.permissions & parent_perms))
}
