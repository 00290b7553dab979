//! Permission and open-flag masks.

use bitflags::bitflags;

bitflags! {
    /// Coarse capability mask attached to every folder by the remote store.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// List and read entries.
        const READ = 1 << 0;
        /// Create new entries.
        const CREATE = 1 << 1;
        /// Modify existing entries (also required for same-folder renames).
        const MODIFY = 1 << 2;
        /// Remove entries.
        const DELETE = 1 << 3;
        const ALL = Self::READ.bits()
            | Self::CREATE.bits()
            | Self::MODIFY.bits()
            | Self::DELETE.bits();
    }
}

bitflags! {
    /// Kernel open flags the core inspects.
    #[derive(Debug, Copy, Clone)]
    pub struct OpenFlags: i32 {
        const READ_ONLY = libc::O_RDONLY;
        const WRITE_ONLY = libc::O_WRONLY;
        const READ_WRITE = libc::O_RDWR;
        const TRUNCATE = libc::O_TRUNC;
        const _ = !0;
    }
}

impl OpenFlags {
    /// True when the access mode requests write access.
    pub fn wants_write(self) -> bool {
        (self.bits() & libc::O_ACCMODE) != libc::O_RDONLY
    }

    pub fn truncates(self) -> bool {
        self.contains(OpenFlags::TRUNCATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_access_detection() {
        assert!(!OpenFlags::from_bits_retain(libc::O_RDONLY).wants_write());
        assert!(OpenFlags::from_bits_retain(libc::O_WRONLY).wants_write());
        assert!(OpenFlags::from_bits_retain(libc::O_RDWR).wants_write());
        assert!(OpenFlags::from_bits_retain(libc::O_RDWR | libc::O_TRUNC).truncates());
    }
}
