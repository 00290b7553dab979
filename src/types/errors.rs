//! Error handling for filesystem operations.
//!
//! Every operation surfaces failures as an [`FsError`] carrying the errno the
//! kernel reply should use. The few distinct failure classes the core produces
//! each get a constructor; anything else comes in through the
//! [`From<std::io::Error>`] conversion.

use std::fmt::{Debug, Display};
use std::io;

pub type FsResult<T> = Result<T, FsError>;

/// A POSIX error with an errno code and a human-readable message.
#[derive(Clone, PartialEq, Eq)]
pub struct FsError {
    code: i32,
    pub msg: String,
}

impl FsError {
    pub fn new<M: ToString>(code: i32, msg: M) -> Self {
        Self {
            code,
            msg: msg.to_string(),
        }
    }

    /// Path resolution failed; no overlay or committed entry matches.
    pub fn not_found<M: ToString>(msg: M) -> Self {
        Self::new(libc::ENOENT, msg)
    }

    /// The folder permission mask lacks the bit required by the operation.
    pub fn access_denied<M: ToString>(msg: M) -> Self {
        Self::new(libc::EACCES, msg)
    }

    /// Failure reading or writing the cache files, index file, or metadata
    /// store.
    pub fn io<M: ToString>(msg: M) -> Self {
        Self::new(libc::EIO, msg)
    }

    pub fn exists<M: ToString>(msg: M) -> Self {
        Self::new(libc::EEXIST, msg)
    }

    pub fn not_empty<M: ToString>(msg: M) -> Self {
        Self::new(libc::ENOTEMPTY, msg)
    }

    /// The errno value for the kernel reply.
    pub fn raw_error(&self) -> i32 {
        self.code
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        Self::new(e.raw_os_error().unwrap_or(libc::EIO), e.to_string())
    }
}

impl Debug for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsError")
            .field("code", &self.code)
            .field("msg", &self.msg)
            .finish()
    }
}

impl Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.msg.as_str() {
            "" => write!(f, "errno {}", self.code),
            _ => write!(f, "errno {}: {}", self.code, self.msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_carry_the_os_code() {
        let e = FsError::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.raw_error(), libc::ENOSPC);
    }

    #[test]
    fn constructors_map_to_errno() {
        assert_eq!(FsError::not_found("x").raw_error(), libc::ENOENT);
        assert_eq!(FsError::access_denied("x").raw_error(), libc::EACCES);
        assert_eq!(FsError::io("x").raw_error(), libc::EIO);
    }
}
