//! Error taxonomy shared by the DAL, the transaction envelope, and the
//! filesystem handlers. Kinds map onto the POSIX errno values the kernel
//! expects back from a FUSE callback.

use libc::{EBADF, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOMEM, ENOTDIR, ENOTEMPTY, EPERM, EROFS};
use std::fmt;

/// The small error taxonomy PgFuse propagates out of every DAL call.
///
/// `Io` is the catch-all for anything the database surfaced that doesn't map
/// to one of the named kinds: connection loss, a constraint violation we
/// didn't anticipate, a malformed row. It always becomes `EIO`.
#[derive(Debug)]
pub enum PgfuseError {
    NotFound,
    AlreadyExists,
    IsDirectory,
    NotDirectory,
    /// unlink() called on a directory
    NotPermitted,
    NotEmpty,
    InvalidHandle,
    ReadOnly,
    OutOfMemory,
    BadArgument,
    Io(String),
}

impl PgfuseError {
    pub fn to_errno(&self) -> i32 {
        match self {
            PgfuseError::NotFound => ENOENT,
            PgfuseError::AlreadyExists => EEXIST,
            PgfuseError::IsDirectory => EISDIR,
            PgfuseError::NotDirectory => ENOTDIR,
            PgfuseError::NotPermitted => EPERM,
            PgfuseError::NotEmpty => ENOTEMPTY,
            PgfuseError::InvalidHandle => EBADF,
            PgfuseError::ReadOnly => EROFS,
            PgfuseError::OutOfMemory => ENOMEM,
            PgfuseError::BadArgument => EINVAL,
            PgfuseError::Io(_) => EIO,
        }
    }
}

impl fmt::Display for PgfuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgfuseError::NotFound => write!(f, "no such file or directory"),
            PgfuseError::AlreadyExists => write!(f, "file exists"),
            PgfuseError::IsDirectory => write!(f, "is a directory"),
            PgfuseError::NotDirectory => write!(f, "not a directory"),
            PgfuseError::NotPermitted => write!(f, "operation not permitted"),
            PgfuseError::NotEmpty => write!(f, "directory not empty"),
            PgfuseError::InvalidHandle => write!(f, "bad file descriptor"),
            PgfuseError::ReadOnly => write!(f, "read-only filesystem"),
            PgfuseError::OutOfMemory => write!(f, "out of memory"),
            PgfuseError::BadArgument => write!(f, "invalid argument"),
            PgfuseError::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for PgfuseError {}

/// Unexpected database failures (connection loss, query failure) always
/// surface as `Io`; recognized SQLSTATEs are upgraded to a specific kind by
/// the DAL call sites that know which constraint they just tripped.
impl From<postgres::Error> for PgfuseError {
    fn from(e: postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            match db_err.code() {
                &postgres::error::SqlState::UNIQUE_VIOLATION => return PgfuseError::AlreadyExists,
                &postgres::error::SqlState::FOREIGN_KEY_VIOLATION => return PgfuseError::NotEmpty,
                _ => {}
            }
        }
        PgfuseError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PgfuseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_kinds_to_their_errno() {
        assert_eq!(PgfuseError::NotFound.to_errno(), ENOENT);
        assert_eq!(PgfuseError::AlreadyExists.to_errno(), EEXIST);
        assert_eq!(PgfuseError::IsDirectory.to_errno(), EISDIR);
        assert_eq!(PgfuseError::NotDirectory.to_errno(), ENOTDIR);
        assert_eq!(PgfuseError::NotPermitted.to_errno(), EPERM);
        assert_eq!(PgfuseError::NotEmpty.to_errno(), ENOTEMPTY);
        assert_eq!(PgfuseError::InvalidHandle.to_errno(), EBADF);
        assert_eq!(PgfuseError::ReadOnly.to_errno(), EROFS);
        assert_eq!(PgfuseError::OutOfMemory.to_errno(), ENOMEM);
        assert_eq!(PgfuseError::BadArgument.to_errno(), EINVAL);
        assert_eq!(PgfuseError::Io("x".into()).to_errno(), EIO);
    }
}
