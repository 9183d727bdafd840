use std::io;

use strum::FromRepr;

/// Error codes surfaced by the shim.
///
/// The discriminants are the POSIX errno values, see [`Errno::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
#[repr(i32)]
pub enum Errno {
    // EPERM
    #[error("operation not permitted")]
    NotPermitted = 1,
    // ENOENT
    #[error("no such file or directory")]
    NotFound = 2,
    // EIO
    #[error("input/output error")]
    Io = 5,
    // ENOMEM
    #[error("cannot allocate memory")]
    OutOfMemory = 12,
    // EBUSY
    #[error("device or resource busy")]
    ResourceBusy = 16,
    // EEXIST
    #[error("file exists")]
    AlreadyExists = 17,
    // EXDEV
    #[error("cross-device link")]
    CrossesDevices = 18,
    // ENOTDIR
    #[error("not a directory")]
    NotADirectory = 20,
    // EISDIR
    #[error("is a directory")]
    IsADirectory = 21,
    // EINVAL
    #[error("invalid argument")]
    InvalidInput = 22,
    // ENOSPC
    #[error("no space left on device")]
    StorageFull = 28,
    // EMLINK
    #[error("too many links")]
    TooManyLinks = 31,
    // ENAMETOOLONG
    #[error("file name too long")]
    InvalidFilename = 36,
    // ENOTEMPTY
    #[error("directory not empty")]
    DirectoryNotEmpty = 39,
    // EUCLEAN
    #[error("structure needs cleaning")]
    Corrupted = 117,
}

impl Errno {
    /// Returns the POSIX errno value.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<io::Error> for Errno {
    fn from(error: io::Error) -> Self {
        error
            .raw_os_error()
            .and_then(Self::from_repr)
            .unwrap_or(Self::Io)
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::NotFound.code(), 2);
        assert_eq!(Errno::StorageFull.code(), 28);
        assert_eq!(Errno::DirectoryNotEmpty.code(), 39);
        assert_eq!(Errno::from_repr(18), Some(Errno::CrossesDevices));
    }

    #[test]
    fn test_from_io_error() {
        assert_eq!(Errno::from(io::Error::from_raw_os_error(28)), Errno::StorageFull);
        assert_eq!(Errno::from(io::Error::other("boom")), Errno::Io);
    }
}
