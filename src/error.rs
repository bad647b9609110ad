use core::fmt;

/// Errors reported by the driver. Generic over the backing store's own error
/// type so that I/O failures propagate unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// Structural damage: bad magic, impossible geometry, a looping cluster
    /// chain, an invalid FAT entry. Fatal for the containing operation.
    Corrupt(&'static str),
    /// A path component does not exist.
    NotFound,
    /// An entry with the same (case-insensitive) name already exists.
    AlreadyExists,
    /// The operation expected a file but found a directory.
    IsDirectory,
    /// The operation expected a directory but found a file.
    NotADirectory,
    /// `rmdir` on a directory that still has entries.
    DirectoryNotEmpty,
    /// The allocator cannot satisfy the request.
    NoSpace,
    /// The file size would exceed 4 GiB - 1.
    TooBig,
    /// A write was attempted on a handle opened read-only.
    ReadOnly,
    /// The backing store failed; carries its error unchanged.
    Io(E),
    /// Illegal name or argument (`.`, `..`, empty, contains `/`, ...).
    InvalidInput(&'static str),
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(what) => write!(f, "corrupt filesystem: {what}"),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::AlreadyExists => write!(f, "entry already exists"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
            Self::NoSpace => write!(f, "no space left on filesystem"),
            Self::TooBig => write!(f, "file too big"),
            Self::ReadOnly => write!(f, "filesystem is read-only"),
            Self::Io(err) => write!(f, "backing store error: {err:?}"),
            Self::InvalidInput(what) => write!(f, "invalid argument: {what}"),
        }
    }
}
