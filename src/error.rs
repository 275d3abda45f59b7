use std::{fmt, io};

/// Errors raised by the store, the node-reference layer, and the
/// storage log.
///
/// `KeyNotFound` is normal control flow for `get`/`delete` of an absent
/// key. The remaining variants are fatal for the operation in progress:
/// the tree is left at its last committed state, no new root is
/// published.
#[derive(Debug)]
pub enum Error {
    /// `get`/`delete` of a key that is not present in the tree.
    KeyNotFound,
    /// The storage log's bytes violate the on-disk format: a bad length
    /// prefix, a bad superblock checksum, a short read, or a node/value
    /// blob that failed to deserialize.
    CorruptLog(String),
    /// The underlying file failed a read, write, or flush.
    Io(io::Error),
    /// An algorithmic invariant broke, e.g. underflow resolution found
    /// neither a left nor a right sibling. Indicates a bug, not bad
    /// input.
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::CorruptLog(msg) => write!(f, "corrupt log: {}", msg),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::KeyNotFound, Error::KeyNotFound) => true,
            (Error::CorruptLog(a), Error::CorruptLog(b)) => a == b,
            (Error::InvariantViolation(a), Error::InvariantViolation(b)) => a == b,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
