use crate::TypeName;
use std::fmt::{Display, Formatter};
use std::io;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The stored page size, node layout or key/value types disagree with what was requested,
    /// or the page size is too small for the requested layout
    MetadataMismatch(String),
    /// The tree's key and value types don't match the ones it was created with
    TypeMismatch {
        key: TypeName,
        value: TypeName,
    },
    /// The tree file is corrupted
    Corrupted(String),
    /// A generation-safe pointer could not be resolved, or a seek could not reach a consistent
    /// view of the tree
    TreeInconsistency(String),
    /// The key being inserted exceeds the maximum key size
    KeyTooLarge(usize),
    /// The value being inserted exceeds the maximum value size
    ValueTooLarge(usize),
    /// The tree file is already opened by another handle
    TreeAlreadyOpen,
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MetadataMismatch(msg) => {
                write!(f, "Tree metadata mismatch: {msg}")
            }
            Error::TypeMismatch { key, value } => {
                write!(
                    f,
                    "Tree was created with key type {} and value type {}",
                    key.name(),
                    value.name()
                )
            }
            Error::Corrupted(msg) => {
                write!(f, "Tree corrupted: {msg}")
            }
            Error::TreeInconsistency(msg) => {
                write!(f, "Tree inconsistency: {msg}")
            }
            Error::KeyTooLarge(len) => {
                write!(
                    f,
                    "The key (length={len}) being inserted exceeds the maximum of {} bytes",
                    crate::tree_store::MAX_KEY_SIZE
                )
            }
            Error::ValueTooLarge(len) => {
                write!(
                    f,
                    "The value (length={len}) being inserted exceeds the maximum of {} bytes",
                    crate::tree_store::MAX_VALUE_SIZE
                )
            }
            Error::TreeAlreadyOpen => {
                write!(f, "Tree file is already open")
            }
            Error::Io(err) => {
                write!(f, "I/O error: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}
