use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io::ErrorKind;
use thiserror::Error;

/// An error that can occur when using a record file.
#[derive(Clone, Error, Debug, PartialEq, Eq, Serialize)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    #[serde(serialize_with = "serialize_io_error")]
    StdIo(ErrorKind),

    /// Read ended before the full request length.
    #[error("The read would have returned less data than requested.")]
    ShortRead,

    /// The requested range lies (partly) beyond the end of the file.
    #[error("Range of {size} bytes at offset {offset} extends past the end of the {len}-byte file.")]
    OutOfBounds { offset: u64, size: u64, len: u64 },

    /// A block handed back to the free-space map overlaps a block that is
    /// already free.
    #[error("Freed block of length {len} at offset {offset} overlaps free space.")]
    OverlappingFree { offset: u64, len: u64 },
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

#[cfg(target_family = "unix")]
impl From<nix::Error> for StorageError {
    fn from(value: nix::Error) -> Self {
        Self::StdIo(std::io::Error::from(value).kind())
    }
}

fn serialize_io_error<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("IOError", 1)?;
    ser.serialize_field("kind", &kind.to_string())?;
    ser.end()
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::ShortRead => ErrorKind::UnexpectedEof,
            StorageError::OutOfBounds { .. } => ErrorKind::UnexpectedEof,
            StorageError::OverlappingFree { .. } => ErrorKind::InvalidInput,
        }
    }
}
