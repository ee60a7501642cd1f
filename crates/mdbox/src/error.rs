use std::borrow::Cow;

use mdbox_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

use crate::BoxId;

/// Errors raised by the box cache.
///
/// Cloneable, so that the failure of an asynchronous task can be recorded on
/// the scheduler and also handed to whoever waits for that task.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum Error {
    /// A configuration value or call argument is unacceptable.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// A strict lookup found no box with this ID.
    #[error("box {0} is not known to the disk buffer")]
    NotFound(BoxId),

    /// An index lies outside the range a container was sized for.
    #[error("{what} {index} is out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    /// Reading or writing the backing file failed.
    #[error("I/O error on backing file: {0}")]
    Io(#[from] StorageError),

    /// The serialized controller state could not be produced or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation needs a backing file and none is attached.
    #[error("the disk buffer has no backing file")]
    NotFileBacked,

    /// The scheduler was aborted before the task could run.
    #[error("scheduler aborted: {0}")]
    Aborted(String),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Stable identifier for the kind of error.
    pub fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidArgument { .. } => Cow::from("InvalidArgument"),
            Self::NotFound(_) => Cow::from("NotFound"),
            Self::OutOfRange { .. } => Cow::from("OutOfRange"),
            Self::Io(_) => Cow::from("IoFailure"),
            Self::Serialization(_) => Cow::from("Serialization"),
            Self::NotFileBacked => Cow::from("NotFileBacked"),
            Self::Aborted(_) => Cow::from("Aborted"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
