use std::sync::Arc;

use parse_display::Display;

use crate::{ComputationKey, OperationId};

type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by computations, replicas and live states.
///
/// `Error` is cheap to clone: a failed computation is cached and handed to every
/// reader of the cell until the cell is invalidated.
#[non_exhaustive]
#[derive(Display, Debug, Clone)]
pub enum Error {
    /// The user computation returned an error. Cached like a value.
    #[display("computation failed: {0}")]
    ComputationFailed(Source),

    /// A computation read a cell that (transitively) depends on itself.
    #[display("detect cyclic dependency at `{key}`")]
    CyclicDependency { key: ComputationKey },

    /// A replica could not fetch the current value from its endpoint. Retryable.
    #[display("remote `{key}` unavailable: {reason}")]
    RemoteUnavailable { key: ComputationKey, reason: Arc<str> },

    /// The caller stopped waiting.
    #[display("cancelled")]
    Cancelled,

    /// A cell was read back as a different type than it was computed with.
    #[display("value of `{key}` has an unexpected type")]
    TypeMismatch { key: ComputationKey },

    /// No computation is registered under the operation id.
    #[display("unknown operation `{operation}`")]
    UnknownOperation { operation: OperationId },
}

impl Error {
    /// Creates a [`Error::ComputationFailed`] from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::ComputationFailed(Arc::new(Message(message.into())))
    }

    /// Creates a [`Error::ComputationFailed`] wrapping `source`.
    pub fn from_source(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::ComputationFailed(Arc::new(source))
    }

    pub fn remote_unavailable(key: ComputationKey, reason: impl std::fmt::Display) -> Self {
        Error::RemoteUnavailable {
            key,
            reason: reason.to_string().into(),
        }
    }

    /// Returns `true` if this error is a computation result that is stored in the cell.
    ///
    /// Cyclic dependencies, cancellation and transport failures are reported to the
    /// caller but leave the cell without a result, so the next read runs again.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Error::ComputationFailed(_) | Error::TypeMismatch { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ComputationFailed(source) => Some(&**source),
            _ => None,
        }
    }
}

#[derive(Display, Debug)]
#[display("{0}")]
struct Message(String);

impl std::error::Error for Message {}
