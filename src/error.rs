use thiserror::Error as ThisError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reason an operation stopped before producing its result.
///
/// Interrupts are delivered to pending calls and open streams on abort,
/// timeout or disconnect. They are cloneable so one event can be fanned out
/// to every waiter, and callers can match on them to silence expected
/// cancellations.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Interrupt {
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("read timed out")]
    TimedOut,
    #[error("connection closed: {0}")]
    Disconnected(String),
}

/// Enum representing the errors surfaced by the engine and its RPC layer.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed wire frame, response for an unknown request, or a payload
    /// that does not match the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Failure raised by the transport while sending. Kept distinct from
    /// handler errors; never re-encoded as a wire error payload.
    #[error("transport error: {0}")]
    Transport(String),
    /// Error reported by the remote peer for a call or stream.
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
    /// A streaming read was attempted on a handle that is already running
    /// one.
    #[error("store handle is busy with another streaming read")]
    StoreBusy,
    /// The pool bound was reached and the acquire policy is fail-fast.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Invalid identifier, filter arity/tag violation, or bad cursor shape.
    /// Raised before any I/O happens.
    #[error("query builder error: {0}")]
    Builder(String),
    #[error("method not supported: {0}")]
    UnknownMethod(String),
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
    /// Store-side failure that is not a SQLite error, e.g. a worker that
    /// went away mid-command.
    #[error("store error: {0}")]
    Store(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an expected cancellation rather than a fault.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }

    pub(crate) fn builder(msg: impl Into<String>) -> Self {
        Error::Builder(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
