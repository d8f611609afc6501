/// Coarse classification of an [`Error`](crate::Error), matching the error
/// table in the synchronization engine's error-handling design: callers that
/// need to branch on "was this a validation failure or something else"
/// (e.g. the server deciding whether a submit failure is client-visible)
/// match on this instead of downcasting the wrapped error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// `apply_operation` / encode / decode / schema check failed.
    Validation,
    /// The auth collaborator rejected or could not check credentials.
    Authentication,
    /// A client mutation was attempted before the transport opened.
    NotConnected,
    /// A transaction was attempted before the client reached `ready`.
    InvalidState,
    /// A pending transaction's per-tx timer expired.
    TransactionTimeout,
    /// `transform_operation` raised where it should have produced a result.
    Rebase,
    /// Transport-level failure (send/receive, heartbeat miss, closed socket).
    Connection,
    /// A version-gap monitor detected divergence and requested resync.
    StateDrift,
    /// Cold or hot storage I/O failed.
    Storage,
    /// Anything else, including errors absorbed via the blanket `From` impl.
    Other,
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::Other
    }
}
