use thiserror::Error;

/// Errors surfaced by the engine and its collaborators.
///
/// `NOT_FOUND` is a domain response, not an error, and never appears here.
/// Socket-level failures are handled locally (disconnect or reconnect) and
/// are not part of this enum either.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed command or arguments. The payload is the usage line shown
    /// to the client.
    #[error("usage {0}")]
    Usage(&'static str),

    /// Write command received by a replica.
    #[error("read_only")]
    ReadOnly,

    /// A WAL append could not be durably persisted.
    #[error("wal append failed: {0}")]
    Wal(#[source] std::io::Error),

    /// A snapshot could not be written. The previous snapshot stays valid.
    #[error("snapshot write failed: {0}")]
    Snapshot(#[source] std::io::Error),

    /// Task submitted to (or pending on) a worker pool that has shut down.
    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
