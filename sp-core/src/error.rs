use thiserror::Error;

/// Service-wide error set. The scheduler and workers match on these variants
/// to decide between retry, backoff, cleanup and terminal failure, so each
/// distinct reaction gets its own variant.
#[derive(Debug, Error, Clone, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
pub enum Error {
    /// Sentinel: the manager had no task compatible with the asker's limit.
    /// Workers sleep and re-ask; it is never logged as an error.
    #[error("no task to dispatch")]
    NoTaskMatchLimit,

    /// Sentinel: the reported task is no longer owned by the manager. The
    /// worker must stop mutating state immediately.
    #[error("task canceled")]
    CanceledTask,

    #[error("request lost")]
    DanglingTask,
    #[error("unexpected task type")]
    TypeMismatch,
    #[error("rpc call failed")]
    RpcUnknown,

    #[error("task queue exceed capacity")]
    QueueFull,
    #[error("task repeated")]
    TaskRepeated,

    #[error("reservation exceeds the resource limit")]
    ResourceLimitExceeded,

    #[error("seal object on chain failed")]
    Unsealed,
    #[error("wait seal object timeout")]
    SealTimeout,
    #[error("wait reject unseal object timeout")]
    RejectUnsealTimeout,
    /// Distinguishable absence of an object on chain; the reject-unseal
    /// listener treats it as evidence the object was rejected.
    #[error("no such object")]
    NoSuchObject,

    #[error("erasure encode failed: {0}")]
    ReplicateEncode(String),
    #[error("integrity hash verification failed")]
    InvalidIntegrity,
    #[error("secondary sp mismatch")]
    SecondaryMismatch,
    #[error("replicate idx out of bounds")]
    ReplicateIdxOutOfBounds,

    #[error("recovery only supports ec redundancy")]
    RecoveryRedundancyType,
    #[error("not enough pieces to recover")]
    RecoveryPieceNotEnough,
    #[error("ec decode failed")]
    RecoveryDecode,
    #[error("recovered piece checksum mismatch")]
    RecoveryPieceChecksum,
    #[error("recovered piece length out of range")]
    RecoveryPieceLength,
    #[error("recovery piece index invalid")]
    RecoveryPieceIndex,
    #[error("primary sp endpoint not found")]
    PrimaryNotFound,

    #[error("chain access failed: {0}")]
    Chain(String),
    #[error("db access failed: {0}")]
    Db(String),
    #[error("piece store access failed: {0}")]
    PieceStore(String),
    #[error("signer failed: {0}")]
    Signer(String),
    #[error("metadata access failed: {0}")]
    Metadata(String),
    #[error("gateway access failed: {0}")]
    Gateway(String),
}

impl Error {
    /// True for errors that should be silently retried after a sleep rather
    /// than surfaced.
    pub fn is_omitted(&self) -> bool {
        matches!(self, Error::NoTaskMatchLimit | Error::ResourceLimitExceeded)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
