use bitgate_consensus::QuorumError;
use bitgate_state::StoreError;
use bitgate_zk::ZkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Quorum(#[from] QuorumError),
    #[error(transparent)]
    Zk(#[from] ZkError),
    #[error("zk setup is not finalized, no verifier installed")]
    ZkNotReady,
    #[error("no UTXOs match proven address")]
    NoMatchingUtxos,
    #[error("entropy commitment does not match sha256(entropy || validator)")]
    CommitmentMismatch,
    #[error("validator {0} already submitted entropy")]
    AlreadySubmitted(String),
    #[error("entropy ceremony: {0}")]
    Ceremony(String),
    #[error("insufficient funds: balance {balance}, need {needed}")]
    InsufficientFunds { balance: u128, needed: u128 },
    #[error("block decode error: {0}")]
    BlockDecode(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Stable class name, used in logs and API responses.
    pub fn class(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::BlockDecode(_) | Self::Codec(_) => "invalid_request",
            Self::Unauthorized(_) | Self::Quorum(_) => "unauthorized",
            Self::NotFound(_) | Self::NoMatchingUtxos => "not_found",
            Self::Zk(_) | Self::CommitmentMismatch => "rejected",
            Self::ZkNotReady | Self::AlreadySubmitted(_) | Self::Ceremony(_) => "failed_precondition",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Store(_) | Self::Io(_) => "internal",
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
