use crate::types::NodeId;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Not the leader, current leader is node {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Replica has been stopped")]
    Stopped,

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Call to peer {0} timed out")]
    Timeout(NodeId),

    #[error("Unsupported persisted state version: {0}")]
    UnsupportedFormat(u32),
}

pub type Result<T> = std::result::Result<T, QuorumError>;

impl From<bincode::Error> for QuorumError {
    fn from(err: bincode::Error) -> Self {
        QuorumError::Codec(err.to_string())
    }
}

impl QuorumError {
    /// Transport-level failures leave the outcome unresolved and are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuorumError::Unreachable(_) | QuorumError::Timeout(_))
    }
}
