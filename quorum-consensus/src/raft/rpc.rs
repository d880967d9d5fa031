use super::log::LogEntry;
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,               // Leader's term
    pub leader_id: NodeId,        // Leader's ID, so followers can redirect clients
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,      // Term of that entry
    pub entries: Vec<LogEntry>,   // New log entries to store (empty = heartbeat)
    pub leader_commit: LogIndex,  // Leader's commit index
}

impl AppendEntriesArgs {
    /// Index of the last entry carried, or `prev_log_index` for a heartbeat.
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower matched prev entry and stored entries
    /// Term of the follower's entry at `prev_log_index`, when it disagrees.
    pub conflict_term: Option<Term>,
    /// First index the leader should try next: the start of `conflict_term`
    /// in the follower's log, or one past its tail when the log is short.
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesReply {
    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: None,
        }
    }

    pub fn accepted(term: Term) -> Self {
        Self {
            success: true,
            ..Self::rejected(term)
        }
    }
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Every request one replica can send another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

/// Reply matching the `RpcRequest` variant it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

impl RpcRequest {
    pub fn term(&self) -> Term {
        match self {
            RpcRequest::RequestVote(args) => args.term,
            RpcRequest::AppendEntries(args) => args.term,
        }
    }

    pub fn encode(&self) -> quorum_common::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> quorum_common::error::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl RpcReply {
    pub fn encode(&self) -> quorum_common::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> quorum_common::error::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
