//! Outbound RPC seam between replicas.
//!
//! A transport delivers one request to one peer and hands back its reply.
//! It is assumed lossy and at-most-once: an `Err` means the outcome is
//! unknown (the peer may or may not have processed the request), which is
//! always safe to retry. The consensus core never retries on its own; the
//! leader's periodic replication trigger and the election timer do.

use std::time::Duration;

use async_trait::async_trait;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::NodeId;

use super::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcReply,
    RpcRequest,
};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `request` to `peer` and wait for its reply.
    async fn call(&self, peer: NodeId, request: RpcRequest) -> Result<RpcReply>;
}

/// Bounds a call by `limit`, mapping expiry to `QuorumError::Timeout`.
pub async fn call_with_timeout(
    transport: &dyn Transport,
    peer: NodeId,
    request: RpcRequest,
    limit: Duration,
) -> Result<RpcReply> {
    match tokio::time::timeout(limit, transport.call(peer, request)).await {
        Ok(result) => result,
        Err(_) => Err(QuorumError::Timeout(peer)),
    }
}

pub async fn request_vote(
    transport: &dyn Transport,
    peer: NodeId,
    args: RequestVoteArgs,
    limit: Duration,
) -> Result<RequestVoteReply> {
    match call_with_timeout(transport, peer, RpcRequest::RequestVote(args), limit).await? {
        RpcReply::RequestVote(reply) => Ok(reply),
        RpcReply::AppendEntries(_) => Err(QuorumError::Codec(format!(
            "peer {peer} answered RequestVote with an AppendEntries reply"
        ))),
    }
}

pub async fn append_entries(
    transport: &dyn Transport,
    peer: NodeId,
    args: AppendEntriesArgs,
    limit: Duration,
) -> Result<AppendEntriesReply> {
    match call_with_timeout(transport, peer, RpcRequest::AppendEntries(args), limit).await? {
        RpcReply::AppendEntries(reply) => Ok(reply),
        RpcReply::RequestVote(_) => Err(QuorumError::Codec(format!(
            "peer {peer} answered AppendEntries with a RequestVote reply"
        ))),
    }
}
