use std::sync::Arc;
use std::time::Duration;

use quorum_common::types::{LogIndex, NodeId, Term};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::node::Event;
use super::rpc::{AppendEntriesArgs, AppendEntriesReply};
use super::transport::{self, Transport};

/// What a replicator does after handling one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    /// Send again right away; the peer is still behind after a full batch.
    Continue,
    /// Wait for the heartbeat tick or a new append.
    Wait,
    /// Leadership for this term is over.
    Stop,
}

/// Drives AppendEntries to a single peer for one leadership term.
///
/// The replicator owns this peer's `next_index`/`match_index` cursors. It
/// asks the replica for a batch starting at `next_index`, sends it outside
/// the replica's event loop, and reports every reply back so the replica
/// can advance `commit_index` or step down.
pub(crate) struct Replicator {
    pub(crate) peer: NodeId,
    pub(crate) term: Term,
    pub(crate) next_index: LogIndex,
    pub(crate) match_index: LogIndex,
    pub(crate) max_entries: usize,
    pub(crate) heartbeat: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) trigger: Arc<Notify>,
    pub(crate) cancel: CancellationToken,
}

impl Replicator {
    pub(crate) async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(args) = self.prepare().await else {
                break;
            };
            let prev_log_index = args.prev_log_index;
            let sent = args.entries.len();

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = transport::append_entries(&*self.transport, self.peer, args, self.rpc_timeout) => result,
            };

            let next = match outcome {
                Ok(reply) => self.on_reply(prev_log_index, sent, reply).await,
                Err(e) => {
                    tracing::trace!(peer = self.peer, term = self.term, error = %e, "AppendEntries failed");
                    Next::Wait
                }
            };

            match next {
                Next::Stop => break,
                Next::Continue => continue,
                Next::Wait => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                        _ = self.trigger.notified() => {}
                    }
                }
            }
        }

        tracing::debug!(
            peer = self.peer,
            term = self.term,
            match_index = self.match_index,
            "Replicator stopped"
        );
    }

    /// Ask the replica for the next AppendEntries; `None` once it is no
    /// longer leader of `self.term` or has shut down.
    async fn prepare(&self) -> Option<AppendEntriesArgs> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = Event::PrepareAppend {
            term: self.term,
            next_index: self.next_index,
            reply_tx,
        };
        self.events.send(event).await.ok()?;
        reply_rx.await.ok().flatten()
    }

    async fn on_reply(
        &mut self,
        prev_log_index: LogIndex,
        sent: usize,
        reply: AppendEntriesReply,
    ) -> Next {
        let matched = prev_log_index + sent as LogIndex;
        let newer_term = reply.term > self.term;
        let success = reply.success;
        let conflict_index = reply.conflict_index;

        let event = Event::AppendReply {
            peer: self.peer,
            term: self.term,
            matched,
            reply,
        };
        if self.events.send(event).await.is_err() || newer_term {
            return Next::Stop;
        }

        if success {
            self.match_index = self.match_index.max(matched);
            self.next_index = matched + 1;
            if sent > 0 && sent == self.max_entries {
                return Next::Continue;
            }
            return Next::Wait;
        }

        // Log mismatch: back off, directly to the hinted index when given.
        let floor = self.next_index.saturating_sub(1).max(1);
        self.next_index = match conflict_index {
            Some(hint) => hint.clamp(1, floor),
            None => floor,
        };
        tracing::debug!(
            peer = self.peer,
            term = self.term,
            next_index = self.next_index,
            "Follower log mismatch, backing off"
        );
        Next::Wait
    }
}
