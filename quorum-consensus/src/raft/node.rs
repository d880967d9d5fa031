use std::sync::Arc;

use bytes::Bytes;
use quorum_common::error::{QuorumError, Result};
use quorum_common::metrics::{MetricsCollector, NoopMetrics};
use quorum_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

use super::apply::{ApplyMsg, ApplyPipeline};
use super::log::LogEntry;
use super::persist::{PersistentState, Persister};
use super::replication::Replicator;
use super::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcReply,
    RpcRequest,
};
use super::state::{Effects, RaftRole, ReplicaState, Status};
use super::timer::ElectionTimer;
use super::transport::{self, Transport};

const ELECTIONS_STARTED: &str = "raft.elections_started";
const LEADER_ELECTED: &str = "raft.leader_elected";
const STEPPED_DOWN: &str = "raft.stepped_down";
const ENTRIES_SUBMITTED: &str = "raft.entries_submitted";
const TERM: &str = "raft.term";
const COMMIT_INDEX: &str = "raft.commit_index";
const LAST_APPLIED: &str = "raft.last_applied";

/// Everything that reaches the replica's event loop.
pub(crate) enum Event {
    RequestVote {
        args: RequestVoteArgs,
        reply_tx: oneshot::Sender<Result<RequestVoteReply>>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply_tx: oneshot::Sender<Result<AppendEntriesReply>>,
    },
    Submit {
        command: Bytes,
        reply_tx: oneshot::Sender<Result<Submitted>>,
    },
    Status {
        reply_tx: oneshot::Sender<Status>,
    },
    /// A peer answered a RequestVote sent in `term`.
    VoteReply {
        peer: NodeId,
        term: Term,
        reply: RequestVoteReply,
    },
    /// A replicator wants the next AppendEntries for its peer.
    PrepareAppend {
        term: Term,
        next_index: LogIndex,
        reply_tx: oneshot::Sender<Option<AppendEntriesArgs>>,
    },
    /// A peer answered an AppendEntries sent in `term`.
    AppendReply {
        peer: NodeId,
        term: Term,
        matched: LogIndex,
        reply: AppendEntriesReply,
    },
    FetchCommitted {
        from: LogIndex,
        max: usize,
        reply_tx: oneshot::Sender<Vec<LogEntry>>,
    },
    Applied {
        index: LogIndex,
    },
}

/// Where a submitted command landed. Durability is only promised once the
/// index comes out of the apply channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub index: LogIndex,
    pub term: Term,
}

/// Handle to a running replica. Cheap to clone; every clone talks to the
/// same event loop.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    done: watch::Receiver<bool>,
}

impl RaftNode {
    /// Restore the replica from `persister` and start its event loop and
    /// apply pipeline on the current tokio runtime.
    pub fn start(
        id: NodeId,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        Self::start_with_metrics(id, config, transport, persister, apply_tx, Arc::new(NoopMetrics))
    }

    pub fn start_with_metrics(
        id: NodeId,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.nodes.contains(&id) {
            return Err(QuorumError::Config(format!(
                "node {id} is not a member of {:?}",
                config.nodes
            )));
        }

        let saved = match persister.load()? {
            Some(bytes) => PersistentState::decode(&bytes)?,
            None => PersistentState::default(),
        };
        let state = ReplicaState::restore(id, config.peers_of(id), saved);
        tracing::info!(
            node_id = id,
            term = state.current_term,
            last_log_index = state.log.last_index(),
            "Replica starting"
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let (commit_tx, commit_rx) = watch::channel(0);
        let (done_tx, done_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let pipeline = ApplyPipeline {
            node_id: id,
            commit_rx,
            events: events_tx.clone(),
            sink: apply_tx,
            shutdown: shutdown.clone(),
            batch: config.max_append_entries,
            last_applied: 0,
        };
        let core = RaftCore {
            timer: ElectionTimer::new(config.election_timeout()),
            state,
            config,
            transport,
            persister,
            metrics,
            events_tx: events_tx.clone(),
            commit_tx,
            done_tx,
            shutdown: shutdown.clone(),
            leadership: None,
            dirty: false,
        };

        tokio::spawn(core.run(events_rx));
        tokio::spawn(pipeline.run());

        Ok(Self {
            id,
            events: events_tx,
            shutdown,
            done: done_rx,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Append `command` to the leader's log. Returns as soon as the entry is
    /// in the local log; a non-leader answers `NotLeader` with a hint.
    pub async fn submit(&self, command: impl Into<Bytes>) -> Result<Submitted> {
        let command = command.into();
        self.request(|reply_tx| Event::Submit { command, reply_tx })
            .await?
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(|reply_tx| Event::Status { reply_tx }).await
    }

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.request(|reply_tx| Event::RequestVote { args, reply_tx })
            .await?
    }

    pub async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        self.request(|reply_tx| Event::AppendEntries { args, reply_tx })
            .await?
    }

    /// Single entry point for a transport server.
    pub async fn handle_rpc(&self, request: RpcRequest) -> Result<RpcReply> {
        match request {
            RpcRequest::RequestVote(args) => {
                self.handle_request_vote(args).await.map(RpcReply::RequestVote)
            }
            RpcRequest::AppendEntries(args) => self
                .handle_append_entries(args)
                .await
                .map(RpcReply::AppendEntries),
        }
    }

    /// Stop the replica for good. In-flight peer calls are abandoned; the
    /// call returns once the event loop has exited and saved nothing further.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut done = self.done.clone();
        // Err means the loop already dropped its sender, which also means done.
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        if self.shutdown.is_cancelled() {
            return Err(QuorumError::Stopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(make(reply_tx))
            .await
            .map_err(|_| QuorumError::Stopped)?;
        reply_rx.await.map_err(|_| QuorumError::Stopped)
    }
}

/// Per-term leader bookkeeping: cancelling `token` ends every replicator.
struct Leadership {
    token: CancellationToken,
    triggers: Vec<Arc<Notify>>,
}

/// The replica's event loop. Owns all mutable consensus state; everything
/// else reaches it through `Event`s, so nothing here is ever locked and no
/// network call is awaited while handling an event.
struct RaftCore {
    state: ReplicaState,
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    metrics: Arc<dyn MetricsCollector>,
    timer: ElectionTimer,
    events_tx: mpsc::Sender<Event>,
    commit_tx: watch::Sender<LogIndex>,
    done_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    leadership: Option<Leadership>,
    // Memory is ahead of the persister until a save succeeds
    dirty: bool,
}

impl RaftCore {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            let election_due = self.timer.deadline();
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event),
                _ = tokio::time::sleep_until(election_due), if !self.state.is_leader() => {
                    self.start_election();
                }
            }
        }

        self.state.stop();
        self.end_leadership();
        tracing::info!(node_id = self.state.id, term = self.state.current_term, "Replica stopped");
        let _ = self.done_tx.send(true);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RequestVote { args, reply_tx } => {
                let (reply, fx) = self.state.handle_request_vote(&args);
                let result = self.apply_effects(fx).map(|()| reply);
                let _ = reply_tx.send(result);
            }
            Event::AppendEntries { args, reply_tx } => {
                let (reply, fx) = self.state.handle_append_entries(args);
                let result = self.apply_effects(fx).map(|()| reply);
                let _ = reply_tx.send(result);
            }
            Event::Submit { command, reply_tx } => {
                let _ = reply_tx.send(self.submit(command));
            }
            Event::Status { reply_tx } => {
                let _ = reply_tx.send(self.state.status());
            }
            Event::VoteReply { peer, term, reply } => {
                let fx = self.state.handle_vote_reply(peer, term, &reply);
                if let Err(e) = self.apply_effects(fx) {
                    tracing::error!(node_id = self.state.id, error = %e, "Failed to persist after vote reply");
                }
            }
            Event::PrepareAppend {
                term,
                next_index,
                reply_tx,
            } => {
                let args =
                    self.state
                        .prepare_append(term, next_index, self.config.max_append_entries);
                let _ = reply_tx.send(args);
            }
            Event::AppendReply {
                peer,
                term,
                matched,
                reply,
            } => {
                let fx = self.state.handle_append_reply(peer, term, matched, &reply);
                if let Err(e) = self.apply_effects(fx) {
                    tracing::error!(node_id = self.state.id, error = %e, "Failed to persist after append reply");
                }
            }
            Event::FetchCommitted {
                from,
                max,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.state.committed_entries(from, max));
            }
            Event::Applied { index } => {
                self.state.record_applied(index);
                self.metrics.observe_gauge(LAST_APPLIED, index as f64);
            }
        }
    }

    fn submit(&mut self, command: Bytes) -> Result<Submitted> {
        let (index, term) = self.state.append_command(command)?;
        if let Err(e) = self.persist() {
            // Never acknowledged and never durable: take it back.
            self.state.log.truncate_from(index);
            return Err(e);
        }
        self.metrics.inc_counter(ENTRIES_SUBMITTED);
        tracing::debug!(node_id = self.state.id, index, term, "Appended command to log");

        if self.state.advance_commit() {
            self.publish_commit();
        }
        if let Some(leadership) = &self.leadership {
            for trigger in &leadership.triggers {
                trigger.notify_one();
            }
        }
        Ok(Submitted { index, term })
    }

    /// Carry out what a state transition asked for. Persistence comes first;
    /// its error is returned so a reply that depends on it is withheld.
    ///
    /// While an earlier save is outstanding every transition saves again, so
    /// a retransmitted request is never answered from state that only lives
    /// in memory. Nothing is published to the apply pipeline and no
    /// leadership begins until the state is durable.
    fn apply_effects(&mut self, mut fx: Effects) -> Result<()> {
        let persisted = if fx.persist || self.dirty {
            self.persist()
        } else {
            Ok(())
        };

        if persisted.is_err() && fx.became_leader {
            let term = self.state.current_term;
            fx.merge(self.state.become_follower(term));
            fx.became_leader = false;
            tracing::warn!(node_id = self.state.id, term, "Won election but cannot persist, not leading");
        }
        if fx.stepped_down {
            self.end_leadership();
            self.metrics.inc_counter(STEPPED_DOWN);
            tracing::info!(node_id = self.state.id, term = self.state.current_term, "Stepped down to follower");
        }
        if fx.became_leader {
            self.begin_leadership();
        }
        if fx.reset_timer {
            self.timer.reset();
        }
        if persisted.is_ok() && self.state.commit_index > *self.commit_tx.borrow() {
            self.publish_commit();
        }
        persisted
    }

    fn persist(&mut self) -> Result<()> {
        self.dirty = true;
        let blob = self.state.persistent().encode()?;
        if let Err(e) = self.persister.save(&blob) {
            tracing::error!(node_id = self.state.id, error = %e, "Failed to persist replica state");
            return Err(e);
        }
        self.dirty = false;
        self.metrics.observe_gauge(TERM, self.state.current_term as f64);
        Ok(())
    }

    fn publish_commit(&mut self) {
        let commit_index = self.state.commit_index;
        self.commit_tx.send_replace(commit_index);
        self.metrics.observe_gauge(COMMIT_INDEX, commit_index as f64);
        tracing::debug!(node_id = self.state.id, commit_index, "Commit index advanced");
    }

    fn start_election(&mut self) {
        let fx = self.state.become_candidate();
        let term = self.state.current_term;
        self.metrics.inc_counter(ELECTIONS_STARTED);
        tracing::info!(node_id = self.state.id, term, "Election timeout, starting election");

        if let Err(e) = self.apply_effects(fx) {
            // Our own vote is not durable; sit this term out and retry on the next timeout.
            tracing::error!(node_id = self.state.id, term, error = %e, "Cannot persist candidacy");
            return;
        }
        if fx.became_leader {
            return;
        }

        let args = RequestVoteArgs {
            term,
            candidate_id: self.state.id,
            last_log_index: self.state.log.last_index(),
            last_log_term: self.state.log.last_term(),
        };
        for &peer in &self.state.peers {
            let args = args.clone();
            let transport = Arc::clone(&self.transport);
            let events = self.events_tx.clone();
            let shutdown = self.shutdown.clone();
            let limit = self.config.rpc_timeout();

            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = transport::request_vote(&*transport, peer, args, limit) => result,
                };
                match outcome {
                    Ok(reply) => {
                        let _ = events.send(Event::VoteReply { peer, term, reply }).await;
                    }
                    Err(e) => {
                        tracing::trace!(peer, term, error = %e, "RequestVote failed");
                    }
                }
            });
        }
    }

    /// Spawn one replicator per peer, starting right away so leadership is
    /// asserted before any follower times out.
    fn begin_leadership(&mut self) {
        self.end_leadership();

        let term = self.state.current_term;
        let token = self.shutdown.child_token();
        let mut triggers = Vec::with_capacity(self.state.peers.len());
        for &peer in &self.state.peers {
            let trigger = Arc::new(Notify::new());
            let replicator = Replicator {
                peer,
                term,
                next_index: self.state.log.last_index() + 1,
                match_index: 0,
                max_entries: self.config.max_append_entries,
                heartbeat: self.config.heartbeat_interval(),
                rpc_timeout: self.config.rpc_timeout(),
                transport: Arc::clone(&self.transport),
                events: self.events_tx.clone(),
                trigger: Arc::clone(&trigger),
                cancel: token.clone(),
            };
            tokio::spawn(replicator.run());
            triggers.push(trigger);
        }
        self.leadership = Some(Leadership { token, triggers });

        self.metrics.inc_counter(LEADER_ELECTED);
        tracing::info!(
            node_id = self.state.id,
            term,
            last_log_index = self.state.log.last_index(),
            "Became leader"
        );
    }

    fn end_leadership(&mut self) {
        if let Some(leadership) = self.leadership.take() {
            leadership.token.cancel();
        }
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
