use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{LogIndex, NodeId, Term};

use super::log::{LogEntry, RaftLog};
use super::persist::PersistentState;
use super::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

/// Possible roles a Raft replica can assume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// Terminal; entered only through an explicit stop.
    Stopped,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
            RaftRole::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the driver of a `ReplicaState` must do after a transition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Effects {
    /// Term, vote or log changed and must be saved before replying.
    pub persist: bool,
    pub reset_timer: bool,
    /// Left the leader or candidate role.
    pub stepped_down: bool,
    pub became_leader: bool,
    pub commit_advanced: bool,
}

impl Effects {
    pub(crate) fn merge(&mut self, other: Effects) {
        self.persist |= other.persist;
        self.reset_timer |= other.reset_timer;
        self.stepped_down |= other.stepped_down;
        self.became_leader |= other.became_leader;
        self.commit_advanced |= other.commit_advanced;
    }
}

/// Point-in-time view of a replica, as returned by `RaftNode::status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub term: Term,
    pub role: RaftRole,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// Term, vote, role and commit bookkeeping for one replica.
///
/// Every method is synchronous and side-effect free outside `self`; the
/// returned `Effects` tell the caller what to persist, re-arm or notify.
///
/// # Safety invariants
///
/// - Election safety: one vote per term (`voted_for` is only reset when the
///   term strictly increases) and a strict majority to win.
/// - Leader append-only: `append_command` is the only way a leader's log
///   grows; truncation happens in `handle_append_entries`, which always
///   demotes to follower first.
/// - Log matching: AppendEntries is refused unless the entry at
///   `prev_log_index` carries `prev_log_term`.
/// - Leader completeness: votes go only to candidates whose log is at least
///   as up to date, and `advance_commit` counts replicas only for entries of
///   the current term.
/// - `current_term` and `commit_index` never decrease.
#[derive(Debug)]
pub struct ReplicaState {
    pub id: NodeId,
    pub peers: Vec<NodeId>,

    // Persistent state
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,

    // Volatile state
    pub role: RaftRole,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,

    votes: HashSet<NodeId>,
    // Leader only: highest index known replicated on each peer
    match_index: HashMap<NodeId, LogIndex>,
}

impl ReplicaState {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self::restore(id, peers, PersistentState::default())
    }

    /// Rebuild a follower from what it last persisted.
    pub fn restore(id: NodeId, peers: Vec<NodeId>, saved: PersistentState) -> Self {
        Self {
            id,
            peers,
            current_term: saved.current_term,
            voted_for: saved.voted_for,
            log: saved.into_log(),
            role: RaftRole::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes: HashSet::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn persistent(&self) -> PersistentState {
        PersistentState::capture(self.current_term, self.voted_for, &self.log)
    }

    /// Strict majority of the whole cluster, self included.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.id,
            term: self.current_term,
            role: self.role,
            is_leader: self.is_leader(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    /// Step down to follower, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: Term) -> Effects {
        let mut fx = Effects::default();
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            fx.persist = true;
        }
        if matches!(self.role, RaftRole::Leader | RaftRole::Candidate) {
            fx.stepped_down = true;
            fx.reset_timer = true;
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
        self.match_index.clear();
        fx
    }

    /// Start an election: new term, vote for self. Wins outright in a
    /// single-member cluster.
    pub fn become_candidate(&mut self) -> Effects {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.match_index.clear();
        self.votes.clear();
        self.votes.insert(self.id);

        let mut fx = Effects {
            persist: true,
            reset_timer: true,
            ..Default::default()
        };
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            fx.became_leader = true;
        }
        fx
    }

    /// Promote to leader once the election is won.
    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.match_index = self.peers.iter().map(|p| (*p, 0)).collect();
    }

    pub fn stop(&mut self) {
        self.role = RaftRole::Stopped;
        self.votes.clear();
        self.match_index.clear();
    }

    /// Handles RequestVote RPC
    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, Effects) {
        // 1. Reject if term is older
        if args.term < self.current_term {
            return (
                RequestVoteReply {
                    term: self.current_term,
                    vote_granted: false,
                },
                Effects::default(),
            );
        }

        // 2. A newer term always demotes us first
        let mut fx = Effects::default();
        if args.term > self.current_term {
            fx.merge(self.become_follower(args.term));
        }

        // 3. One vote per term, only for an up-to-date log
        let free_to_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let up_to_date = self
            .log
            .is_up_to_date(args.last_log_index, args.last_log_term);
        let granted = free_to_vote && up_to_date;

        if granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                fx.persist = true;
            }
            fx.reset_timer = true;
        }

        tracing::debug!(
            node_id = self.id,
            candidate = args.candidate_id,
            term = args.term,
            granted,
            up_to_date,
            "RequestVote decided"
        );

        (
            RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
            },
            fx,
        )
    }

    /// Handles AppendEntries RPC as a follower
    pub fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> (AppendEntriesReply, Effects) {
        // 1. Reject if term is older
        if args.term < self.current_term {
            return (AppendEntriesReply::rejected(self.current_term), Effects::default());
        }

        // 2. Accept the sender as leader of this term
        let mut fx = Effects::default();
        if args.term > self.current_term || self.role != RaftRole::Follower {
            fx.merge(self.become_follower(args.term));
        }
        self.leader_id = Some(args.leader_id);
        fx.reset_timer = true;

        // 3. Validate previous entry consistency
        match self.log.term_at(args.prev_log_index) {
            None => {
                let reply = AppendEntriesReply {
                    conflict_index: Some(self.log.last_index() + 1),
                    ..AppendEntriesReply::rejected(self.current_term)
                };
                tracing::debug!(
                    node_id = self.id,
                    prev_log_index = args.prev_log_index,
                    last_index = self.log.last_index(),
                    "AppendEntries rejected, log too short"
                );
                return (reply, fx);
            }
            Some(term) if term != args.prev_log_term => {
                let reply = AppendEntriesReply {
                    conflict_term: Some(term),
                    conflict_index: Some(self.log.first_index_of_term(term, args.prev_log_index)),
                    ..AppendEntriesReply::rejected(self.current_term)
                };
                tracing::debug!(
                    node_id = self.id,
                    prev_log_index = args.prev_log_index,
                    expected = args.prev_log_term,
                    found = term,
                    "AppendEntries rejected, term mismatch"
                );
                return (reply, fx);
            }
            Some(_) => {}
        }

        let contiguous = args
            .entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == args.prev_log_index + 1 + i as LogIndex);
        if !contiguous {
            tracing::warn!(
                node_id = self.id,
                leader = args.leader_id,
                "AppendEntries rejected, entries not contiguous"
            );
            return (AppendEntriesReply::rejected(self.current_term), fx);
        }

        // 4. Append new entries, replacing a conflicting suffix
        let last_new = args.last_index();
        let leader_commit = args.leader_commit;
        for entry in args.entries {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        tracing::warn!(
                            node_id = self.id,
                            index = entry.index,
                            commit_index = self.commit_index,
                            "AppendEntries rejected, would overwrite a committed entry"
                        );
                        return (AppendEntriesReply::rejected(self.current_term), fx);
                    }
                    tracing::debug!(node_id = self.id, from = entry.index, "Truncating conflicting suffix");
                    self.log.truncate_from(entry.index);
                    self.log.append(entry);
                    fx.persist = true;
                }
                None => {
                    self.log.append(entry);
                    fx.persist = true;
                }
            }
        }

        // 5. Update commit index, bounded by what this request proved to match
        if leader_commit > self.commit_index {
            let new_commit = leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                fx.commit_advanced = true;
            }
        }

        (AppendEntriesReply::accepted(self.current_term), fx)
    }

    /// Builds the next AppendEntries for `peer`, or `None` once this replica
    /// is no longer the leader of `term`.
    pub fn prepare_append(
        &self,
        term: Term,
        next_index: LogIndex,
        max_entries: usize,
    ) -> Option<AppendEntriesArgs> {
        if self.role != RaftRole::Leader || self.current_term != term {
            return None;
        }
        let next_index = next_index.clamp(1, self.log.last_index() + 1);
        let prev_log_index = next_index - 1;
        Some(AppendEntriesArgs {
            term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next_index, max_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Called when a peer answers an AppendEntries sent in `sent_term`.
    /// `matched` is the index the peer now holds if the reply is a success.
    pub fn handle_append_reply(
        &mut self,
        peer: NodeId,
        sent_term: Term,
        matched: LogIndex,
        reply: &AppendEntriesReply,
    ) -> Effects {
        if reply.term > self.current_term {
            return self.become_follower(reply.term);
        }
        if self.role != RaftRole::Leader || sent_term != self.current_term || !reply.success {
            return Effects::default();
        }

        let slot = self.match_index.entry(peer).or_insert(0);
        if matched > *slot {
            *slot = matched;
        }
        Effects {
            commit_advanced: self.advance_commit(),
            ..Default::default()
        }
    }

    /// Called when a peer answers a RequestVote sent in `sent_term`.
    pub fn handle_vote_reply(
        &mut self,
        peer: NodeId,
        sent_term: Term,
        reply: &RequestVoteReply,
    ) -> Effects {
        if reply.term > self.current_term {
            return self.become_follower(reply.term);
        }
        if self.role != RaftRole::Candidate || sent_term != self.current_term || !reply.vote_granted
        {
            return Effects::default();
        }

        self.votes.insert(peer);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return Effects {
                became_leader: true,
                ..Default::default()
            };
        }
        Effects::default()
    }

    /// Leader only: append a client command at the tail of the log.
    pub fn append_command(&mut self, command: Bytes) -> Result<(LogIndex, Term)> {
        if self.role != RaftRole::Leader {
            return Err(QuorumError::NotLeader {
                leader: self.leader_id,
            });
        }
        let entry = self.log.push(self.current_term, command);
        Ok((entry.index, entry.term))
    }

    /// Advance `commit_index` to the highest index held by a majority,
    /// provided that entry belongs to the current term.
    pub fn advance_commit(&mut self) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(self.log.last_index()); // include leader's own index
        indices.sort_unstable_by(|a, b| b.cmp(a)); // descending

        let candidate = indices[self.quorum() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Committed entries in `[from, from + max)`.
    pub fn committed_entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let to = self
            .commit_index
            .min(from.saturating_add(max as LogIndex).saturating_sub(1));
        self.log.slice(from, to)
    }

    pub fn record_applied(&mut self, index: LogIndex) {
        if index > self.last_applied {
            self.last_applied = index;
        }
    }
}
