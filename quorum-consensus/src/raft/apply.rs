use bytes::Bytes;
use quorum_common::types::{LogIndex, NodeId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::log::LogEntry;
use super::node::Event;

/// A committed command handed to the service, exactly once per index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: LogIndex,
    pub command: Bytes,
}

/// Delivers committed entries to the service strictly in index order.
///
/// Watches the replica's published `commit_index`, pulls the committed
/// window `(last_applied, commit_index]` in batches and sends each entry on
/// `sink`. `last_applied` moves only after the service accepted the entry.
pub(crate) struct ApplyPipeline {
    pub(crate) node_id: NodeId,
    pub(crate) commit_rx: watch::Receiver<LogIndex>,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) sink: mpsc::Sender<ApplyMsg>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) batch: usize,
    pub(crate) last_applied: LogIndex,
}

impl ApplyPipeline {
    pub(crate) async fn run(mut self) {
        loop {
            let commit_index = *self.commit_rx.borrow_and_update();
            if !self.catch_up(commit_index).await {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = self.commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(node_id = self.node_id, last_applied = self.last_applied, "Apply pipeline stopped");
    }

    /// Apply everything up to `commit_index`. Returns `false` once the
    /// replica or the service is gone.
    async fn catch_up(&mut self, commit_index: LogIndex) -> bool {
        while self.last_applied < commit_index {
            let Some(entries) = self.fetch(self.last_applied + 1).await else {
                return false;
            };
            if entries.is_empty() {
                break;
            }

            for entry in entries.into_iter().take_while(|e| e.index <= commit_index) {
                debug_assert_eq!(entry.index, self.last_applied + 1, "apply must not skip");
                let msg = ApplyMsg {
                    index: entry.index,
                    command: entry.command,
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => return false,
                    sent = self.sink.send(msg) => {
                        if sent.is_err() {
                            tracing::warn!(node_id = self.node_id, "Service dropped its apply channel");
                            return false;
                        }
                    }
                }
                self.last_applied = entry.index;
            }

            tracing::trace!(node_id = self.node_id, last_applied = self.last_applied, "Applied entries");
            if self
                .events
                .send(Event::Applied {
                    index: self.last_applied,
                })
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    async fn fetch(&self, from: LogIndex) -> Option<Vec<LogEntry>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = Event::FetchCommitted {
            from,
            max: self.batch,
            reply_tx,
        };
        self.events.send(event).await.ok()?;
        reply_rx.await.ok()
    }
}
