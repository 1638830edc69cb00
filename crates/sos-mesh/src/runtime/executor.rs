//! Effect executor: the only place that touches I/O.
//!
//! - SendFrame / Connect / SendExternal -> spawned task, outcome fed back
//! - Deliver / Emit -> channel `try_send`
//! - Persist / Forget / PersistSequence -> journal

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::gateway::ExternalTransport;
use crate::journal::MessageJournal;

use super::effect::{RuntimeEffect, TaskOutcome};
use super::link::LinkLayer;
use super::{DeliveredMessage, MeshEvent};

pub(super) struct Executor<L, E> {
    link: Arc<L>,
    external: Arc<E>,
    journal: Option<MessageJournal>,
    delivered_tx: mpsc::Sender<DeliveredMessage>,
    event_tx: mpsc::Sender<MeshEvent>,
    outcome_tx: mpsc::Sender<TaskOutcome>,
}

impl<L: LinkLayer, E: ExternalTransport> Executor<L, E> {
    pub(super) fn new(
        link: Arc<L>,
        external: Arc<E>,
        journal: Option<MessageJournal>,
        delivered_tx: mpsc::Sender<DeliveredMessage>,
        event_tx: mpsc::Sender<MeshEvent>,
        outcome_tx: mpsc::Sender<TaskOutcome>,
    ) -> Self {
        Self {
            link,
            external,
            journal,
            delivered_tx,
            event_tx,
            outcome_tx,
        }
    }

    /// Execute effects in order. Never blocks on the network.
    pub(super) fn execute(&self, effects: Vec<RuntimeEffect>) {
        for effect in effects {
            match effect {
                RuntimeEffect::SendFrame { to, frame, track } => {
                    let link = self.link.clone();
                    let outcome_tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = link.send(to, &frame).await.map_err(|e| e.to_string());
                        let _ = outcome_tx
                            .send(TaskOutcome::Sent { to, track, result })
                            .await;
                    });
                }
                RuntimeEffect::Connect(device_id) => {
                    let link = self.link.clone();
                    let outcome_tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = link.connect(device_id).await.map_err(|e| e.to_string());
                        let _ = outcome_tx
                            .send(TaskOutcome::Connected { device_id, result })
                            .await;
                    });
                }
                RuntimeEffect::SendExternal(message) => {
                    let external = self.external.clone();
                    let outcome_tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = external
                            .send_external(&message)
                            .await
                            .map_err(|e| e.to_string());
                        let _ = outcome_tx
                            .send(TaskOutcome::Uploaded {
                                message_id: message.id,
                                result,
                            })
                            .await;
                    });
                }
                RuntimeEffect::Deliver(msg) => {
                    // try_send: a slow UI must not stall relaying
                    if self.delivered_tx.try_send(msg).is_err() {
                        tracing::warn!("delivered channel full or closed, message dropped");
                    }
                }
                RuntimeEffect::Emit(event) => {
                    let _ = self.event_tx.try_send(event);
                }
                RuntimeEffect::Persist(record) => {
                    if let Some(journal) = &self.journal {
                        if let Err(e) = journal.save(&record) {
                            self.journal_error(e);
                        }
                    }
                }
                RuntimeEffect::Forget(id) => {
                    if let Some(journal) = &self.journal {
                        if let Err(e) = journal.remove(&id) {
                            self.journal_error(e);
                        }
                    }
                }
                RuntimeEffect::PersistSequence(sequence) => {
                    if let Some(journal) = &self.journal {
                        if let Err(e) = journal.save_sequence(sequence) {
                            self.journal_error(e);
                        }
                    }
                }
            }
        }
    }

    /// Periodic compaction of the on-disk journal.
    pub(super) fn purge_journal(&self, now: u64) {
        if let Some(journal) = &self.journal {
            match journal.purge_expired(now) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "journal compacted"),
                Err(e) => self.journal_error(e),
            }
        }
    }

    fn journal_error(&self, e: crate::error::MeshError) {
        tracing::warn!("journal write failed: {e}");
        let _ = self.event_tx.try_send(MeshEvent::Error {
            description: format!("journal write failed: {e}"),
        });
    }
}
