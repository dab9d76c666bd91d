use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionHandle;
use crate::error::{NegotiationError, RuntimeError};
use crate::runtime::{CandidateKey, IceCandidate};
use crate::token::GenerationToken;

/// Inbound candidates are queued under both the transport address of the
/// sender and the logical room, since either may be known first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Sender(String),
    Room(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub applied: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct IceCoordinator {
    outbound: Vec<IceCandidate>,
    inbound: HashMap<QueueKey, Vec<IceCandidate>>,
    applied: HashSet<CandidateKey>,
}

impl IceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds a local candidate until the partner identity is known.
    pub fn cache_outbound(&mut self, candidate: IceCandidate) {
        let key = candidate.key();
        if self.outbound.iter().any(|cached| cached.key() == key) {
            return;
        }
        self.outbound.push(candidate);
    }

    /// Drains the outbound cache in emission order. A second call returns
    /// nothing until more candidates are cached.
    pub fn flush_outbound_cache(&mut self, partner_id: &str) -> Vec<IceCandidate> {
        let drained = std::mem::take(&mut self.outbound);
        if !drained.is_empty() {
            tracing::debug!(
                target = "tandem::ice",
                partner = %partner_id,
                count = drained.len(),
                "flushing cached local candidates"
            );
        }
        drained
    }

    pub fn cached_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Queues a remote candidate. Returns false when it was already applied
    /// or is already waiting under every relevant key.
    pub fn enqueue_inbound(
        &mut self,
        sender_id: &str,
        candidate: IceCandidate,
        room_id: Option<&str>,
    ) -> bool {
        let key = candidate.key();
        if self.applied.contains(&key) {
            tracing::trace!(target = "tandem::ice", sender = %sender_id, "candidate already applied");
            return false;
        }
        let mut queued = false;
        let mut keys = vec![QueueKey::Sender(sender_id.to_string())];
        if let Some(room) = room_id {
            keys.push(QueueKey::Room(room.to_string()));
        }
        for queue_key in keys {
            let queue = self.inbound.entry(queue_key).or_default();
            if !queue.iter().any(|pending| pending.key() == key) {
                queue.push(candidate.clone());
                queued = true;
            }
        }
        queued
    }

    pub fn pending_inbound(&self) -> usize {
        let mut seen = HashSet::new();
        self.inbound
            .values()
            .flatten()
            .filter(|candidate| seen.insert(candidate.key()))
            .count()
    }

    /// Applies queued candidates for `sender_id` and `room_id` once the
    /// remote description is in place.
    ///
    /// Candidates from both queues are merged in arrival order and
    /// deduplicated. Queues are only deleted when every candidate was
    /// accepted; anything else stays queued for the next flush.
    pub async fn flush_inbound(
        &mut self,
        sender_id: Option<&str>,
        room_id: Option<&str>,
        handle: &ConnectionHandle,
        current: GenerationToken,
    ) -> Result<FlushOutcome, NegotiationError> {
        if handle.token() != current {
            return Err(NegotiationError::Stale {
                captured: handle.token(),
                current,
            });
        }
        let connection = handle.connection();
        if !connection.has_remote_description().await {
            return Ok(FlushOutcome {
                applied: 0,
                remaining: self.pending_inbound(),
            });
        }

        let keys: Vec<QueueKey> = sender_id
            .map(|id| QueueKey::Sender(id.to_string()))
            .into_iter()
            .chain(room_id.map(|id| QueueKey::Room(id.to_string())))
            .collect();

        let mut batch: Vec<IceCandidate> = Vec::new();
        let mut batch_keys: HashSet<CandidateKey> = HashSet::new();
        for key in &keys {
            if let Some(queue) = self.inbound.get(key) {
                for candidate in queue {
                    let candidate_key = candidate.key();
                    if self.applied.contains(&candidate_key) {
                        continue;
                    }
                    if batch_keys.insert(candidate_key) {
                        batch.push(candidate.clone());
                    }
                }
            }
        }

        let mut outcome = FlushOutcome::default();
        let mut failed: HashSet<CandidateKey> = HashSet::new();
        let mut halted = false;
        for candidate in batch {
            let key = candidate.key();
            if halted {
                failed.insert(key);
                continue;
            }
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => {
                    self.applied.insert(key);
                    outcome.applied += 1;
                }
                Err(err) if err.is_expected_candidate_rejection() => {
                    if err == RuntimeError::Closed {
                        tracing::trace!(target = "tandem::ice", "connection closed mid-flush");
                        failed.insert(key);
                        halted = true;
                    } else {
                        self.applied.insert(key);
                    }
                }
                Err(err) => {
                    tracing::warn!(target = "tandem::ice", error = %err, "candidate rejected");
                    failed.insert(key);
                }
            }
        }

        for key in &keys {
            if failed.is_empty() {
                self.inbound.remove(key);
            } else if let Some(queue) = self.inbound.get_mut(key) {
                queue.retain(|candidate| failed.contains(&candidate.key()));
            }
        }
        outcome.remaining = self.pending_inbound();
        tracing::debug!(
            target = "tandem::ice",
            token = %current,
            applied = outcome.applied,
            remaining = outcome.remaining,
            "flushed remote candidates"
        );
        Ok(outcome)
    }

    /// Forgets remote state. Called on teardown and on partner change; the
    /// outbound cache is kept only when `keep_outbound` is set.
    pub fn reset(&mut self, keep_outbound: bool) {
        self.inbound.clear();
        self.applied.clear();
        if !keep_outbound {
            self.outbound.clear();
        }
    }
}
