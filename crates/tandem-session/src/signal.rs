//! Inbound signaling deduplication.
//!
//! The relay delivers at least once and in any order. Every offer, answer and
//! candidate passes through [`SignalLedger::admit`] before it reaches the
//! connection; a literal redelivery maps to an idempotency key that was
//! already processed and is dropped.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::token::GenerationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub sender_id: String,
    pub payload_hash: String,
    pub sequence_counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub sender_id: String,
    pub token: GenerationToken,
    pub payload_hash: String,
    pub sequence_counter: u64,
}

impl SignalingMessage {
    pub fn key(&self, token: GenerationToken) -> IdempotencyKey {
        IdempotencyKey {
            sender_id: self.sender_id.clone(),
            token,
            payload_hash: self.payload_hash.clone(),
            sequence_counter: self.sequence_counter,
        }
    }
}

/// Hex SHA-256 over the kind tag and the payload.
pub fn payload_hash(kind: SignalKind, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Fresh(SignalingMessage),
    Duplicate(IdempotencyKey),
}

impl Admission {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Admission::Fresh(_))
    }
}

#[derive(Debug, Default)]
struct StreamState {
    counter: u64,
    last_hash: Option<String>,
}

type StreamKey = (String, GenerationToken, SignalKind);

#[derive(Debug, Default)]
pub struct SignalLedger {
    streams: HashMap<StreamKey, StreamState>,
    processed: HashSet<IdempotencyKey>,
}

impl SignalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message and reports whether it was already processed.
    ///
    /// The sequence counter of a `(sender, token, kind)` stream only advances
    /// when the payload hash differs from the previous one, so a payload that
    /// returns after a different one is a new message.
    pub fn admit(
        &mut self,
        kind: SignalKind,
        sender_id: &str,
        token: GenerationToken,
        payload: &str,
    ) -> Admission {
        let hash = payload_hash(kind, payload);
        let stream = self
            .streams
            .entry((sender_id.to_string(), token, kind))
            .or_default();

        if stream.last_hash.as_ref().is_some_and(|last| *last != hash) {
            stream.counter += 1;
        }
        stream.last_hash = Some(hash.clone());
        let sequence_counter = stream.counter;

        let message = SignalingMessage {
            kind,
            sender_id: sender_id.to_string(),
            payload_hash: hash,
            sequence_counter,
        };
        let key = message.key(token);
        if self.processed.insert(key.clone()) {
            Admission::Fresh(message)
        } else {
            Admission::Duplicate(key)
        }
    }

    /// Drops every record that does not belong to `token`.
    pub fn retain_token(&mut self, token: GenerationToken) {
        self.streams.retain(|(_, stream_token, _), _| *stream_token == token);
        self.processed.retain(|key| key.token == token);
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.processed.clear();
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_is_rejected() {
        let mut ledger = SignalLedger::new();
        let t = GenerationToken::default();
        assert!(ledger.admit(SignalKind::Offer, "bob", t, "v=0 a").is_fresh());
        assert!(!ledger.admit(SignalKind::Offer, "bob", t, "v=0 a").is_fresh());
    }

    #[test]
    fn renegotiation_advances_counter() {
        let mut ledger = SignalLedger::new();
        let t = GenerationToken::default();
        let Admission::Fresh(first) = ledger.admit(SignalKind::Offer, "bob", t, "one") else {
            panic!("first offer should be fresh");
        };
        let Admission::Fresh(second) = ledger.admit(SignalKind::Offer, "bob", t, "two") else {
            panic!("changed offer should be fresh");
        };
        assert_eq!(first.sequence_counter, 0);
        assert_eq!(second.sequence_counter, 1);
        assert_eq!(
            ledger.admit(SignalKind::Offer, "bob", t, "two"),
            Admission::Duplicate(second.key(t))
        );
    }

    #[test]
    fn returning_payload_is_a_new_message() {
        let mut ledger = SignalLedger::new();
        let t = GenerationToken::default();
        assert!(ledger.admit(SignalKind::Offer, "bob", t, "a").is_fresh());
        assert!(ledger.admit(SignalKind::Offer, "bob", t, "b").is_fresh());
        let Admission::Fresh(again) = ledger.admit(SignalKind::Offer, "bob", t, "a") else {
            panic!("renegotiating back to an earlier offer should be fresh");
        };
        assert_eq!(again.sequence_counter, 2);
        assert_eq!(
            ledger.admit(SignalKind::Offer, "bob", t, "a"),
            Admission::Duplicate(again.key(t))
        );
    }

    #[test]
    fn kinds_and_tokens_are_independent() {
        let mut gens = crate::token::GenerationCounter::new();
        let mut ledger = SignalLedger::new();
        let old = gens.current();
        assert!(ledger.admit(SignalKind::Offer, "bob", old, "x").is_fresh());
        assert!(ledger.admit(SignalKind::Answer, "bob", old, "x").is_fresh());
        let new = gens.bump();
        assert!(ledger.admit(SignalKind::Offer, "bob", new, "x").is_fresh());
        ledger.retain_token(new);
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.admit(SignalKind::Offer, "bob", new, "x").is_fresh());
    }

    #[test]
    fn hash_is_kind_scoped_hex() {
        let offer = payload_hash(SignalKind::Offer, "x");
        assert_eq!(offer.len(), 64);
        assert_ne!(offer, payload_hash(SignalKind::Answer, "x"));
    }
}
