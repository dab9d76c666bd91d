//! Peer-connection lifecycle.
//!
//! [`ConnectionManager`] holds at most one [`ConnectionHandle`]. The handle is
//! stamped with the generation token current at construction time; only
//! teardown or replacement advances the token, so renegotiating on the same
//! connection (including ICE restarts) keeps it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::IceServer;
use crate::error::{MediaError, NegotiationError};
use crate::event::EngineEvent;
use crate::media::StreamHandle;
use crate::runtime::{
    ConnectionEventSink, ConnectionState, MediaRuntime, PeerConnection, SdpKind,
    SessionDescription, SignalingState,
};
use crate::signal::{payload_hash, SignalKind};
use crate::token::{GenerationCounter, GenerationToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Established,
    Closed,
}

/// How a remote offer that collides with our own is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Roll back the local offer and answer.
    Polite,
    /// Keep the local offer and ignore the remote one.
    Impolite,
    /// Both sides may believe they start. The side whose offer hashes lower
    /// yields; the first completed exchange then fixes the politeness.
    ByOfferHash,
}

pub struct ConnectionHandle {
    connection: Arc<dyn PeerConnection>,
    token: GenerationToken,
    stream_id: Option<String>,
    phase: NegotiationPhase,
    marked_at: Instant,
    local_offer: Option<String>,
}

impl ConnectionHandle {
    pub fn new(
        connection: Arc<dyn PeerConnection>,
        token: GenerationToken,
        stream_id: Option<String>,
    ) -> Self {
        Self {
            connection,
            token,
            stream_id,
            phase: NegotiationPhase::Idle,
            marked_at: Instant::now(),
            local_offer: None,
        }
    }

    pub fn token(&self) -> GenerationToken {
        self.token
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Last time the handle was built or reused.
    pub fn marked_at(&self) -> Instant {
        self.marked_at
    }

    /// A failed connection still counts as open; an ICE restart can revive it.
    pub fn is_open(&self) -> bool {
        self.connection.signaling_state() != SignalingState::Closed
            && self.connection.connection_state() != ConnectionState::Closed
    }

    /// Neither description has been set yet.
    pub async fn is_fresh(&self) -> bool {
        !self.connection.has_local_description().await
            && !self.connection.has_remote_description().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("token", &self.token)
            .field("stream_id", &self.stream_id)
            .field("phase", &self.phase)
            .field("signaling", &self.connection.signaling_state())
            .finish()
    }
}

/// Result of applying a remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApplied {
    Offer { rolled_back: bool },
    Answer,
}

pub struct ConnectionManager {
    runtime: Arc<dyn MediaRuntime>,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<EngineEvent>,
    generations: GenerationCounter,
    handle: Option<ConnectionHandle>,
    politeness: Politeness,
}

impl ConnectionManager {
    pub fn new(
        runtime: Arc<dyn MediaRuntime>,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            runtime,
            ice_servers,
            events,
            generations: GenerationCounter::new(),
            handle: None,
            politeness: Politeness::Polite,
        }
    }

    pub fn current_token(&self) -> GenerationToken {
        self.generations.current()
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.generations.is_current(token)
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn set_politeness(&mut self, politeness: Politeness) {
        self.politeness = politeness;
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    fn yields_to(&self, local_offer: Option<&str>, remote_offer: &str) -> bool {
        match self.politeness {
            Politeness::Polite => true,
            Politeness::Impolite => false,
            Politeness::ByOfferHash => match local_offer {
                Some(local) => {
                    payload_hash(SignalKind::Offer, local)
                        < payload_hash(SignalKind::Offer, remote_offer)
                }
                None => true,
            },
        }
    }

    /// Pins an undecided side once it has answered or been answered.
    fn settle(&mut self, politeness: Politeness) {
        if self.politeness == Politeness::ByOfferHash {
            tracing::debug!(target = "tandem::connection", settled = ?politeness, "glare tiebreak settled");
            self.politeness = politeness;
        }
    }

    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.handle
            .as_ref()
            .map(|handle| handle.connection.signaling_state())
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.handle
            .as_ref()
            .map(|handle| handle.connection.connection_state())
    }

    pub async fn has_remote_description(&self) -> bool {
        match self.handle.as_ref() {
            Some(handle) => handle.connection.has_remote_description().await,
            None => false,
        }
    }

    fn check(&self, captured: GenerationToken) -> Result<(), NegotiationError> {
        if self.generations.is_current(captured) {
            Ok(())
        } else {
            Err(NegotiationError::Stale {
                captured,
                current: self.generations.current(),
            })
        }
    }

    fn live(&self) -> Result<&ConnectionHandle, NegotiationError> {
        let handle = self.handle.as_ref().ok_or(NegotiationError::NoConnection)?;
        self.check(handle.token)?;
        Ok(handle)
    }

    /// Returns a connection bound to `stream`, building one when needed.
    ///
    /// An open connection is reused as is, unless no description has been set
    /// on it yet and it was built for a different stream.
    pub async fn ensure_connection(
        &mut self,
        stream: &StreamHandle,
    ) -> Result<GenerationToken, NegotiationError> {
        if !stream.is_valid() {
            return Err(MediaError::StreamEnded(stream.id().to_string()).into());
        }

        if let Some(handle) = self.handle.as_mut() {
            if handle.is_open() {
                let bound_elsewhere = handle.stream_id.as_deref() != Some(stream.id());
                if !(bound_elsewhere && handle.is_fresh().await) {
                    handle.marked_at = Instant::now();
                    tracing::trace!(
                        target = "tandem::connection",
                        token = %handle.token,
                        "reusing connection"
                    );
                    return Ok(handle.token);
                }
                tracing::debug!(
                    target = "tandem::connection",
                    token = %handle.token,
                    stream = %stream.id(),
                    "replacing fresh connection bound to another stream"
                );
            }
            self.teardown().await;
        }

        let token = self.generations.current();
        let sink = ConnectionEventSink::new(token, self.events.clone());
        let connection = self.runtime.create_connection(&self.ice_servers, sink).await?;
        if let Err(err) = self.check(token) {
            close_quietly(connection.as_ref()).await;
            return Err(err);
        }
        if let Err(err) = connection.attach_stream(stream).await {
            close_quietly(connection.as_ref()).await;
            if !stream.is_valid() {
                return Err(MediaError::StreamEnded(stream.id().to_string()).into());
            }
            return Err(err.into());
        }
        self.check(token)?;

        tracing::debug!(
            target = "tandem::connection",
            token = %token,
            stream = %stream.id(),
            "connection created"
        );
        self.handle = Some(ConnectionHandle::new(
            connection,
            token,
            Some(stream.id().to_string()),
        ));
        Ok(token)
    }

    /// Creates and applies a local offer. Requires `Stable`.
    pub async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let handle = self.live()?;
        let captured = handle.token;
        let connection = handle.connection.clone();
        expect_state(&*connection, "create_offer", "stable", |state| {
            state == SignalingState::Stable
        })?;

        let offer = connection.create_offer(ice_restart).await?;
        self.check(captured)?;
        connection.set_local_description(offer.clone()).await?;
        self.check(captured)?;

        if let Some(handle) = self.handle.as_mut() {
            handle.local_offer = Some(offer.sdp.clone());
        }
        self.set_phase(NegotiationPhase::OfferSent);
        tracing::debug!(
            target = "tandem::connection",
            token = %captured,
            ice_restart,
            "local offer applied"
        );
        Ok(offer)
    }

    /// Creates and applies an answer. Requires `HaveRemoteOffer`.
    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let handle = self.live()?;
        let captured = handle.token;
        let connection = handle.connection.clone();
        expect_state(&*connection, "create_answer", "have-remote-offer", |state| {
            state == SignalingState::HaveRemoteOffer
        })?;

        let answer = connection.create_answer().await?;
        self.check(captured)?;
        connection.set_local_description(answer.clone()).await?;
        self.check(captured)?;

        self.set_phase(NegotiationPhase::AnswerExchanged);
        tracing::debug!(target = "tandem::connection", token = %captured, "local answer applied");
        Ok(answer)
    }

    /// Applies a remote offer or answer, resolving glare by politeness.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<RemoteApplied, NegotiationError> {
        let handle = self.live()?;
        let captured = handle.token;
        let connection = handle.connection.clone();
        let local_offer = handle.local_offer.clone();
        let state = connection.signaling_state();

        match description.kind {
            SdpKind::Offer => {
                let mut rolled_back = false;
                match state {
                    SignalingState::Stable => {}
                    SignalingState::HaveLocalOffer => {
                        if !self.yields_to(local_offer.as_deref(), &description.sdp) {
                            tracing::debug!(
                                target = "tandem::connection",
                                token = %captured,
                                "glare: keeping local offer"
                            );
                            self.settle(Politeness::Impolite);
                            return Err(NegotiationError::GlareIgnored);
                        }
                        tracing::debug!(
                            target = "tandem::connection",
                            token = %captured,
                            "glare: rolling back local offer"
                        );
                        connection.rollback_local_description().await?;
                        self.check(captured)?;
                        if let Some(handle) = self.handle.as_mut() {
                            handle.local_offer = None;
                        }
                        rolled_back = true;
                    }
                    found => {
                        return Err(NegotiationError::InvalidStateTransition {
                            operation: "apply_remote_offer",
                            expected: "stable or have-local-offer",
                            found,
                        })
                    }
                }
                connection.set_remote_description(description).await?;
                self.check(captured)?;
                self.settle(Politeness::Polite);
                self.set_phase(NegotiationPhase::OfferReceived);
                Ok(RemoteApplied::Offer { rolled_back })
            }
            SdpKind::Answer => {
                expect_state(&*connection, "apply_remote_answer", "have-local-offer", |s| {
                    s == SignalingState::HaveLocalOffer
                })?;
                connection.set_remote_description(description).await?;
                self.check(captured)?;
                self.settle(Politeness::Impolite);
                self.set_phase(NegotiationPhase::AnswerExchanged);
                Ok(RemoteApplied::Answer)
            }
        }
    }

    pub fn mark_established(&mut self) {
        self.set_phase(NegotiationPhase::Established);
    }

    fn set_phase(&mut self, phase: NegotiationPhase) {
        if let Some(handle) = self.handle.as_mut() {
            if handle.phase != phase {
                tracing::trace!(
                    target = "tandem::connection",
                    token = %handle.token,
                    from = ?handle.phase,
                    to = ?phase,
                    "negotiation phase"
                );
                handle.phase = phase;
            }
        }
    }

    /// Invalidates the current generation, then stops outbound media and
    /// closes the connection. Returns the new current token.
    pub async fn teardown(&mut self) -> GenerationToken {
        let next = self.generations.bump();
        if let Some(mut handle) = self.handle.take() {
            handle.phase = NegotiationPhase::Closed;
            if let Err(err) = handle.connection.stop_senders().await {
                tracing::trace!(target = "tandem::connection", error = %err, "stop senders failed");
            }
            if let Err(err) = handle.connection.close().await {
                tracing::trace!(target = "tandem::connection", error = %err, "close failed");
            }
            tracing::debug!(
                target = "tandem::connection",
                closed = %handle.token,
                current = %next,
                "connection torn down"
            );
        }
        next
    }
}

async fn close_quietly(connection: &dyn PeerConnection) {
    if let Err(err) = connection.close().await {
        tracing::debug!(target = "tandem::connection", error = %err, "close of discarded connection failed");
    }
}

fn expect_state(
    connection: &dyn PeerConnection,
    operation: &'static str,
    expected: &'static str,
    accept: impl Fn(SignalingState) -> bool,
) -> Result<(), NegotiationError> {
    let found = connection.signaling_state();
    if accept(found) {
        Ok(())
    } else {
        Err(NegotiationError::InvalidStateTransition {
            operation,
            expected,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MediaKind, MediaTrack};
    use crate::testing::{FakeRuntime, FakeTrack};

    fn manager(runtime: Arc<FakeRuntime>) -> ConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionManager::new(runtime, Vec::new(), tx)
    }

    fn stream(id: &str) -> StreamHandle {
        StreamHandle::new(
            id,
            vec![
                FakeTrack::new(format!("{id}-a"), MediaKind::Audio) as Arc<dyn MediaTrack>,
                FakeTrack::new(format!("{id}-v"), MediaKind::Video),
            ],
        )
    }

    #[tokio::test]
    async fn reuse_keeps_token() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime.clone());
        let local = stream("s1");
        let first = manager.ensure_connection(&local).await.expect("connection");
        manager.create_offer(false).await.expect("offer");
        let again = manager.ensure_connection(&stream("s2")).await.expect("reuse");
        assert_eq!(first, again);
        assert_eq!(runtime.connections().len(), 1);
    }

    #[tokio::test]
    async fn fresh_connection_for_other_stream_is_replaced() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime.clone());
        let first = manager.ensure_connection(&stream("s1")).await.expect("connection");
        let second = manager.ensure_connection(&stream("s2")).await.expect("replaced");
        assert!(second > first);
        let connections = runtime.connections();
        assert_eq!(connections.len(), 2);
        assert!(connections[0].is_closed());
    }

    #[tokio::test]
    async fn ended_stream_is_rejected() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime);
        let local = stream("s1");
        for track in local.tracks() {
            track.stop();
        }
        let err = manager.ensure_connection(&local).await.expect_err("ended");
        assert!(matches!(
            err,
            NegotiationError::Media(crate::error::MediaError::StreamEnded(_))
        ));
    }

    #[tokio::test]
    async fn failed_attach_closes_discarded_connection() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.end_tracks_on_attach(1);
        let mut manager = manager(runtime.clone());
        let err = manager
            .ensure_connection(&stream("s1"))
            .await
            .expect_err("attach failed");
        assert!(matches!(
            err,
            NegotiationError::Media(crate::error::MediaError::StreamEnded(_))
        ));
        assert!(manager.handle().is_none());
        let connections = runtime.connections();
        assert_eq!(connections.len(), 1);
        assert!(connections[0].is_closed());
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime);
        manager.ensure_connection(&stream("s1")).await.expect("connection");
        let err = manager.create_answer().await.expect_err("out of state");
        assert!(matches!(
            err,
            NegotiationError::InvalidStateTransition {
                operation: "create_answer",
                found: SignalingState::Stable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn polite_side_rolls_back_on_glare() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime);
        manager.set_politeness(Politeness::Polite);
        manager.ensure_connection(&stream("s1")).await.expect("connection");
        manager.create_offer(false).await.expect("offer");
        let applied = manager
            .apply_remote_description(SessionDescription::offer("theirs"))
            .await
            .expect("rolled back");
        assert_eq!(applied, RemoteApplied::Offer { rolled_back: true });
        assert_eq!(manager.signaling_state(), Some(SignalingState::HaveRemoteOffer));
        manager.create_answer().await.expect("answer");
        assert_eq!(manager.signaling_state(), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn impolite_side_ignores_glare() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime);
        manager.set_politeness(Politeness::Impolite);
        manager.ensure_connection(&stream("s1")).await.expect("connection");
        manager.create_offer(false).await.expect("offer");
        let err = manager
            .apply_remote_description(SessionDescription::offer("theirs"))
            .await
            .expect_err("ignored");
        assert_eq!(err, NegotiationError::GlareIgnored);
        assert_eq!(manager.signaling_state(), Some(SignalingState::HaveLocalOffer));
    }

    #[tokio::test]
    async fn offer_hash_tiebreak_yields_on_exactly_one_side() {
        let mut left = manager(Arc::new(FakeRuntime::new()));
        let mut right = manager(Arc::new(FakeRuntime::new()));
        for side in [&mut left, &mut right] {
            side.set_politeness(Politeness::ByOfferHash);
            side.ensure_connection(&stream("s1")).await.expect("connection");
        }
        let left_offer = left.create_offer(false).await.expect("left offer");
        let right_offer = right.create_offer(false).await.expect("right offer");
        assert_ne!(left_offer.sdp, right_offer.sdp);

        let left_result = left.apply_remote_description(right_offer).await;
        let right_result = right.apply_remote_description(left_offer).await;
        let yielded = [&left_result, &right_result]
            .into_iter()
            .filter(|result| matches!(result, Ok(RemoteApplied::Offer { rolled_back: true })))
            .count();
        let kept = [&left_result, &right_result]
            .into_iter()
            .filter(|result| matches!(result, Err(NegotiationError::GlareIgnored)))
            .count();
        assert_eq!((yielded, kept), (1, 1));

        let (winner, loser) = if left_result.is_ok() {
            (&right, &left)
        } else {
            (&left, &right)
        };
        assert_eq!(winner.politeness(), Politeness::Impolite);
        assert_eq!(loser.politeness(), Politeness::Polite);
        assert_eq!(winner.signaling_state(), Some(SignalingState::HaveLocalOffer));
        assert_eq!(loser.signaling_state(), Some(SignalingState::HaveRemoteOffer));
    }

    #[tokio::test]
    async fn answer_settles_offer_hash_side() {
        let mut manager = manager(Arc::new(FakeRuntime::new()));
        manager.set_politeness(Politeness::ByOfferHash);
        manager.ensure_connection(&stream("s1")).await.expect("connection");
        manager.create_offer(false).await.expect("offer");
        manager
            .apply_remote_description(SessionDescription::answer("theirs"))
            .await
            .expect("answer");
        assert_eq!(manager.politeness(), Politeness::Impolite);
    }

    #[tokio::test]
    async fn teardown_invalidates_token() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut manager = manager(runtime.clone());
        let captured = manager.ensure_connection(&stream("s1")).await.expect("connection");
        let next = manager.teardown().await;
        assert!(!manager.is_current(captured));
        assert!(manager.is_current(next));
        assert!(manager.handle().is_none());
        let connection = &runtime.connections()[0];
        assert!(connection.is_closed());
        assert!(connection.senders_stopped());
        assert!(matches!(
            manager.create_offer(false).await,
            Err(NegotiationError::NoConnection)
        ));
    }
}
