//! Top-level call orchestration.
//!
//! [`SessionCoordinator`] owns the [`Session`] and every component below it.
//! It is driven from a single task: public operations, inbound relay signals
//! and internal [`EngineEvent`]s all run to completion one at a time, so no
//! two handlers ever mutate the session concurrently. Anything that crossed an
//! await is re-validated against the generation token before it writes back.

use std::collections::HashMap;
use std::sync::Arc;

use tandem_signal::{
    CallSignal, CamToggle, CandidateSignal, FriendCall, MatchFound, PipState, RoomRef, SdpSignal,
    Signal, SignalBus,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, Politeness, RemoteApplied};
use crate::error::{ErrorClass, MediaError, NegotiationError};
use crate::event::{ConnectionEventKind, EngineEvent, TimerFired, TimerKind};
use crate::host::{CallHost, EndReason, SessionEvent, StreamSlot};
use crate::ice::IceCoordinator;
use crate::media::{MediaStreamRegistry, StreamHandle};
use crate::presence::{PresenceChange, RemotePresenceState, RemotePresenceTracker, TrackSample};
use crate::reconnect::{HealthNotice, ReconnectionSupervisor, RestartPolicy};
use crate::runtime::{
    ConnectionState, IceCandidate, MediaKind, MediaRuntime, MediaTrack, SessionDescription,
    SignalingState,
};
use crate::session::{Lifecycle, Role, Session, SessionKind, SessionSnapshot};
use crate::signal::{Admission, SignalKind, SignalLedger};
use crate::timers::{TaskSet, TimerScheduler};
use crate::token::GenerationToken;

const REASON_BUSY: &str = "busy";
const REASON_NOT_FRIEND: &str = "not-friend";
const REASON_DECLINED: &str = "declined";

pub struct SessionCoordinator {
    config: EngineConfig,
    host: Arc<dyn CallHost>,
    bus: Arc<dyn SignalBus>,
    events: mpsc::UnboundedSender<SessionEvent>,
    scheduler: TimerScheduler,
    timers: TaskSet,
    session: Option<Session>,
    /// Caller-side ring in progress, by call id.
    ringing: Option<String>,
    incoming: HashMap<String, CallSignal>,
    ledger: SignalLedger,
    connections: ConnectionManager,
    ice: IceCoordinator,
    media: MediaStreamRegistry,
    supervisor: ReconnectionSupervisor,
    presence: RemotePresenceTracker,
    recreations: u32,
}

impl SessionCoordinator {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn MediaRuntime>,
        bus: Arc<dyn SignalBus>,
        host: Arc<dyn CallHost>,
        internal: mpsc::UnboundedSender<EngineEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let scheduler = TimerScheduler::new(internal.clone());
        let connections =
            ConnectionManager::new(runtime.clone(), config.ice_servers.clone(), internal);
        let media = MediaStreamRegistry::new(
            runtime,
            config.capture_ladder.clone(),
            scheduler.clone(),
            config.mic_level_poll(),
        );
        let supervisor =
            ReconnectionSupervisor::new(RestartPolicy::from_config(&config), scheduler.clone());
        let presence = RemotePresenceTracker::new(&config, scheduler.clone());
        Self {
            config,
            host,
            bus,
            events,
            scheduler,
            timers: TaskSet::new(),
            session: None,
            ringing: None,
            incoming: HashMap::new(),
            ledger: SignalLedger::new(),
            connections,
            ice: IceCoordinator::new(),
            media,
            supervisor,
            presence,
            recreations: 0,
        }
    }

    // ---- getters ---------------------------------------------------------

    pub fn lifecycle(&self) -> Lifecycle {
        self.session
            .as_ref()
            .map(|session| session.lifecycle)
            .unwrap_or(Lifecycle::Idle)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn local_stream(&self) -> Option<StreamHandle> {
        self.media.local().cloned()
    }

    pub fn remote_stream(&self) -> Option<StreamHandle> {
        self.media.remote().cloned()
    }

    pub fn presence(&self) -> RemotePresenceState {
        self.presence.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            session_id: session.map(|s| s.id.clone()),
            lifecycle: self.lifecycle(),
            role: session.map(|s| s.role),
            kind: session.map(|s| s.kind),
            partner_id: session.and_then(|s| s.partner_id.clone()),
            partner_user_id: session.and_then(|s| s.partner_user_id.clone()),
            room_id: session.and_then(|s| s.room_id.clone()),
            call_id: session.and_then(|s| s.call_id.clone()),
            generation: self.connections.current_token().value(),
            signaling_state: self.connections.signaling_state(),
            connection_state: self.connections.connection_state(),
            local_stream_id: self.media.local().map(|s| s.id().to_string()),
            remote_stream_id: self.media.remote().map(|s| s.id().to_string()),
            presence: self.presence.state(),
            pending_candidates: self.ice.pending_inbound(),
            ice_restarts: self.supervisor.attempts(),
        }
    }

    // ---- public operations -----------------------------------------------

    /// Acquires media, pre-builds a connection and asks the relay for a
    /// random partner.
    pub async fn start_ephemeral(&mut self) {
        if !self.expect_idle("start_ephemeral") {
            return;
        }
        if !self.host.is_call_mode_active() {
            tracing::warn!(target = "tandem::session", "start_ephemeral ignored: call mode inactive");
            return;
        }
        let session = Session::new(SessionKind::Ephemeral, Role::Initiator);
        tracing::info!(target = "tandem::session", session = %session.id, "ephemeral session started");
        self.session = Some(session);
        self.recreations = 0;

        if self.prepare_connection().await.is_none() {
            return;
        }
        self.send(Signal::Start);
        self.notify(SessionEvent::Searching);
    }

    /// Rings `peer`. The call proceeds when they accept and ends on decline
    /// or after the ring timeout.
    pub async fn start_persistent_call(&mut self, peer: &str) {
        if !self.expect_idle("start_persistent_call") {
            return;
        }
        let mut session = Session::new(SessionKind::Persistent, Role::Initiator);
        let call_id = uuid::Uuid::new_v4().to_string();
        session.partner_id = Some(peer.to_string());
        session.partner_user_id = Some(peer.to_string());
        session.call_id = Some(call_id.clone());
        tracing::info!(
            target = "tandem::session",
            session = %session.id,
            call = %call_id,
            peer = %peer,
            "persistent call started"
        );
        self.session = Some(session);
        self.recreations = 0;
        self.connections.set_politeness(Role::Initiator.politeness());
        self.presence.set_partner(Some(peer));

        let Some(token) = self.prepare_connection().await else {
            return;
        };
        self.send(Signal::FriendCall(FriendCall {
            to: peer.to_string(),
            call_id: call_id.clone(),
        }));
        self.ringing = Some(call_id);
        let ring = self
            .scheduler
            .once(TimerKind::RingTimeout, token, self.config.ring_timeout());
        self.timers.insert(TimerKind::RingTimeout, ring);
    }

    pub async fn accept_incoming(&mut self, call_id: &str) {
        if !self.expect_idle("accept_incoming") {
            return;
        }
        let Some(call) = self.incoming.remove(call_id) else {
            tracing::warn!(target = "tandem::session", call = %call_id, "accept_incoming: no such call");
            return;
        };
        let Some(caller) = call.from.clone() else {
            tracing::warn!(target = "tandem::session", call = %call_id, "accept_incoming: caller unknown");
            return;
        };
        // other rings are now moot
        let others: Vec<_> = self.incoming.drain().collect();
        for (other, pending) in others {
            self.send(Signal::CallDecline(CallSignal {
                call_id: other,
                room_id: pending.room_id,
                from: None,
                to: pending.from,
                reason: Some(REASON_BUSY.into()),
            }));
        }

        let room_id = call.room_id.clone().unwrap_or_else(|| call_id.to_string());
        let mut session = Session::new(SessionKind::Persistent, Role::Receiver);
        session.partner_id = Some(caller.clone());
        session.partner_user_id = Some(caller.clone());
        session.call_id = Some(call_id.to_string());
        session.room_id = Some(room_id.clone());
        tracing::info!(target = "tandem::session", session = %session.id, call = %call_id, "incoming call accepted");
        self.session = Some(session);
        self.recreations = 0;
        self.connections.set_politeness(Role::Receiver.politeness());
        self.presence.set_partner(Some(&caller));

        let Some(token) = self.prepare_connection().await else {
            return;
        };
        self.supervisor.start(token);
        self.send(Signal::CallAccept(CallSignal {
            call_id: call_id.to_string(),
            room_id: Some(room_id.clone()),
            from: None,
            to: Some(caller.clone()),
            reason: None,
        }));
        self.send(Signal::RoomJoinAck(RoomRef {
            room_id: room_id.clone(),
        }));
        self.notify(SessionEvent::Matched {
            partner_id: caller.clone(),
            room_id: Some(room_id),
            role: Role::Receiver,
        });
        self.flush_outbound_candidates(&caller);
    }

    pub async fn decline(&mut self, call_id: &str) {
        let Some(call) = self.incoming.remove(call_id) else {
            tracing::warn!(target = "tandem::session", call = %call_id, "decline: no such call");
            return;
        };
        self.send(Signal::CallDecline(CallSignal {
            call_id: call_id.to_string(),
            room_id: call.room_id,
            from: None,
            to: call.from,
            reason: Some(REASON_DECLINED.into()),
        }));
    }

    /// Leaves the current partner and searches again. Local media is kept.
    pub async fn go_next(&mut self) {
        let allowed = matches!(
            self.session.as_ref(),
            Some(session) if session.kind == SessionKind::Ephemeral
                && matches!(session.lifecycle, Lifecycle::Negotiating | Lifecycle::Active)
        );
        if !allowed {
            self.invalid("go_next");
            return;
        }
        self.return_to_search().await;
    }

    /// Tears the session down. A second call is a no-op.
    pub async fn end(&mut self) {
        if self.session.is_none() {
            tracing::debug!(target = "tandem::session", "end: no session");
            return;
        }
        self.end_with(EndReason::LocalHangup, Some("hangup")).await;
    }

    pub fn set_camera_enabled(&mut self, enabled: bool) {
        if self.session.is_none() {
            self.invalid("set_camera_enabled");
            return;
        }
        if !self.media.set_local_enabled(MediaKind::Video, enabled) {
            tracing::debug!(target = "tandem::media", "no local video track to toggle");
        }
        if let Some((partner, room_id)) = self.partner_route() {
            self.send(Signal::CamToggle(CamToggle {
                enabled,
                from: None,
                to: Some(partner),
                room_id,
            }));
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.session.is_none() {
            self.invalid("set_muted");
            return;
        }
        if !self.media.set_local_enabled(MediaKind::Audio, !muted) {
            tracing::debug!(target = "tandem::media", "no local audio track to toggle");
        }
    }

    pub fn set_pip(&mut self, in_pip: bool) {
        let Some((partner, room_id)) = self.partner_route() else {
            self.invalid("set_pip");
            return;
        };
        self.send(Signal::PipState(PipState {
            in_pip,
            from: None,
            to: Some(partner),
            room_id,
        }));
    }

    /// Restarts are suppressed while backgrounded; coming back re-checks
    /// health right away.
    pub async fn set_backgrounded(&mut self, backgrounded: bool) {
        self.supervisor.set_backgrounded(backgrounded);
        tracing::debug!(target = "tandem::session", backgrounded, "host app state");
        if !backgrounded {
            self.poll_health().await;
        }
    }

    /// Ends the session if the host reports that call mode went away.
    pub async fn refresh_host(&mut self) -> bool {
        if self.session.is_some() && !self.host.is_call_mode_active() {
            tracing::info!(target = "tandem::session", "call mode inactive; tearing down");
            self.end_with(EndReason::CallInactive, Some("inactive")).await;
            return false;
        }
        true
    }

    // ---- inbound signaling -----------------------------------------------

    pub async fn handle_signal(&mut self, signal: Signal) {
        if !self.refresh_host().await {
            return;
        }
        tracing::trace!(
            target = "tandem::signal",
            event = signal.name(),
            from = signal.sender().unwrap_or("-"),
            "inbound"
        );
        match signal {
            Signal::MatchFound(found) => self.on_match_found(found).await,
            Signal::Offer(offer) => self.on_offer(offer).await,
            Signal::Answer(answer) => self.on_answer(answer).await,
            Signal::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            Signal::CamToggle(toggle) => self.on_cam_toggle(toggle),
            Signal::PipState(pip) => self.on_pip_state(pip),
            Signal::CallIncoming(call) => self.on_call_incoming(call),
            Signal::CallAccept(call) | Signal::CallAccepted(call) => {
                self.on_call_accepted(call).await
            }
            Signal::CallDecline(call) | Signal::CallDeclined(call) => {
                self.on_call_declined(call).await
            }
            Signal::CallEnd(call) | Signal::CallEnded(call) => self.on_call_ended(call).await,
            Signal::PeerLeft | Signal::PeerStopped | Signal::Hangup => {
                self.on_peer_departed(false).await
            }
            Signal::Disconnected => self.on_peer_departed(true).await,
            Signal::Start
            | Signal::Stop
            | Signal::Next
            | Signal::RoomJoinAck(_)
            | Signal::RoomLeave(_)
            | Signal::FriendCall(_) => {
                tracing::trace!(target = "tandem::signal", "outbound-only event ignored");
            }
        }
    }

    async fn on_match_found(&mut self, found: MatchFound) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(target = "tandem::session", "match_found without session");
            return;
        };
        if session.kind != SessionKind::Ephemeral {
            tracing::debug!(target = "tandem::session", "match_found during persistent call");
            return;
        }
        if let Some(partner) = session.partner_id.as_deref() {
            if partner != found.peer_id {
                tracing::debug!(target = "tandem::session", partner = %partner, peer = %found.peer_id, "match_found for another partner");
            }
            return;
        }

        let (role, politeness) = match found.initiator {
            Some(true) => (Role::Initiator, Politeness::Impolite),
            Some(false) => (Role::Receiver, Politeness::Polite),
            // the partner may not know its id either, so both can end up offering
            None => match self.host.local_peer_id() {
                Some(local) if local.as_str() > found.peer_id.as_str() => {
                    (Role::Receiver, Politeness::Polite)
                }
                _ => (Role::Initiator, Politeness::ByOfferHash),
            },
        };
        session.role = role;
        session.partner_id = Some(found.peer_id.clone());
        session.partner_user_id = found.user_id.clone();
        session.room_id = found.room_id.clone();
        tracing::info!(
            target = "tandem::session",
            session = %session.id,
            partner = %found.peer_id,
            role = ?role,
            "matched"
        );
        self.adopt_partner(&found.peer_id, found.room_id.clone(), role, politeness)
            .await;
        if role == Role::Initiator {
            self.send_offer(false).await;
        }
    }

    /// Shared tail of every way a partner becomes known.
    async fn adopt_partner(
        &mut self,
        partner: &str,
        room_id: Option<String>,
        role: Role,
        politeness: Politeness,
    ) {
        self.connections.set_politeness(politeness);
        self.presence.set_partner(Some(partner));
        self.notify(SessionEvent::Matched {
            partner_id: partner.to_string(),
            room_id: room_id.clone(),
            role,
        });
        if let Some(room_id) = room_id {
            self.send(Signal::RoomJoinAck(RoomRef { room_id }));
        }
        if let Some(token) = self.prepare_connection().await {
            self.supervisor.start(token);
        }
        self.flush_outbound_candidates(partner);
    }

    async fn on_offer(&mut self, offer: SdpSignal) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(target = "tandem::session", "offer without session");
            return;
        };
        if session.kind == SessionKind::Ephemeral && session.partner_id.is_none() {
            let Some(sender) = offer.from.clone() else {
                tracing::debug!(target = "tandem::session", "anonymous offer while searching");
                return;
            };
            session.role = Role::Receiver;
            session.partner_id = Some(sender.clone());
            session.partner_user_id = offer.from_user_id.clone();
            if offer.room_id.is_some() {
                session.room_id = offer.room_id.clone();
            }
            let room_id = session.room_id.clone();
            tracing::info!(target = "tandem::session", partner = %sender, "offer before match; adopting sender");
            self.adopt_partner(&sender, room_id, Role::Receiver, Politeness::Polite)
                .await;
        } else if !session.is_partner(offer.from.as_deref()) {
            tracing::debug!(
                target = "tandem::session",
                from = offer.from.as_deref().unwrap_or("-"),
                "offer from non-partner ignored"
            );
            return;
        } else if self.ringing.is_some() {
            self.stop_ringing();
        }

        let Some(sender) = self.sender_key(offer.from.as_deref()) else {
            return;
        };
        let Some(token) = self.prepare_connection().await else {
            return;
        };
        self.supervisor.start(token);
        if let Admission::Duplicate(key) =
            self.ledger
                .admit(SignalKind::Offer, &sender, token, &offer.sdp)
        {
            tracing::trace!(target = "tandem::signal", counter = key.sequence_counter, "duplicate offer");
            return;
        }

        match self
            .connections
            .apply_remote_description(SessionDescription::offer(offer.sdp))
            .await
        {
            Ok(RemoteApplied::Offer { rolled_back }) => {
                if rolled_back {
                    if let Some(session) = self.session.as_mut() {
                        session.role = Role::Receiver;
                    }
                }
            }
            Ok(RemoteApplied::Answer) => {}
            Err(err) => {
                self.log_negotiation("apply_remote_offer", &err);
                return;
            }
        }
        self.flush_inbound_candidates().await;

        match self.connections.create_answer().await {
            Ok(answer) => {
                if !self.connections.is_current(token) {
                    return;
                }
                let (to, room_id) = self.route_to(&sender);
                self.send(Signal::Answer(SdpSignal {
                    to: Some(to),
                    from: None,
                    sdp: answer.sdp,
                    room_id,
                    from_user_id: self.host.local_user_id(),
                }));
            }
            Err(err) => self.log_negotiation("create_answer", &err),
        }
    }

    async fn on_answer(&mut self, answer: SdpSignal) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.is_partner(answer.from.as_deref()) {
            tracing::debug!(target = "tandem::session", "answer from non-partner ignored");
            return;
        }
        let Some(sender) = self.sender_key(answer.from.as_deref()) else {
            return;
        };
        if self.connections.handle().is_none() {
            tracing::trace!(target = "tandem::connection", "answer without connection");
            return;
        }
        let token = self.connections.current_token();
        if !self
            .ledger
            .admit(SignalKind::Answer, &sender, token, &answer.sdp)
            .is_fresh()
        {
            tracing::trace!(target = "tandem::signal", "duplicate answer");
            return;
        }
        match self
            .connections
            .apply_remote_description(SessionDescription::answer(answer.sdp))
            .await
        {
            Ok(_) => self.flush_inbound_candidates().await,
            Err(err) => self.log_negotiation("apply_remote_answer", &err),
        }
    }

    async fn on_remote_candidate(&mut self, signal: CandidateSignal) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let sender = match (session.partner_id.as_deref(), signal.from.as_deref()) {
            (Some(partner), Some(from)) if partner != from => {
                tracing::trace!(target = "tandem::ice", from = %from, "candidate from non-partner");
                return;
            }
            (Some(partner), _) => partner.to_string(),
            // searching: keep it under the sender until an offer adopts them
            (None, Some(from)) => from.to_string(),
            (None, None) => return,
        };
        let room_id = signal.room_id.clone().or_else(|| session.room_id.clone());
        let candidate = IceCandidate::from(signal.candidate);
        let token = self.connections.current_token();
        let payload = format!(
            "{}|{}|{}",
            candidate.candidate.trim(),
            candidate.sdp_mid.as_deref().unwrap_or(""),
            candidate
                .sdp_mline_index
                .map(|index| index.to_string())
                .unwrap_or_default()
        );
        if !self
            .ledger
            .admit(SignalKind::Candidate, &sender, token, &payload)
            .is_fresh()
        {
            tracing::trace!(target = "tandem::signal", "duplicate candidate");
            return;
        }
        self.ice
            .enqueue_inbound(&sender, candidate, room_id.as_deref());
        self.flush_inbound_candidates().await;
    }

    fn on_cam_toggle(&mut self, toggle: CamToggle) {
        let Some(partner) = self.partner_if_sender(toggle.from.as_deref()) else {
            return;
        };
        let changes = self
            .presence
            .on_explicit_camera(&partner, toggle.enabled, Instant::now());
        self.publish_presence(changes);
    }

    fn on_pip_state(&mut self, pip: PipState) {
        let Some(partner) = self.partner_if_sender(pip.from.as_deref()) else {
            return;
        };
        let changes = self
            .presence
            .on_explicit_pip(&partner, pip.in_pip, Instant::now());
        self.publish_presence(changes);
    }

    fn on_call_incoming(&mut self, call: CallSignal) {
        if self.incoming.contains_key(&call.call_id) {
            tracing::trace!(target = "tandem::session", call = %call.call_id, "repeated call:incoming");
            return;
        }
        if self.session.as_ref().and_then(|s| s.call_id.as_deref()) == Some(call.call_id.as_str()) {
            return;
        }
        let Some(caller) = call.from.clone() else {
            tracing::debug!(target = "tandem::session", "call:incoming without caller");
            return;
        };
        let reason = if self.session.is_some() {
            Some(REASON_BUSY)
        } else if !self.host.is_friend(&caller) {
            Some(REASON_NOT_FRIEND)
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::info!(target = "tandem::session", call = %call.call_id, reason, "incoming call auto-declined");
            self.send(Signal::CallDecline(CallSignal {
                call_id: call.call_id,
                room_id: call.room_id,
                from: None,
                to: Some(caller),
                reason: Some(reason.into()),
            }));
            return;
        }
        self.notify(SessionEvent::IncomingCall {
            call_id: call.call_id.clone(),
            from: caller,
            room_id: call.room_id.clone(),
        });
        self.incoming.insert(call.call_id.clone(), call);
    }

    async fn on_call_accepted(&mut self, call: CallSignal) {
        if self.ringing.as_deref() != Some(call.call_id.as_str()) {
            tracing::trace!(target = "tandem::session", call = %call.call_id, "accept for no ringing call");
            return;
        }
        self.stop_ringing();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(from) = call.from.clone() {
            session.partner_id = Some(from);
        }
        let room_id = call.room_id.clone().unwrap_or_else(|| call.call_id.clone());
        session.room_id = Some(room_id.clone());
        let Some(partner) = session.partner_id.clone() else {
            return;
        };
        tracing::info!(target = "tandem::session", call = %call.call_id, partner = %partner, "call accepted");
        self.adopt_partner(&partner, Some(room_id), Role::Initiator, Politeness::Impolite)
            .await;
        self.send_offer(false).await;
    }

    async fn on_call_declined(&mut self, call: CallSignal) {
        if self.incoming.remove(&call.call_id).is_some() {
            self.notify(SessionEvent::IncomingCancelled {
                call_id: call.call_id,
            });
            return;
        }
        if self.is_current_call(&call.call_id) {
            tracing::info!(
                target = "tandem::session",
                call = %call.call_id,
                reason = call.reason.as_deref().unwrap_or("-"),
                "call declined"
            );
            let reason = if call.reason.as_deref() == Some(REASON_BUSY) {
                EndReason::Busy
            } else {
                EndReason::Declined
            };
            self.end_with(reason, None).await;
        }
    }

    async fn on_call_ended(&mut self, call: CallSignal) {
        if self.incoming.remove(&call.call_id).is_some() {
            self.notify(SessionEvent::IncomingCancelled {
                call_id: call.call_id,
            });
            return;
        }
        if self.is_current_call(&call.call_id) {
            self.end_with(EndReason::RemoteHangup, None).await;
        }
    }

    async fn on_peer_departed(&mut self, transport_only: bool) {
        let kind = match self.session.as_ref() {
            Some(session) if session.partner_id.is_some() => session.kind,
            _ => return,
        };
        match kind {
            SessionKind::Ephemeral => {
                self.notify(SessionEvent::Disconnected);
                self.return_to_search().await;
            }
            SessionKind::Persistent if transport_only => {
                self.notify(SessionEvent::Disconnected);
            }
            SessionKind::Persistent => {
                self.end_with(EndReason::RemoteHangup, None).await;
            }
        }
    }

    // ---- internal events -------------------------------------------------

    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connection(event) => {
                if !self.connections.is_current(event.token) {
                    tracing::trace!(
                        target = "tandem::connection",
                        token = %event.token,
                        current = %self.connections.current_token(),
                        "stale connection event dropped"
                    );
                    return;
                }
                match event.kind {
                    ConnectionEventKind::LocalCandidate(candidate) => {
                        self.on_local_candidate(candidate)
                    }
                    ConnectionEventKind::StateChanged(state) => {
                        self.on_connection_state(event.token, state).await
                    }
                    ConnectionEventKind::RemoteTrack { stream_id, track } => {
                        self.on_remote_track(stream_id, track)
                    }
                }
            }
            EngineEvent::Timer(fired) => self.on_timer(fired).await,
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        match self.partner_route() {
            Some((partner, room_id)) => self.send(Signal::IceCandidate(CandidateSignal {
                to: Some(partner),
                from: None,
                candidate: candidate.into(),
                room_id,
            })),
            None => self.ice.cache_outbound(candidate),
        }
    }

    async fn on_connection_state(&mut self, token: GenerationToken, state: ConnectionState) {
        let Some(lifecycle) = self.session.as_ref().map(|s| s.lifecycle) else {
            return;
        };
        let now = Instant::now();
        let observation = self.supervisor.observe(state, now);

        if state.is_healthy() && lifecycle == Lifecycle::Negotiating {
            self.activate(token, now);
        } else if observation.notice == Some(HealthNotice::Recovered) {
            self.notify(SessionEvent::Connected);
        }
        match observation.notice {
            Some(HealthNotice::Reconnecting) => self.notify(SessionEvent::Reconnecting),
            Some(HealthNotice::Closed) if lifecycle == Lifecycle::Active => {
                self.notify(SessionEvent::Disconnected)
            }
            _ => {}
        }
        if observation.restart {
            self.restart_ice(token).await;
        }
    }

    fn activate(&mut self, token: GenerationToken, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.lifecycle = Lifecycle::Active;
        tracing::info!(
            target = "tandem::session",
            session = %session.id,
            token = %token,
            setup_ms = session.age().as_millis() as u64,
            "connected"
        );
        self.connections.mark_established();
        self.supervisor.start(token);
        self.presence.on_established(now);
        self.presence.start_polling(token);
        self.media.start_meter(token);
        self.notify(SessionEvent::Connected);
    }

    fn on_remote_track(&mut self, stream_id: String, track: Arc<dyn MediaTrack>) {
        if self.session.is_none() {
            return;
        }
        tracing::debug!(
            target = "tandem::media",
            stream = %stream_id,
            track = %track.id(),
            kind = ?track.kind(),
            "remote track"
        );
        let is_new = self.media.add_remote_track(&stream_id, track);
        self.notify(SessionEvent::StreamChanged {
            slot: StreamSlot::Remote,
            stream_id: Some(stream_id),
        });
        if is_new {
            let has_video = self
                .media
                .remote()
                .map(|stream| stream.track(MediaKind::Video).is_some())
                .unwrap_or(false);
            let changes = self.presence.on_stream_arrived(has_video, Instant::now());
            self.publish_presence(changes);
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if !self.connections.is_current(fired.token) {
            tracing::trace!(target = "tandem::session", timer = fired.kind.as_str(), "stale timer tick");
            return;
        }
        if !self.refresh_host().await {
            return;
        }
        match fired.kind {
            TimerKind::RingTimeout => {
                if self.ringing.is_some() {
                    tracing::info!(target = "tandem::session", "ring timed out");
                    self.ringing = None;
                    self.end_with(EndReason::Timeout, Some("timeout")).await;
                }
            }
            TimerKind::HealthPoll | TimerKind::HealthCheck => self.poll_health().await,
            TimerKind::RemoteTrackPoll => {
                let (video, audio) = match self.media.remote() {
                    Some(stream) => (
                        stream.track(MediaKind::Video).map(|t| TrackSample::of(t.as_ref())),
                        stream.track(MediaKind::Audio).map(|t| TrackSample::of(t.as_ref())),
                    ),
                    None => (None, None),
                };
                let changes = self.presence.sample(video, audio, Instant::now());
                self.publish_presence(changes);
            }
            TimerKind::MicLevel => {
                if self.lifecycle() != Lifecycle::Active {
                    return;
                }
                let Some(connection) = self.connections.handle().map(|h| h.connection().clone())
                else {
                    return;
                };
                if let Some(levels) = self.media.sample_levels(connection.as_ref()).await {
                    if self.connections.is_current(fired.token) {
                        self.notify(SessionEvent::AudioLevel(levels));
                    }
                }
            }
        }
    }

    async fn poll_health(&mut self) {
        let Some(state) = self.connections.connection_state() else {
            return;
        };
        let token = self.connections.current_token();
        self.on_connection_state(token, state).await;
    }

    // ---- negotiation helpers ---------------------------------------------

    /// Local media plus a connection bound to it, recreating the stream when
    /// its tracks turn out dead or the constructor fails.
    async fn prepare_connection(&mut self) -> Option<GenerationToken> {
        let mut stream = match self.media.local().cloned() {
            Some(stream) => stream,
            None => match self.media.acquire_local().await {
                Ok(stream) => {
                    self.notify_stream(StreamSlot::Local, Some(stream.id().to_string()));
                    stream
                }
                Err(err) => {
                    self.fail_media(err).await;
                    return None;
                }
            },
        };

        loop {
            let err = match self.connections.ensure_connection(&stream).await {
                Ok(token) => return Some(token),
                Err(err) => err,
            };
            match err.class() {
                ErrorClass::Media | ErrorClass::Connection => {}
                _ => {
                    self.log_negotiation("ensure_connection", &err);
                    return None;
                }
            }
            if self.recreations >= self.config.max_stream_recreations {
                tracing::warn!(
                    target = "tandem::media",
                    error = %err,
                    recreations = self.recreations,
                    "giving up on connection setup"
                );
                let media_err = match err {
                    NegotiationError::Media(media) => media,
                    _ => MediaError::StreamEnded(stream.id().to_string()),
                };
                self.fail_media(media_err).await;
                return None;
            }
            self.recreations += 1;
            tracing::warn!(
                target = "tandem::media",
                error = %err,
                attempt = self.recreations,
                "recreating local stream"
            );
            stream = match self.media.recreate_local().await {
                Ok(stream) => stream,
                Err(err) => {
                    self.fail_media(err).await;
                    return None;
                }
            };
            self.notify_stream(StreamSlot::Local, Some(stream.id().to_string()));
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) -> bool {
        let Some((partner, room_id)) = self.partner_route() else {
            return false;
        };
        // restarts renegotiate the connection they were decided for
        let token = if ice_restart {
            self.connections.current_token()
        } else {
            match self.prepare_connection().await {
                Some(token) => token,
                None => return false,
            }
        };
        match self.connections.create_offer(ice_restart).await {
            Ok(offer) if self.connections.is_current(token) => {
                self.send(Signal::Offer(SdpSignal {
                    to: Some(partner),
                    from: None,
                    sdp: offer.sdp,
                    room_id,
                    from_user_id: self.host.local_user_id(),
                }));
                true
            }
            Ok(_) => false,
            Err(err) => {
                self.log_negotiation("create_offer", &err);
                false
            }
        }
    }

    async fn restart_ice(&mut self, token: GenerationToken) {
        if !self.connections.is_current(token) {
            tracing::trace!(target = "tandem::reconnect", "restart aborted: stale token");
            return;
        }
        if self.connections.signaling_state() != Some(SignalingState::Stable) {
            tracing::debug!(
                target = "tandem::reconnect",
                state = ?self.connections.signaling_state(),
                "restart aborted: negotiation in flight"
            );
            return;
        }
        if self.send_offer(true).await {
            self.supervisor.record_restart(Instant::now());
        }
    }

    async fn flush_inbound_candidates(&mut self) {
        let Some(handle) = self.connections.handle() else {
            return;
        };
        let (partner, room_id) = match self.session.as_ref() {
            Some(session) => (session.partner_id.clone(), session.room_id.clone()),
            None => return,
        };
        let current = self.connections.current_token();
        if let Err(err) = self
            .ice
            .flush_inbound(partner.as_deref(), room_id.as_deref(), handle, current)
            .await
        {
            self.log_negotiation("flush_inbound", &err);
        }
    }

    fn flush_outbound_candidates(&mut self, partner: &str) {
        let room_id = self.session.as_ref().and_then(|s| s.room_id.clone());
        for candidate in self.ice.flush_outbound_cache(partner) {
            self.send(Signal::IceCandidate(CandidateSignal {
                to: Some(partner.to_string()),
                from: None,
                candidate: candidate.into(),
                room_id: room_id.clone(),
            }));
        }
    }

    fn log_negotiation(&self, operation: &'static str, err: &NegotiationError) {
        match err.class() {
            ErrorClass::Stale | ErrorClass::Duplicate => {
                tracing::trace!(target = "tandem::connection", operation, error = %err, "dropped")
            }
            ErrorClass::TransientRace => {
                tracing::debug!(target = "tandem::connection", operation, error = %err, "race resolved locally")
            }
            ErrorClass::Media | ErrorClass::Connection | ErrorClass::Fatal => {
                tracing::warn!(target = "tandem::connection", operation, error = %err, "negotiation failed")
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    /// Drops the current partner and connection, keeping local media, then
    /// searches again.
    async fn return_to_search(&mut self) {
        let room_id = self.session.as_ref().and_then(|s| s.room_id.clone());
        let token = self.teardown_connection().await;
        if let Some(session) = self.session.as_mut() {
            session.partner_id = None;
            session.partner_user_id = None;
            session.room_id = None;
            session.role = Role::Initiator;
            session.lifecycle = Lifecycle::Negotiating;
        }
        self.recreations = 0;
        self.presence.clear();
        if let Some(room_id) = room_id {
            self.send(Signal::RoomLeave(RoomRef { room_id }));
        }
        tracing::info!(target = "tandem::session", token = %token, "searching for next partner");
        self.send(Signal::Next);
        if self.prepare_connection().await.is_some() {
            self.notify(SessionEvent::Searching);
        }
    }

    /// Bumps the token, stops outbound media, closes the connection and
    /// clears everything tied to it.
    async fn teardown_connection(&mut self) -> GenerationToken {
        let token = self.connections.teardown().await;
        self.ice.reset(false);
        self.ledger.retain_token(token);
        self.supervisor.stop();
        self.presence.reset();
        let had_remote = self.media.remote().is_some();
        self.media.reset_remote();
        if had_remote {
            self.notify_stream(StreamSlot::Remote, None);
        }
        token
    }

    async fn end_with(&mut self, reason: EndReason, remote_reason: Option<&str>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.lifecycle == Lifecycle::Ending {
            return;
        }
        session.lifecycle = Lifecycle::Ending;
        let session_id = session.id.clone();
        let kind = session.kind;
        let call_id = session.call_id.clone();
        let partner = session.partner_id.clone();
        let room_id = session.room_id.clone();

        self.timers.abort_all();
        self.ringing = None;
        self.teardown_connection().await;
        self.ledger.clear();
        self.presence.clear();
        let had_local = self.media.local().is_some();
        self.media.release_all();
        if had_local {
            self.notify_stream(StreamSlot::Local, None);
        }

        if let Some(remote_reason) = remote_reason {
            match (kind, call_id) {
                (SessionKind::Persistent, Some(call_id)) => {
                    self.send(Signal::CallEnd(CallSignal {
                        call_id,
                        room_id: room_id.clone(),
                        from: None,
                        to: partner,
                        reason: Some(remote_reason.to_string()),
                    }))
                }
                (SessionKind::Ephemeral, _) => self.send(Signal::Stop),
                (SessionKind::Persistent, None) => {}
            }
        }
        if let Some(room_id) = room_id {
            self.send(Signal::RoomLeave(RoomRef { room_id }));
        }

        self.session = None;
        self.recreations = 0;
        tracing::info!(
            target = "tandem::session",
            session = %session_id,
            reason = reason.as_str(),
            "session ended"
        );
        self.notify(SessionEvent::Ended { reason });
    }

    async fn fail_media(&mut self, err: MediaError) {
        tracing::warn!(target = "tandem::media", error = %err, "media unavailable");
        self.notify(SessionEvent::MediaFailed(err));
        self.end_with(EndReason::MediaUnavailable, Some("media-unavailable"))
            .await;
    }

    // ---- small helpers ---------------------------------------------------

    fn stop_ringing(&mut self) {
        self.ringing = None;
        self.timers.cancel(TimerKind::RingTimeout);
    }

    fn is_current_call(&self, call_id: &str) -> bool {
        self.session
            .as_ref()
            .and_then(|session| session.call_id.as_deref())
            == Some(call_id)
    }

    fn expect_idle(&self, operation: &'static str) -> bool {
        if self.session.is_some() {
            self.invalid(operation);
            return false;
        }
        true
    }

    fn invalid(&self, operation: &'static str) {
        tracing::warn!(
            target = "tandem::session",
            operation,
            lifecycle = ?self.lifecycle(),
            "ignored: invalid in current lifecycle"
        );
    }

    fn partner_route(&self) -> Option<(String, Option<String>)> {
        let session = self.session.as_ref()?;
        let partner = session.partner_id.clone()?;
        Some((partner, session.room_id.clone()))
    }

    fn route_to(&self, sender: &str) -> (String, Option<String>) {
        let room_id = self.session.as_ref().and_then(|s| s.room_id.clone());
        (sender.to_string(), room_id)
    }

    /// Ledger and queue key for a message; relays that omit `from` only ever
    /// forward the partner.
    fn sender_key(&self, from: Option<&str>) -> Option<String> {
        from.map(str::to_string).or_else(|| {
            self.session
                .as_ref()
                .and_then(|session| session.partner_id.clone())
        })
    }

    fn partner_if_sender(&self, from: Option<&str>) -> Option<String> {
        let session = self.session.as_ref()?;
        if !session.is_partner(from) {
            tracing::trace!(target = "tandem::presence", "presence from non-partner ignored");
            return None;
        }
        session.partner_id.clone()
    }

    fn publish_presence(&self, changes: Vec<PresenceChange>) {
        for change in changes {
            let event = match change {
                PresenceChange::Camera(on) => SessionEvent::RemoteCameraChanged(on),
                PresenceChange::Muted(muted) => SessionEvent::RemoteMutedChanged(muted),
                PresenceChange::Pip(in_pip) => SessionEvent::RemotePipChanged(in_pip),
            };
            self.notify(event);
        }
    }

    fn notify_stream(&self, slot: StreamSlot, stream_id: Option<String>) {
        self.notify(SessionEvent::StreamChanged { slot, stream_id });
    }

    fn notify(&self, event: SessionEvent) {
        tracing::trace!(target = "tandem::session", event = ?event, "session event");
        if self.events.send(event).is_err() {
            tracing::trace!(target = "tandem::session", "event receiver dropped");
        }
    }

    fn send(&self, signal: Signal) {
        let name = signal.name();
        if let Err(err) = self.bus.emit(signal) {
            tracing::warn!(target = "tandem::signal", event = name, error = %err, "emit failed");
        }
    }
}
