//! Call manager: the session controller.
//!
//! All state transitions run through this type, as reactions to one of
//! three event sources: local user intent, media acquisition completion,
//! and signaling/connection events. Nothing here blocks the event loop;
//! acquisition and negotiation steps run on spawned pipelines whose
//! completions re-check session liveness, so an end-call that pre-empts
//! them turns the in-flight completion into a no-op.

use crate::connection::{
    ConnectionEvent, ConnectionFactory, ConnectionSignal, ConnectionState, SessionDescription,
};
use crate::error::CallError;
use crate::events::{CallEvent, CallEventBus};
use crate::identity::IdentityDirectory;
use crate::media::MediaSource;
use crate::signaling::{SignalEnvelope, SignalPayload};
use crate::state::{CallSession, CallSnapshot, CallState, CallTransition, InvalidTransition};
use crate::transport::SignalingTransport;
use crate::types::{
    CallRole, EndReason, FailureReason, MediaAspect, MediaKind, PeerId, SessionId,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Maximum concurrent non-terminal sessions.
    pub max_concurrent_calls: usize,
    /// Seconds an outgoing call may ring before it is abandoned.
    pub ring_timeout_secs: u64,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            ring_timeout_secs: 45,
        }
    }
}

/// What to tell the peer when a session terminates locally.
enum PeerNotice {
    None,
    End,
    Reject,
}

/// Orchestrates call sessions: media acquisition, negotiation, signaling
/// relay, toggles, and teardown.
pub struct CallManager {
    local_identity: PeerId,
    config: CallManagerConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaSource>,
    connections: Arc<dyn ConnectionFactory>,
    directory: Option<Arc<dyn IdentityDirectory>>,
    sessions: RwLock<HashMap<SessionId, CallSession>>,
    events: CallEventBus,
    conn_tx: mpsc::UnboundedSender<ConnectionSignal>,
    weak: Weak<CallManager>,
}

impl CallManager {
    /// Create a new call manager and start its connection-event pump.
    pub fn new(
        local_identity: PeerId,
        config: CallManagerConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaSource>,
        connections: Arc<dyn ConnectionFactory>,
        directory: Option<Arc<dyn IdentityDirectory>>,
    ) -> Arc<Self> {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|weak| Self {
            local_identity,
            config,
            transport,
            media,
            connections,
            directory,
            sessions: RwLock::new(HashMap::new()),
            events: CallEventBus::new(),
            conn_tx,
            weak: weak.clone(),
        });

        let pump = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(signal) = conn_rx.recv().await {
                let Some(manager) = pump.upgrade() else { break };
                manager.handle_connection_signal(signal).await;
            }
        });

        manager
    }

    pub fn local_identity(&self) -> &PeerId {
        &self.local_identity
    }

    /// Subscribe to the observable event feed.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    // ==================== Local intent ====================

    /// Start an outgoing call. Returns immediately with the new session
    /// id; media acquisition and negotiation continue asynchronously.
    pub async fn start_call(
        &self,
        peer: PeerId,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        self.cleanup_ended_sessions().await;

        if !self.transport.is_reachable(&peer).await {
            return Err(CallError::PeerUnreachable(peer));
        }

        let session_id = SessionId::generate();
        {
            let mut sessions = self.sessions.write().await;
            let live = sessions.values().filter(|s| !s.state.is_terminal()).count();
            if live >= self.config.max_concurrent_calls {
                return Err(CallError::TooManyCalls(self.config.max_concurrent_calls));
            }

            let mut session =
                CallSession::new_outgoing(session_id.clone(), peer.clone(), media_kind);
            session.apply_transition(CallTransition::DialStarted)?;
            sessions.insert(session_id.clone(), session);
        }
        info!("starting {media_kind:?} call {session_id} to {peer}");
        self.publish_state(&session_id, CallState::Initiating);

        if let Some(manager) = self.weak.upgrade() {
            tokio::spawn(manager.drive_outgoing(session_id.clone()));
        }
        Ok(session_id)
    }

    /// Accept a ringing incoming call: creates and sends the answer.
    pub async fn accept_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        let (connection, peer) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
            if !session.state.can_accept() {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "AnswerSent".to_string(),
                }));
            }
            (session.connection.clone(), session.peer.clone())
        };
        let Some(connection) = connection else {
            return Err(CallError::NotFound(session_id.to_string()));
        };

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("answer creation failed for session {session_id}: {e}");
                self.fail_session(session_id, FailureReason::NegotiationFailed)
                    .await;
                return Err(e.into());
            }
        };

        if self.is_live(session_id).await {
            self.send_signal(
                session_id.clone(),
                peer,
                SignalPayload::CallAnswer {
                    description: answer,
                },
            )
            .await;
            self.try_transition(session_id, CallTransition::AnswerSent)
                .await;
        }
        Ok(())
    }

    /// Reject a ringing incoming call without ever creating an answer.
    pub async fn reject_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
            if !session.state.can_reject() {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: format!("{:?}", session.state),
                    attempted: "EndRequested(Rejected)".to_string(),
                }));
            }
        }
        self.terminate_session(session_id, EndReason::Rejected, PeerNotice::Reject)
            .await
    }

    /// End a call in any state. Idempotent: ending an already-terminal
    /// session is a no-op, never a double release.
    pub async fn end_call(&self, session_id: &SessionId) -> Result<(), CallError> {
        self.terminate_session(session_id, EndReason::HungUp, PeerNotice::End)
            .await
    }

    /// Toggle the local audio tracks. Never renegotiates, never stops the
    /// capture device, never changes session state.
    pub async fn set_audio_enabled(
        &self,
        session_id: &SessionId,
        enabled: bool,
    ) -> Result<(), CallError> {
        self.set_aspect_enabled(session_id, MediaAspect::Audio, enabled)
            .await
    }

    /// Toggle the local video tracks. Same independence rules as audio.
    pub async fn set_video_enabled(
        &self,
        session_id: &SessionId,
        enabled: bool,
    ) -> Result<(), CallError> {
        self.set_aspect_enabled(session_id, MediaAspect::Video, enabled)
            .await
    }

    async fn set_aspect_enabled(
        &self,
        session_id: &SessionId,
        aspect: MediaAspect,
        enabled: bool,
    ) -> Result<(), CallError> {
        let peer = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
            if session.state.is_terminal() {
                return Ok(());
            }
            match aspect {
                MediaAspect::Audio => session.audio_enabled = enabled,
                MediaAspect::Video => session.video_enabled = enabled,
            }
            if let Some(media) = &session.local_media {
                media.set_enabled(aspect, enabled);
            }
            session.peer.clone()
        };

        // Best-effort presentation sync; loss never affects call state.
        self.send_signal(
            session_id.clone(),
            peer,
            SignalPayload::ToggleNotify { aspect, enabled },
        )
        .await;
        Ok(())
    }

    // ==================== Observation ====================

    pub async fn get_session(&self, session_id: &SessionId) -> Option<CallSnapshot> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.snapshot())
    }

    /// All non-terminal sessions.
    pub async fn active_sessions(&self) -> Vec<CallSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.snapshot())
            .collect()
    }

    pub async fn has_connected_call(&self) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|s| s.state.is_connected())
    }

    /// Drop terminal sessions from memory.
    pub async fn cleanup_ended_sessions(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| !s.state.is_terminal());
    }

    // ==================== Inbound signaling ====================

    /// Dispatch one inbound signaling envelope.
    ///
    /// Messages referencing unknown or already-terminal sessions are
    /// dropped silently; malformed candidates are tolerated.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        if envelope.recipient != self.local_identity {
            debug!(
                "dropping {} addressed to {} (we are {})",
                envelope.kind(),
                envelope.recipient,
                self.local_identity
            );
            return;
        }
        debug!(
            "received {} from {} (session {})",
            envelope.kind(),
            envelope.sender,
            envelope.session_id
        );

        let SignalEnvelope {
            session_id,
            sender,
            payload,
            ..
        } = envelope;

        match payload {
            SignalPayload::CallOffer {
                media_kind,
                description,
            } => {
                self.handle_offer(session_id, sender, media_kind, description)
                    .await;
            }
            SignalPayload::CallAnswer { description } => {
                self.handle_answer(&session_id, description).await;
            }
            SignalPayload::IceCandidate { candidate } => {
                self.handle_candidate(&session_id, candidate).await;
            }
            SignalPayload::CallEnd => {
                self.handle_peer_end(&session_id, &sender, EndReason::PeerHungUp)
                    .await;
            }
            SignalPayload::CallReject => {
                self.handle_peer_end(&session_id, &sender, EndReason::PeerRejected)
                    .await;
            }
            SignalPayload::ToggleNotify { aspect, enabled } => {
                self.events.dispatch(CallEvent::PeerToggle {
                    session_id,
                    peer: sender,
                    aspect,
                    enabled,
                });
            }
        }
    }

    async fn handle_offer(
        &self,
        session_id: SessionId,
        peer: PeerId,
        media_kind: MediaKind,
        description: SessionDescription,
    ) {
        // Re-deliveries and offers for ids we already track (including
        // terminal ones) are dropped; a new id from the same peer starts
        // an independent session.
        if self.sessions.read().await.contains_key(&session_id) {
            debug!("dropping offer for known session {session_id}");
            return;
        }

        let profile = match &self.directory {
            Some(directory) => directory.lookup(&peer).await,
            None => None,
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session_id) {
                return;
            }
            let mut session =
                CallSession::new_incoming(session_id.clone(), peer.clone(), media_kind);
            if session.apply_transition(CallTransition::DialStarted).is_err() {
                return;
            }
            sessions.insert(session_id.clone(), session);
        }
        info!("incoming {media_kind:?} call {session_id} from {peer}");
        self.publish_state(&session_id, CallState::Initiating);
        self.events.dispatch(CallEvent::IncomingCall {
            session_id: session_id.clone(),
            peer,
            media_kind,
            profile,
        });

        if let Some(manager) = self.weak.upgrade() {
            tokio::spawn(manager.drive_incoming(session_id, description));
        }
    }

    async fn handle_answer(&self, session_id: &SessionId, description: SessionDescription) {
        let connection = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(session_id) else {
                debug!("dropping answer for unknown session {session_id}");
                return;
            };
            if session.role != CallRole::Caller
                || !matches!(
                    session.state,
                    CallState::Negotiating { .. } | CallState::Connecting { .. }
                )
            {
                debug!(
                    "dropping answer for session {session_id} in state {:?}",
                    session.state
                );
                return;
            }
            if session.remote_description_set {
                debug!("dropping duplicate answer for session {session_id}");
                return;
            }
            session.connection.clone()
        };
        let Some(connection) = connection else { return };

        if let Err(e) = connection.set_remote_description(description).await {
            warn!("rejected answer for session {session_id}: {e}");
            self.fail_session(session_id, FailureReason::NegotiationFailed)
                .await;
            return;
        }

        let buffered = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if session.state.is_terminal() {
                return;
            }
            session.remote_description_set = true;
            session
                .pending_remote_candidates
                .drain(..)
                .collect::<Vec<_>>()
        };
        if !buffered.is_empty() {
            debug!(
                "flushing {} buffered candidates for session {session_id}",
                buffered.len()
            );
        }
        for candidate in buffered {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("ignoring bad buffered candidate for session {session_id}: {e}");
            }
        }
    }

    async fn handle_candidate(
        &self,
        session_id: &SessionId,
        candidate: crate::connection::IceCandidate,
    ) {
        let connection = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                debug!("dropping candidate for unknown session {session_id}");
                return;
            };
            if session.state.is_terminal() {
                debug!("dropping candidate for ended session {session_id}");
                return;
            }
            if !session.remote_description_set {
                session.pending_remote_candidates.push_back(candidate);
                return;
            }
            session.connection.clone()
        };

        if let Some(connection) = connection {
            // Malformed or duplicate candidates are tolerated, never fatal.
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("ignoring bad candidate for session {session_id}: {e}");
            }
        }
    }

    async fn handle_peer_end(&self, session_id: &SessionId, sender: &PeerId, reason: EndReason) {
        let target = {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(session_id) {
                Some(session_id.clone())
            } else {
                // No id match: fall back to the peer identity.
                sessions
                    .values()
                    .find(|s| !s.state.is_terminal() && &s.peer == sender)
                    .map(|s| s.session_id.clone())
            }
        };
        let Some(target) = target else {
            debug!("dropping {reason:?} for unknown session {session_id}");
            return;
        };

        // Peer-initiated: terminate locally without echoing our own end.
        let _ = self
            .terminate_session(&target, reason, PeerNotice::None)
            .await;
    }

    // ==================== Connection events ====================

    /// Dispatch one event raised by a session's peer connection.
    pub async fn handle_connection_signal(&self, signal: ConnectionSignal) {
        let ConnectionSignal { session_id, event } = signal;
        match event {
            ConnectionEvent::StateChanged(ConnectionState::Connected) => {
                self.handle_transport_connected(&session_id).await;
            }
            ConnectionEvent::StateChanged(
                ConnectionState::Failed | ConnectionState::Disconnected,
            ) => {
                let reason = {
                    let sessions = self.sessions.read().await;
                    let Some(session) = sessions.get(&session_id) else {
                        return;
                    };
                    if session.state.is_terminal() {
                        return;
                    }
                    if session.state.is_connected() {
                        FailureReason::TransportUnreachable
                    } else {
                        FailureReason::NegotiationFailed
                    }
                };
                self.fail_session(&session_id, reason).await;
            }
            ConnectionEvent::StateChanged(state) => {
                debug!("session {session_id} connection state: {state:?}");
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                let peer = {
                    let sessions = self.sessions.read().await;
                    match sessions.get(&session_id) {
                        Some(s) if !s.state.is_terminal() => s.peer.clone(),
                        _ => return,
                    }
                };
                self.send_signal(session_id, peer, SignalPayload::IceCandidate { candidate })
                    .await;
            }
            ConnectionEvent::RemoteTrack(track) => {
                {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(&session_id) {
                        Some(s) if !s.state.is_terminal() => s.remote_tracks.push(track.clone()),
                        _ => return,
                    }
                }
                self.events.dispatch(CallEvent::RemoteMedia { session_id, track });
            }
        }
    }

    async fn handle_transport_connected(&self, session_id: &SessionId) {
        let state = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if !matches!(session.state, CallState::Connecting { .. }) {
                debug!(
                    "dropping connected event for session {session_id} in state {:?}",
                    session.state
                );
                return;
            }
            if session
                .apply_transition(CallTransition::TransportConnected)
                .is_err()
            {
                return;
            }
            // Entering Connected resets the toggles to the media kind's
            // defaults on both sides, whatever happened while ringing.
            session.audio_enabled = true;
            session.video_enabled = session.media_kind.has_video();
            if let Some(media) = &session.local_media {
                media.set_enabled(MediaAspect::Audio, true);
                media.set_enabled(MediaAspect::Video, session.media_kind.has_video());
            }
            session.state.clone()
        };
        info!("session {session_id} connected");
        self.publish_state(session_id, state);
    }

    /// Ring-timeout check for an outgoing call. Fires once per session,
    /// scheduled when the offer goes out.
    pub(crate) async fn handle_ring_timeout(&self, session_id: &SessionId) {
        let expired = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(s) => {
                    s.role == CallRole::Caller
                        && !s.remote_description_set
                        && !s.state.is_terminal()
                        && !matches!(s.state, CallState::Ending { .. })
                }
                None => false,
            }
        };
        if expired {
            info!("session {session_id} rang for too long, giving up");
            let _ = self
                .terminate_session(session_id, EndReason::RingTimeout, PeerNotice::End)
                .await;
        }
    }

    // ==================== Pipelines ====================

    /// Outgoing pipeline: acquire media, build the connection, produce and
    /// send the offer. Every step re-checks that the session is still
    /// live, so a concurrent end-call turns the rest into a no-op.
    async fn drive_outgoing(self: Arc<Self>, session_id: SessionId) {
        let Some((peer, media_kind)) = self.session_route(&session_id).await else {
            return;
        };
        if !self
            .try_transition(&session_id, CallTransition::MediaRequested)
            .await
        {
            return;
        }

        let stream = match self.media.acquire(media_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("media acquisition failed for session {session_id}: {e}");
                self.fail_session(&session_id, e.classify()).await;
                return;
            }
        };
        if !self.store_local_media(&session_id, stream.clone()).await {
            // Ended while we waited on the permission prompt.
            stream.stop_all();
            return;
        }

        let connection = match self
            .connections
            .create(session_id.clone(), self.conn_tx.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connection setup failed for session {session_id}: {e}");
                self.fail_session(&session_id, FailureReason::NegotiationFailed)
                    .await;
                return;
            }
        };
        if !self.store_connection(&session_id, connection.clone()).await {
            connection.close().await;
            return;
        }

        for track in stream.tracks() {
            if let Err(e) = connection.add_track(track.clone()).await {
                warn!("track registration failed for session {session_id}: {e}");
                self.fail_session(&session_id, FailureReason::NegotiationFailed)
                    .await;
                return;
            }
        }
        if !self
            .try_transition(&session_id, CallTransition::MediaReady)
            .await
        {
            return;
        }

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("offer creation failed for session {session_id}: {e}");
                self.fail_session(&session_id, FailureReason::NegotiationFailed)
                    .await;
                return;
            }
        };

        if !self.is_live(&session_id).await {
            return;
        }
        self.send_signal(
            session_id.clone(),
            peer,
            SignalPayload::CallOffer {
                media_kind,
                description: offer,
            },
        )
        .await;
        if !self
            .try_transition(&session_id, CallTransition::OfferSent)
            .await
        {
            return;
        }

        let timeout = Duration::from_secs(self.config.ring_timeout_secs);
        let weak = Arc::downgrade(&self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.handle_ring_timeout(&session_id).await;
            }
        });
    }

    /// Incoming pipeline: build the connection, apply the remote offer,
    /// then acquire media and ring. Candidates that raced ahead of the
    /// offer application are flushed in arrival order.
    async fn drive_incoming(self: Arc<Self>, session_id: SessionId, offer: SessionDescription) {
        let Some((_, media_kind)) = self.session_route(&session_id).await else {
            return;
        };

        let connection = match self
            .connections
            .create(session_id.clone(), self.conn_tx.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connection setup failed for session {session_id}: {e}");
                self.fail_session(&session_id, FailureReason::NegotiationFailed)
                    .await;
                return;
            }
        };
        if !self.store_connection(&session_id, connection.clone()).await {
            connection.close().await;
            return;
        }

        if let Err(e) = connection.set_remote_description(offer).await {
            warn!("rejected offer for session {session_id}: {e}");
            self.fail_session(&session_id, FailureReason::NegotiationFailed)
                .await;
            return;
        }
        let buffered = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            if session.state.is_terminal() {
                return;
            }
            session.remote_description_set = true;
            session
                .pending_remote_candidates
                .drain(..)
                .collect::<Vec<_>>()
        };
        for candidate in buffered {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("ignoring bad buffered candidate for session {session_id}: {e}");
            }
        }

        if !self
            .try_transition(&session_id, CallTransition::MediaRequested)
            .await
        {
            return;
        }
        let stream = match self.media.acquire(media_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("media acquisition failed for session {session_id}: {e}");
                self.fail_session(&session_id, e.classify()).await;
                return;
            }
        };
        if !self.store_local_media(&session_id, stream.clone()).await {
            stream.stop_all();
            return;
        }
        for track in stream.tracks() {
            if let Err(e) = connection.add_track(track.clone()).await {
                warn!("track registration failed for session {session_id}: {e}");
                self.fail_session(&session_id, FailureReason::NegotiationFailed)
                    .await;
                return;
            }
        }

        // Media and offer both ready: ring until accept or reject.
        self.try_transition(&session_id, CallTransition::MediaReady)
            .await;
    }

    // ==================== Teardown ====================

    /// Terminate a session: one transition into `Ending`, one release of
    /// media and connection, one transition into `Ended`. Safe to call
    /// again at any point; later calls are no-ops.
    async fn terminate_session(
        &self,
        session_id: &SessionId,
        reason: EndReason,
        notice: PeerNotice,
    ) -> Result<(), CallError> {
        let (media, connection, peer, state) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| CallError::NotFound(session_id.to_string()))?;
            if session.state.is_terminal() || matches!(session.state, CallState::Ending { .. }) {
                return Ok(());
            }
            session.apply_transition(CallTransition::EndRequested { reason })?;
            (
                session.local_media.take(),
                session.connection.take(),
                session.peer.clone(),
                session.state.clone(),
            )
        };
        info!("ending session {session_id}: {reason:?}");
        self.publish_state(session_id, state);

        match notice {
            PeerNotice::End => {
                self.send_signal(session_id.clone(), peer, SignalPayload::CallEnd)
                    .await;
            }
            PeerNotice::Reject => {
                self.send_signal(session_id.clone(), peer, SignalPayload::CallReject)
                    .await;
            }
            PeerNotice::None => {}
        }

        if let Some(media) = media {
            let stopped = media.stop_all();
            debug!("session {session_id}: stopped {stopped} local tracks");
        }
        if let Some(connection) = connection {
            connection.close().await;
        }

        let state = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(());
            };
            if session
                .apply_transition(CallTransition::ReleaseComplete)
                .is_err()
            {
                return Ok(());
            }
            session.state.clone()
        };
        self.publish_state(session_id, state);
        Ok(())
    }

    /// Fail a session with a user-facing classification. Performs the same
    /// release as a clean end. Media-acquisition failures never signal the
    /// peer; negotiation and transport failures do when the peer can know
    /// the session.
    async fn fail_session(&self, session_id: &SessionId, reason: FailureReason) {
        let (media, connection, peer, state, notify) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if session.state.is_terminal() || matches!(session.state, CallState::Ending { .. }) {
                return;
            }
            let notify = !matches!(
                reason,
                FailureReason::MediaAcquisitionDenied | FailureReason::MediaDeviceUnavailable
            ) && (session.role == CallRole::Callee
                || session.state.is_past_negotiation());
            if session
                .apply_transition(CallTransition::Failure { reason })
                .is_err()
            {
                return;
            }
            (
                session.local_media.take(),
                session.connection.take(),
                session.peer.clone(),
                session.state.clone(),
                notify,
            )
        };
        warn!("session {session_id} failed: {reason}");
        self.publish_state(session_id, state);

        if notify {
            self.send_signal(session_id.clone(), peer, SignalPayload::CallEnd)
                .await;
        }
        if let Some(media) = media {
            media.stop_all();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    // ==================== Helpers ====================

    fn publish_state(&self, session_id: &SessionId, state: CallState) {
        self.events.dispatch(CallEvent::StateChanged {
            session_id: session_id.clone(),
            state,
        });
    }

    async fn send_signal(&self, session_id: SessionId, recipient: PeerId, payload: SignalPayload) {
        let envelope =
            SignalEnvelope::new(session_id, self.local_identity.clone(), recipient, payload);
        debug!(
            "sending {} to {} (session {})",
            envelope.kind(),
            envelope.recipient,
            envelope.session_id
        );
        self.transport.send(envelope).await;
    }

    async fn session_route(&self, session_id: &SessionId) -> Option<(PeerId, MediaKind)> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| (s.peer.clone(), s.media_kind))
    }

    async fn is_live(&self, session_id: &SessionId) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| !s.state.is_terminal() && !matches!(s.state, CallState::Ending { .. }))
            .unwrap_or(false)
    }

    /// Apply a transition if the session is still live; publish the new
    /// state. Returns false when the session is gone, terminal, or the
    /// transition no longer applies (a pre-empted pipeline step).
    async fn try_transition(&self, session_id: &SessionId, transition: CallTransition) -> bool {
        let state = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return false;
            };
            if session.state.is_terminal() || matches!(session.state, CallState::Ending { .. }) {
                return false;
            }
            if let Err(e) = session.apply_transition(transition) {
                debug!("skipping transition for session {session_id}: {e}");
                return false;
            }
            session.state.clone()
        };
        self.publish_state(session_id, state);
        true
    }

    /// Store the acquired stream unless the session ended meanwhile.
    async fn store_local_media(
        &self,
        session_id: &SessionId,
        stream: crate::media::LocalMediaStream,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(s) if !s.state.is_terminal() && !matches!(s.state, CallState::Ending { .. }) => {
                s.local_media = Some(stream);
                true
            }
            _ => false,
        }
    }

    async fn store_connection(
        &self,
        session_id: &SessionId,
        connection: Arc<dyn crate::connection::PeerConnection>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(s) if !s.state.is_terminal() && !matches!(s.state, CallState::Ending { .. }) => {
                s.connection = Some(connection);
                true
            }
            _ => false,
        }
    }
}
