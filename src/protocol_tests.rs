//! End-to-end protocol tests driving two managers against mock seams.
//!
//! Signaling is relayed by hand between the two sides so every test
//! controls exactly which envelopes arrive, in which order.

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionSignal, ConnectionState,
    IceCandidate, PeerConnection, SessionDescription,
};
use crate::events::CallEvent;
use crate::identity::{IdentityDirectory, PeerProfile};
use crate::manager::{CallManager, CallManagerConfig};
use crate::media::{LocalMediaStream, LocalTrack, MediaError, MediaSource, TrackKind};
use crate::signaling::{SignalEnvelope, SignalKind, SignalPayload};
use crate::state::CallState;
use crate::transport::SignalingTransport;
use crate::types::{EndReason, FailureReason, MediaAspect, MediaKind, PeerId, SessionId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct MockTransport {
    outbox: Mutex<Vec<SignalEnvelope>>,
    reachable: AtomicBool,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            outbox: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        }
    }

    fn drain(&self) -> Vec<SignalEnvelope> {
        std::mem::take(&mut self.outbox.lock().unwrap())
    }

    fn sent_kinds(&self) -> Vec<SignalKind> {
        self.outbox.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    fn sent_count(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn send(&self, envelope: SignalEnvelope) {
        self.outbox.lock().unwrap().push(envelope);
    }

    async fn is_reachable(&self, _peer: &PeerId) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

struct MockMediaSource {
    fail_with: Mutex<Option<MediaError>>,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MockMediaSource {
    fn new() -> Self {
        Self {
            fail_with: Mutex::new(None),
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn fail_next(&self, error: MediaError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMediaStream, MediaError> {
        if let Some(error) = self.fail_with.lock().unwrap().take() {
            return Err(error);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);

        let released = self.released.clone();
        let mut tracks = vec![Arc::new(
            LocalTrack::new(TrackKind::Audio, "mock-mic").with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }),
        )];
        if kind.has_video() {
            let released = self.released.clone();
            tracks.push(Arc::new(
                LocalTrack::new(TrackKind::Video, "mock-cam").with_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }
        Ok(LocalMediaStream::new(tracks))
    }
}

struct MockConnection {
    session_id: SessionId,
    events: mpsc::UnboundedSender<ConnectionSignal>,
    added_tracks: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    closed: AtomicUsize,
}

impl MockConnection {
    fn fire_state(&self, state: ConnectionState) {
        let _ = self.events.send(ConnectionSignal {
            session_id: self.session_id.clone(),
            event: ConnectionEvent::StateChanged(state),
        });
    }

    fn emit_candidate(&self, candidate: &str) {
        let _ = self.events.send(ConnectionSignal {
            session_id: self.session_id.clone(),
            event: ConnectionEvent::LocalCandidate(IceCandidate::new(candidate)),
        });
    }

    fn candidate_strings(&self) -> Vec<String> {
        self.candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError> {
        self.added_tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.remote_descriptions.lock().unwrap().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if candidate.candidate == "malformed" {
            return Err(ConnectionError::Negotiation("bad candidate".to_string()));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockConnectionFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.created.lock().unwrap()[index].clone()
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        session_id: SessionId,
        events: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let connection = Arc::new(MockConnection {
            session_id,
            events,
            added_tracks: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

struct MockDirectory;

#[async_trait]
impl IdentityDirectory for MockDirectory {
    async fn lookup(&self, peer: &PeerId) -> Option<PeerProfile> {
        Some(PeerProfile {
            peer: peer.clone(),
            display_name: format!("Display {peer}"),
            avatar_url: None,
        })
    }
}

struct Side {
    manager: Arc<CallManager>,
    transport: Arc<MockTransport>,
    media: Arc<MockMediaSource>,
    connections: Arc<MockConnectionFactory>,
}

impl Side {
    fn new(name: &str) -> Self {
        Self::with_config(name, CallManagerConfig::default())
    }

    fn with_config(name: &str, config: CallManagerConfig) -> Self {
        let transport = Arc::new(MockTransport::new());
        let media = Arc::new(MockMediaSource::new());
        let connections = Arc::new(MockConnectionFactory::default());
        let manager = CallManager::new(
            PeerId::from(name),
            config,
            transport.clone(),
            media.clone(),
            connections.clone(),
            Some(Arc::new(MockDirectory)),
        );
        Self {
            manager,
            transport,
            media,
            connections,
        }
    }

    async fn wait_state(&self, session_id: &SessionId, pred: fn(&CallState) -> bool) {
        for _ in 0..400 {
            if let Some(snapshot) = self.manager.get_session(session_id).await {
                if pred(&snapshot.state) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let last = self.manager.get_session(session_id).await.map(|s| s.state);
        panic!("timed out waiting for state, last seen {last:?}");
    }

    async fn wait_sent(&self, count: usize) {
        for _ in 0..400 {
            if self.transport.sent_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {count} sent envelopes, have {:?}",
            self.transport.sent_kinds()
        );
    }
}

async fn relay(from: &Side, to: &Side) -> usize {
    let envelopes = from.transport.drain();
    let count = envelopes.len();
    for envelope in envelopes {
        to.manager.handle_signal(envelope).await;
    }
    count
}

/// Drive two sides through the full handshake to Connected.
async fn connect_pair(caller: &Side, callee: &Side, kind: MediaKind) -> SessionId {
    let session_id = caller
        .manager
        .start_call(PeerId::from("bob"), kind)
        .await
        .unwrap();
    caller
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;

    relay(caller, callee).await;
    callee
        .wait_state(&session_id, |s| s.is_ringing())
        .await;

    callee.manager.accept_call(&session_id).await.unwrap();
    callee
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    relay(callee, caller).await;

    caller.connections.connection(0).fire_state(ConnectionState::Connected);
    callee.connections.connection(0).fire_state(ConnectionState::Connected);
    caller.wait_state(&session_id, |s| s.is_connected()).await;
    callee.wait_state(&session_id, |s| s.is_connected()).await;
    session_id
}

#[tokio::test]
async fn test_full_audio_call_handshake() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    assert_eq!(alice.transport.sent_kinds(), vec![SignalKind::Offer]);

    // A local candidate gathered before the callee even saw the offer.
    alice
        .connections
        .connection(0)
        .emit_candidate("candidate:1 1 UDP 1 10.0.0.1 9 typ host");
    alice.wait_sent(2).await;

    relay(&alice, &bob).await;
    bob.wait_state(&session_id, |s| s.is_ringing()).await;

    let bob_conn = bob.connections.connection(0);
    assert_eq!(bob_conn.remote_descriptions.lock().unwrap().len(), 1);
    // The candidate that raced the offer application was applied anyway.
    assert_eq!(
        bob_conn.candidate_strings(),
        vec!["candidate:1 1 UDP 1 10.0.0.1 9 typ host"]
    );

    bob.manager.accept_call(&session_id).await.unwrap();
    bob.wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    assert_eq!(bob_conn.answers_created.load(Ordering::SeqCst), 1);
    relay(&bob, &alice).await;

    let alice_conn = alice.connections.connection(0);
    assert_eq!(alice_conn.offers_created.load(Ordering::SeqCst), 1);
    assert_eq!(alice_conn.remote_descriptions.lock().unwrap().len(), 1);

    alice_conn.fire_state(ConnectionState::Connected);
    bob_conn.fire_state(ConnectionState::Connected);
    alice.wait_state(&session_id, |s| s.is_connected()).await;
    bob.wait_state(&session_id, |s| s.is_connected()).await;

    let snapshot = alice.manager.get_session(&session_id).await.unwrap();
    assert!(snapshot.audio_enabled);
    assert!(!snapshot.video_enabled);
}

#[tokio::test]
async fn test_incoming_call_event_carries_profile() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let mut events = bob.manager.events();

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    relay(&alice, &bob).await;

    loop {
        match events.recv().await.unwrap() {
            CallEvent::IncomingCall {
                session_id: id,
                peer,
                profile,
                ..
            } => {
                assert_eq!(id, session_id);
                assert_eq!(peer, PeerId::from("alice"));
                assert_eq!(profile.unwrap().display_name, "Display alice");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_media_denied_fails_without_signaling() {
    let alice = Side::new("alice");
    alice.media.fail_next(MediaError::PermissionDenied);

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| s.is_terminal())
        .await;

    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Failed { reason, .. } => {
            assert_eq!(reason, FailureReason::MediaAcquisitionDenied);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(alice.transport.sent_count(), 0);
    assert_eq!(alice.connections.created_count(), 0);
}

#[tokio::test]
async fn test_device_unavailable_classification() {
    let alice = Side::new("alice");
    alice.media.fail_next(MediaError::NoDevice);

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::VideoAndAudio)
        .await
        .unwrap();
    alice.wait_state(&session_id, |s| s.is_terminal()).await;

    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Failed { reason, .. } => {
            assert_eq!(reason, FailureReason::MediaDeviceUnavailable);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_peer_rejected_upfront() {
    let alice = Side::new("alice");
    alice.transport.reachable.store(false, Ordering::SeqCst);

    let result = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await;
    assert!(matches!(result, Err(crate::CallError::PeerUnreachable(_))));
    assert!(alice.manager.active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_call_cap() {
    let alice = Side::with_config(
        "alice",
        CallManagerConfig {
            max_concurrent_calls: 1,
            ..Default::default()
        },
    );

    alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    let second = alice
        .manager
        .start_call(PeerId::from("carol"), MediaKind::Audio)
        .await;
    assert!(matches!(second, Err(crate::CallError::TooManyCalls(1))));
}

#[tokio::test]
async fn test_end_call_is_idempotent() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;

    alice.manager.end_call(&session_id).await.unwrap();
    alice.wait_state(&session_id, |s| s.is_terminal()).await;

    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended {
            reason,
            duration_secs,
            ..
        } => {
            assert_eq!(reason, EndReason::HungUp);
            assert!(duration_secs.is_some());
        }
        other => panic!("expected Ended, got {other:?}"),
    }

    // Second end is a no-op: no second close, no second release.
    alice.manager.end_call(&session_id).await.unwrap();
    let alice_conn = alice.connections.connection(0);
    assert_eq!(alice_conn.closed.load(Ordering::SeqCst), 1);
    assert_eq!(alice.media.released.load(Ordering::SeqCst), 1);

    assert!(matches!(
        alice.manager.end_call(&SessionId::new("missing")).await,
        Err(crate::CallError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_peer_end_is_not_echoed() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;

    alice.manager.end_call(&session_id).await.unwrap();
    alice.wait_state(&session_id, |s| s.is_terminal()).await;
    assert_eq!(alice.transport.sent_kinds(), vec![SignalKind::End]);

    relay(&alice, &bob).await;
    bob.wait_state(&session_id, |s| s.is_terminal()).await;
    match bob.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended { reason, .. } => assert_eq!(reason, EndReason::PeerHungUp),
        other => panic!("expected Ended, got {other:?}"),
    }
    // Releasing in response to a peer end must not send call-end back.
    assert_eq!(bob.transport.sent_count(), 0);
    assert_eq!(bob.media.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_caller_buffers_candidates_until_answer() {
    let alice = Side::new("alice");
    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;

    // Candidates arrive before the answer: buffered, not applied.
    for candidate in ["candidate:a", "malformed", "candidate:b"] {
        alice
            .manager
            .handle_signal(SignalEnvelope::new(
                session_id.clone(),
                PeerId::from("bob"),
                PeerId::from("alice"),
                SignalPayload::IceCandidate {
                    candidate: IceCandidate::new(candidate),
                },
            ))
            .await;
    }
    let alice_conn = alice.connections.connection(0);
    assert!(alice_conn.candidate_strings().is_empty());

    alice
        .manager
        .handle_signal(SignalEnvelope::new(
            session_id.clone(),
            PeerId::from("bob"),
            PeerId::from("alice"),
            SignalPayload::CallAnswer {
                description: SessionDescription::answer("v=0 remote-answer"),
            },
        ))
        .await;

    // Flushed in arrival order; the malformed one was skipped, not fatal.
    assert_eq!(
        alice_conn.candidate_strings(),
        vec!["candidate:a", "candidate:b"]
    );
    assert!(matches!(
        alice.manager.get_session(&session_id).await.unwrap().state,
        CallState::Connecting { .. }
    ));
}

#[tokio::test]
async fn test_duplicate_answer_is_dropped() {
    let alice = Side::new("alice");
    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;

    let answer = SignalEnvelope::new(
        session_id.clone(),
        PeerId::from("bob"),
        PeerId::from("alice"),
        SignalPayload::CallAnswer {
            description: SessionDescription::answer("v=0 remote-answer"),
        },
    );
    alice.manager.handle_signal(answer.clone()).await;
    alice.manager.handle_signal(answer).await;

    let alice_conn = alice.connections.connection(0);
    assert_eq!(alice_conn.remote_descriptions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_messages_after_end_are_ignored() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;

    alice.manager.end_call(&session_id).await.unwrap();
    alice.wait_state(&session_id, |s| s.is_terminal()).await;
    alice.transport.drain();

    for payload in [
        SignalPayload::CallAnswer {
            description: SessionDescription::answer("v=0 late"),
        },
        SignalPayload::IceCandidate {
            candidate: IceCandidate::new("candidate:late"),
        },
        SignalPayload::CallEnd,
    ] {
        alice
            .manager
            .handle_signal(SignalEnvelope::new(
                session_id.clone(),
                PeerId::from("bob"),
                PeerId::from("alice"),
                payload,
            ))
            .await;
    }

    assert!(alice
        .manager
        .get_session(&session_id)
        .await
        .unwrap()
        .state
        .is_terminal());
    assert_eq!(alice.transport.sent_count(), 0);
}

#[tokio::test]
async fn test_signals_for_unknown_sessions_are_dropped() {
    let alice = Side::new("alice");

    for payload in [
        SignalPayload::CallAnswer {
            description: SessionDescription::answer("v=0"),
        },
        SignalPayload::IceCandidate {
            candidate: IceCandidate::new("candidate:x"),
        },
        SignalPayload::CallEnd,
        SignalPayload::CallReject,
    ] {
        alice
            .manager
            .handle_signal(SignalEnvelope::new(
                SessionId::new("never-existed"),
                PeerId::from("bob"),
                PeerId::from("alice"),
                payload,
            ))
            .await;
    }
    assert_eq!(alice.transport.sent_count(), 0);
    assert!(alice.manager.active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_peer_end_falls_back_to_peer_identity() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;

    // End message with a mismatched session id from the live call's peer.
    alice
        .manager
        .handle_signal(SignalEnvelope::new(
            SessionId::new("some-other-id"),
            PeerId::from("bob"),
            PeerId::from("alice"),
            SignalPayload::CallEnd,
        ))
        .await;

    alice.wait_state(&session_id, |s| s.is_terminal()).await;
    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended { reason, .. } => assert_eq!(reason, EndReason::PeerHungUp),
        other => panic!("expected Ended, got {other:?}"),
    }
}

#[tokio::test]
async fn test_toggle_is_independent_of_call_state() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;
    alice.transport.drain();
    let mut bob_events = bob.manager.events();

    alice
        .manager
        .set_audio_enabled(&session_id, false)
        .await
        .unwrap();

    let snapshot = alice.manager.get_session(&session_id).await.unwrap();
    assert!(!snapshot.audio_enabled);
    assert!(snapshot.state.is_connected());

    // No renegotiation, no device release, just one notify envelope.
    let alice_conn = alice.connections.connection(0);
    assert_eq!(alice_conn.offers_created.load(Ordering::SeqCst), 1);
    assert_eq!(alice.media.released.load(Ordering::SeqCst), 0);
    assert_eq!(alice.transport.sent_kinds(), vec![SignalKind::ToggleNotify]);

    relay(&alice, &bob).await;
    loop {
        match bob_events.recv().await.unwrap() {
            CallEvent::PeerToggle {
                aspect, enabled, ..
            } => {
                assert_eq!(aspect, MediaAspect::Audio);
                assert!(!enabled);
                break;
            }
            _ => continue,
        }
    }
    assert!(bob
        .manager
        .get_session(&session_id)
        .await
        .unwrap()
        .state
        .is_connected());
}

#[tokio::test]
async fn test_connect_resets_toggles_on_both_sides() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::VideoAndAudio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    relay(&alice, &bob).await;
    bob.wait_state(&session_id, |s| s.is_ringing()).await;

    // Callee turns video off while ringing.
    bob.manager
        .set_video_enabled(&session_id, false)
        .await
        .unwrap();
    assert!(!bob.manager.get_session(&session_id).await.unwrap().video_enabled);

    bob.manager.accept_call(&session_id).await.unwrap();
    bob.wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    relay(&bob, &alice).await;
    alice.connections.connection(0).fire_state(ConnectionState::Connected);
    bob.connections.connection(0).fire_state(ConnectionState::Connected);
    alice.wait_state(&session_id, |s| s.is_connected()).await;
    bob.wait_state(&session_id, |s| s.is_connected()).await;

    // Both sides start from the media kind's defaults once connected.
    for side in [&alice, &bob] {
        let snapshot = side.manager.get_session(&session_id).await.unwrap();
        assert!(snapshot.audio_enabled);
        assert!(snapshot.video_enabled);
    }
}

#[tokio::test]
async fn test_reject_flow() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;
    relay(&alice, &bob).await;
    bob.wait_state(&session_id, |s| s.is_ringing()).await;

    bob.manager.reject_call(&session_id).await.unwrap();
    bob.wait_state(&session_id, |s| s.is_terminal()).await;

    match bob.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended { reason, .. } => assert_eq!(reason, EndReason::Rejected),
        other => panic!("expected Ended, got {other:?}"),
    }
    // Rejection never creates an answer.
    let bob_conn = bob.connections.connection(0);
    assert_eq!(bob_conn.answers_created.load(Ordering::SeqCst), 0);
    assert_eq!(bob.transport.sent_kinds(), vec![SignalKind::Reject]);

    relay(&bob, &alice).await;
    alice.wait_state(&session_id, |s| s.is_terminal()).await;
    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended { reason, .. } => assert_eq!(reason, EndReason::PeerRejected),
        other => panic!("expected Ended, got {other:?}"),
    }
    assert_eq!(alice.connections.connection(0).closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reject_requires_ringing() {
    let alice = Side::new("alice");
    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;

    // A caller-side session never rings locally.
    assert!(matches!(
        alice.manager.reject_call(&session_id).await,
        Err(crate::CallError::InvalidTransition(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_ring_timeout_abandons_unanswered_call() {
    let alice = Side::with_config(
        "alice",
        CallManagerConfig {
            ring_timeout_secs: 1,
            ..Default::default()
        },
    );

    let session_id = alice
        .manager
        .start_call(PeerId::from("bob"), MediaKind::Audio)
        .await
        .unwrap();
    alice
        .wait_state(&session_id, |s| matches!(s, CallState::Connecting { .. }))
        .await;

    alice.wait_state(&session_id, |s| s.is_terminal()).await;
    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Ended {
            reason,
            duration_secs,
            ..
        } => {
            assert_eq!(reason, EndReason::RingTimeout);
            assert_eq!(duration_secs, None);
        }
        other => panic!("expected Ended, got {other:?}"),
    }
    // The peer is told to stop ringing.
    assert_eq!(
        alice.transport.sent_kinds(),
        vec![SignalKind::Offer, SignalKind::End]
    );
    assert_eq!(alice.media.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_failure_after_connect() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;
    alice.transport.drain();

    alice.connections.connection(0).fire_state(ConnectionState::Failed);
    alice.wait_state(&session_id, |s| s.is_terminal()).await;

    match alice.manager.get_session(&session_id).await.unwrap().state {
        CallState::Failed { reason, .. } => {
            assert_eq!(reason, FailureReason::TransportUnreachable);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    // The connection drop is still announced so the peer can clean up.
    assert_eq!(alice.transport.sent_kinds(), vec![SignalKind::End]);
    assert_eq!(alice.media.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_track_surfaces_as_event() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;
    let mut events = alice.manager.events();

    let _ = alice
        .connections
        .connection(0)
        .events
        .send(ConnectionSignal {
            session_id: session_id.clone(),
            event: ConnectionEvent::RemoteTrack(crate::media::RemoteTrack {
                id: "remote-1".to_string(),
                kind: TrackKind::Audio,
            }),
        });

    loop {
        match events.recv().await.unwrap() {
            CallEvent::RemoteMedia { track, .. } => {
                assert_eq!(track.id, "remote-1");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_cleanup_drops_terminal_sessions() {
    let alice = Side::new("alice");
    let bob = Side::new("bob");
    let session_id = connect_pair(&alice, &bob, MediaKind::Audio).await;

    alice.manager.end_call(&session_id).await.unwrap();
    alice.wait_state(&session_id, |s| s.is_terminal()).await;

    alice.manager.cleanup_ended_sessions().await;
    assert!(alice.manager.get_session(&session_id).await.is_none());
}
