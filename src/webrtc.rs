//! WebRTC-backed peer connection.
//!
//! Adapts a `webrtc-rs` [`RTCPeerConnection`] to the [`PeerConnection`]
//! seam. All backend callbacks (connection state, gathered candidates,
//! inbound tracks) are forwarded as [`ConnectionSignal`] values on the
//! controller's channel; nothing in this module touches session state.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionSignal, ConnectionState,
    DescriptionType, IceCandidate, PeerConnection, SessionDescription,
};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::types::SessionId;
use async_trait::async_trait;

impl From<webrtc::Error> for ConnectionError {
    fn from(e: webrtc::Error) -> Self {
        ConnectionError::Backend(e.to_string())
    }
}

/// Configuration for the WebRTC backend.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN servers used for reachability discovery.
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

/// One `webrtc-rs` peer connection bound to a call session.
pub struct WebRtcConnection {
    session_id: SessionId,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    fn wire_callbacks(&self, events: mpsc::UnboundedSender<ConnectionSignal>) {
        let session_id = self.session_id.clone();
        let tx = events.clone();
        self.pc.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!("session {session_id} peer connection state: {state}");
                let _ = tx.send(ConnectionSignal {
                    session_id: session_id.clone(),
                    event: ConnectionEvent::StateChanged(map_connection_state(state)),
                });
                Box::pin(async {})
            },
        ));

        let session_id = self.session_id.clone();
        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(ConnectionSignal {
                                session_id: session_id.clone(),
                                event: ConnectionEvent::LocalCandidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_m_line_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                }),
                            });
                        }
                        Err(e) => warn!("session {session_id}: unserializable candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));

        let session_id = self.session_id.clone();
        let tx = events;
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let _ = tx.send(ConnectionSignal {
                session_id: session_id.clone(),
                event: ConnectionEvent::RemoteTrack(RemoteTrack {
                    id: format!("remote-{}", track.ssrc()),
                    kind,
                }),
            });
            Box::pin(async {})
        }));
    }

    /// The SDP as negotiated so far, falling back to the freshly created
    /// description when gathering has not updated it yet.
    async fn current_sdp(&self, fresh: RTCSessionDescription) -> String {
        match self.pc.local_description().await {
            Some(desc) => desc.sdp,
            None => fresh.sdp,
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError> {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.session_id.to_string(),
        ));
        self.pc
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!(
            "session {}: registered local {:?} track {}",
            self.session_id,
            track.kind(),
            track.id()
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(self.current_sdp(offer).await))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(self.current_sdp(answer).await))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let desc = match description.kind {
            DescriptionType::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("session {}: error closing peer connection: {e}", self.session_id);
        }
    }
}

/// Creates [`WebRtcConnection`]s from a shared `webrtc-rs` API instance.
pub struct WebRtcConnectionFactory {
    api: webrtc::api::API,
    config: WebRtcConfig,
}

impl WebRtcConnectionFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ConnectionError::Backend(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        session_id: SessionId,
        events: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        let connection = WebRtcConnection { session_id, pc };
        connection.wire_callbacks(events);
        Ok(Arc::new(connection))
    }
}
