//! WebRTC Transport
//!
//! Eine RTCPeerConnection pro Peer. Die lokalen Tracks werden über alle
//! Verbindungen geteilt: die Media-Pipeline schreibt RTP einmal pro Track
//! und jede Peer Connection hängt denselben TrackLocalStaticRTP an.

use super::{
    PeerTransport, SdpKind, TransportError, TransportEvent, TransportFactory, TransportParts,
};
use crate::config::SessionConfig;
use crate::media::{LocalMediaHandle, LocalTrack, TrackKind, SAMPLE_RATE};
use crate::signaling::ParticipantId;
use crate::transport::Connectivity;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Video Clock Rate (RTP Standard für VP8)
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// TRACK REGISTRY
// ============================================================================

/// Lokale Track-ID → geteilter RTP Track
#[derive(Default)]
struct TrackRegistry {
    tracks: Mutex<HashMap<String, Weak<TrackLocalStaticRTP>>>,
}

impl TrackRegistry {
    fn track_for(&self, stream_id: &str, local: &LocalTrack) -> Arc<TrackLocalStaticRTP> {
        let mut tracks = self.tracks.lock();
        if let Some(track) = tracks.get(&local.id).and_then(Weak::upgrade) {
            return track;
        }

        let capability = match local.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            local.id.clone(),
            stream_id.to_string(),
        ));

        // Tote Einträge vorheriger Geräte aufräumen
        tracks.retain(|_, t| t.strong_count() > 0);
        tracks.insert(local.id.clone(), Arc::downgrade(&track));
        track
    }

    #[cfg(test)]
    fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.lock().get(track_id).and_then(Weak::upgrade)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt WebRTC Peer Connections
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    registry: Arc<TrackRegistry>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self {
            ice_servers,
            registry: Arc::new(TrackRegistry::default()),
        }
    }

    /// Baut die ICE-Server Liste aus URLs
    pub fn from_urls(urls: &[String]) -> Self {
        if urls.is_empty() {
            return Self::default();
        }
        Self::new(vec![RTCIceServer {
            urls: urls.to_vec(),
            ..Default::default()
        }])
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }

    /// ICE-Server aus der Session-Konfiguration, inklusive TURN
    pub fn from_config(config: &SessionConfig) -> Self {
        let factory = Self::from_urls(&config.ice_servers);
        match &config.turn_server {
            Some(turn) => factory.with_turn_server(
                turn.url.clone(),
                turn.username.clone(),
                turn.credential.clone(),
            ),
            None => factory,
        }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

impl std::fmt::Debug for WebRtcTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransportFactory")
            .field("ice_servers", &self.ice_servers.len())
            .finish()
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        _local: &ParticipantId,
        peer: &ParticipantId,
        media: Option<&LocalMediaHandle>,
    ) -> Result<TransportParts, TransportError> {
        let pc = self.create_peer_connection().await?;
        let (event_tx, events) = mpsc::unbounded_channel();

        setup_peer_connection_handlers(&pc, peer.clone(), event_tx);

        let transport = Arc::new(WebRtcTransport {
            pc,
            peer: peer.clone(),
            registry: Arc::clone(&self.registry),
            senders: tokio::sync::Mutex::new(HashMap::new()),
            rtcp_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = transport.replace_tracks(media).await {
            let _ = transport.close().await;
            return Err(e);
        }

        Ok(TransportParts { transport, events })
    }
}

/// Registriert Event Handler für die Peer Connection
fn setup_peer_connection_handlers(
    pc: &RTCPeerConnection,
    peer: ParticipantId,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    // Connection State Handler
    let state_tx = event_tx.clone();
    let state_peer = peer.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::debug!("Peer connection state ({}): {:?}", state_peer, s);

        let connectivity = match s {
            RTCPeerConnectionState::New => Some(Connectivity::New),
            RTCPeerConnectionState::Connecting => Some(Connectivity::Checking),
            RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
            RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
            RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
            RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };

        if let Some(connectivity) = connectivity {
            let _ = state_tx.send(TransportEvent::Connectivity(connectivity));
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|json| serde_json::to_string(&json)) {
                Ok(Ok(candidate_str)) => {
                    let _ = event_tx.send(TransportEvent::LocalCandidate(candidate_str));
                }
                _ => tracing::warn!("Could not serialize local ICE candidate"),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Medien gehören der Rendering-Schicht)
    pc.on_track(Box::new(move |track, _, _| {
        let peer = peer.clone();
        Box::pin(async move {
            tracing::info!("Received track from {}: {:?}", peer, track.codec());
        })
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Eine Peer Connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    peer: ParticipantId,
    registry: Arc<TrackRegistry>,
    senders: tokio::sync::Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    rtcp_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Liest eingehende RTCP Pakete, damit Interceptors (NACK etc.) laufen
    fn spawn_rtcp_reader(&self, sender: Arc<RTCRtpSender>) {
        let peer = self.peer.clone();
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            tracing::debug!("RTCP reader for {} terminated", peer);
        });
        self.rtcp_tasks.lock().push(handle);
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError> {
        self.ensure_open()?;

        let candidate: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;

        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))
    }

    async fn replace_tracks(&self, media: Option<&LocalMediaHandle>) -> Result<(), TransportError> {
        self.ensure_open()?;

        let stream_id = media
            .map(|m| m.id().to_string())
            .unwrap_or_default();
        let mut senders = self.senders.lock().await;

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let track = media
                .and_then(|m| m.track(kind))
                .map(|local| self.registry.track_for(&stream_id, local));

            if let Some(sender) = senders.get(&kind) {
                let track = track.map(|t| t as Arc<dyn TrackLocal + Send + Sync>);
                sender
                    .replace_track(track)
                    .await
                    .map_err(|e| TransportError::WebRTC(e.to_string()))?;
            } else if let Some(track) = track {
                let sender = self
                    .pc
                    .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| TransportError::WebRTC(e.to_string()))?;
                self.spawn_rtcp_reader(Arc::clone(&sender));
                senders.insert(kind, sender);
            }
        }

        tracing::debug!("Outbound tracks for {} updated", self.peer);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for task in self.rtcp_tasks.lock().drain(..) {
            task.abort();
        }

        self.pc
            .close()
            .await
            .map_err(|e| TransportError::WebRTC(e.to_string()))?;

        tracing::info!("Peer connection to {} closed", self.peer);
        Ok(())
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        for task in self.rtcp_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_from_urls() {
        let factory = WebRtcTransportFactory::from_urls(&["stun:stun.example.org:3478".to_string()]);
        assert_eq!(factory.ice_servers.len(), 1);
        assert_eq!(factory.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);

        let factory = WebRtcTransportFactory::from_urls(&[]);
        assert_eq!(factory.ice_servers[0].urls.len(), 3);
    }

    #[test]
    fn test_turn_server_is_appended_to_stun_servers() {
        let config = SessionConfig {
            ice_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_server: Some(crate::config::TurnServer {
                url: "turn:turn.example.org:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }),
            ..Default::default()
        };

        let factory = WebRtcTransportFactory::from_config(&config);
        assert_eq!(factory.ice_servers.len(), 2);
        assert_eq!(factory.ice_servers[1].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(factory.ice_servers[1].username, "user");
        assert_eq!(factory.ice_servers[1].credential, "secret");

        let factory = WebRtcTransportFactory::from_config(&SessionConfig::default());
        assert!(factory.ice_servers.iter().all(|s| s.username.is_empty()));
    }

    #[test]
    fn test_tracks_are_shared_between_connections() {
        let registry = TrackRegistry::default();
        let local = LocalTrack::new(TrackKind::Audio, "mic".to_string());

        let first = registry.track_for("stream", &local);
        let second = registry.track_for("stream", &local);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.codec().mime_type, MIME_TYPE_OPUS);

        drop(first);
        drop(second);
        assert!(registry.get(&local.id).is_none());
    }

    #[tokio::test]
    async fn test_offer_contains_audio_section() {
        let devices = Arc::new(crate::media::VirtualDevices::microphone_only());
        let manager = crate::media::MediaDeviceManager::new(devices);
        let media = manager
            .acquire(&crate::media::MediaConstraints::audio_only())
            .unwrap();

        let factory = WebRtcTransportFactory::new(Vec::new());
        let parts = factory
            .create(&"a".into(), &"b".into(), Some(&media))
            .await
            .unwrap();

        let offer = parts.transport.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));

        parts.transport.close().await.unwrap();
        parts.transport.close().await.unwrap();
        assert_eq!(
            parts.transport.add_ice_candidate("{}".to_string()).await,
            Err(TransportError::Closed)
        );
    }
}
