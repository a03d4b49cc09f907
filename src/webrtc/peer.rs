//! WebRTC peer connection backed by webrtc-rs

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::ice_servers;
use super::mdns::{default_mdns_host_name, mdns_mode, mdns_mode_label};
use super::signaling::{ConnectionState, IceCandidate, SessionDescription};
use super::transport::{MediaTransport, TransportEvent, TransportEvents};
use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::role::Role;

/// Payload type browsers commonly use for constrained-baseline H.264
const H264_PAYLOAD_TYPE: u8 = 102;

/// H.264 constrained baseline, the profile openh264 produces
pub fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_owned(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "goog-remb".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "".to_owned(),
            },
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
        ],
    }
}

/// Peer connection carrying one H.264 video stream
///
/// The camera sends on a sample track; the viewer receives through a
/// recvonly transceiver and gets the remote track as a
/// [`TransportEvent::RemoteTrack`].
pub struct RtcTransport {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    video_track: Option<Arc<TrackLocalStaticSample>>,
}

impl RtcTransport {
    pub async fn new(
        role: Role,
        config: &WebRtcConfig,
    ) -> Result<(Self, TransportEvents<Arc<TrackRemote>>)> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: h264_capability(),
                    payload_type: H264_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::WebRtcError(format!("Failed to register H.264 codec: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(&session_id));
        }
        info!(
            "WebRTC mDNS mode: {} (session {})",
            mdns_mode_label(mode),
            session_id
        );

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let video_track = match role {
            Role::Camera => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    h264_capability(),
                    "video".to_owned(),
                    "vision-link".to_owned(),
                ));
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

                // Interceptors (NACK, reports) only run while RTCP is read
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
                });

                info!("H.264 video track added (session {})", session_id);
                Some(track)
            }
            Role::Viewer => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to add video transceiver: {}", e))
                })?;
                None
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Self {
            session_id,
            pc,
            video_track,
        };
        transport.setup_event_handlers(event_tx);

        Ok((transport, event_rx))
    }

    fn setup_event_handlers(&self, event_tx: mpsc::UnboundedSender<TransportEvent<Arc<TrackRemote>>>) {
        let tx = event_tx.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                let session_id = session_id.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    debug!("Peer {} transport state: {}", session_id, state);
                    let _ = tx.send(TransportEvent::StateChanged(state));
                })
            }));

        let tx = event_tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();

                Box::pin(async move {
                    let Some(c) = candidate else {
                        debug!("ICE gathering complete");
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("Local ICE candidate: {}", init.candidate);
                            let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate::from(init)));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let tx = event_tx;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();

                Box::pin(async move {
                    info!("Remote {} track received", track.kind());
                    let _ = tx.send(TransportEvent::RemoteTrack(track));
                })
            },
        ));
    }

    /// Sample track the camera publishes on
    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video_track.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    type RemoteStream = Arc<TrackRemote>;

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        SessionDescription::try_from(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        SessionDescription::try_from(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_viewer_offer_carries_h264() {
        let (transport, _events) = RtcTransport::new(Role::Viewer, &WebRtcConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        })
        .await
        .unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("H264"));
        assert!(offer.sdp.contains("a=recvonly"));
        assert!(transport.video_track().is_none());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_camera_answers_viewer_offer() {
        let config = WebRtcConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        };
        let (viewer, _viewer_events) = RtcTransport::new(Role::Viewer, &config).await.unwrap();
        let (camera, _camera_events) = RtcTransport::new(Role::Camera, &config).await.unwrap();
        assert!(camera.video_track().is_some());

        let offer = viewer.create_offer().await.unwrap();
        viewer.set_local_description(offer.clone()).await.unwrap();
        camera.set_remote_description(offer).await.unwrap();

        let answer = camera.create_answer().await.unwrap();
        assert_eq!(answer.kind, crate::webrtc::signaling::SdpKind::Answer);
        assert!(answer.sdp.contains("a=sendonly"));
        camera.set_local_description(answer.clone()).await.unwrap();
        viewer.set_remote_description(answer).await.unwrap();

        viewer.close().await.unwrap();
        camera.close().await.unwrap();
    }
}
