//! Backend built on the `webrtc` crate
//!
//! Each link gets its own `RTCPeerConnection`. Connection callbacks are
//! translated into [`LinkEvent`]s; the data channel is created by the
//! initiator and adopted by the responder through `on_data_channel`.

use super::{ConnectivityState, LinkEvent, LinkEventSink, LinkSpec, RtcBackend, RtcConnection};
use crate::media::RemoteStreamHandle;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type SharedChannel = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// [`RtcBackend`] producing real peer connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcBackend;

impl WebRtcBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

fn ice_servers(spec: &LinkSpec) -> Vec<RTCIceServer> {
    spec.stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(spec.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

/// Forward messages and open/close of `channel` to the link
fn wire_channel(channel: &Arc<RTCDataChannel>, sink: &LinkEventSink) {
    let open_sink = sink.clone();
    channel.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(LinkEvent::DataChannelOpen);
        })
    }));

    let close_sink = sink.clone();
    channel.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(LinkEvent::DataChannelClosed);
        })
    }));

    let message_sink = sink.clone();
    channel.on_message(Box::new(move |msg| {
        let sink = message_sink.clone();
        Box::pin(async move {
            sink.emit(LinkEvent::DataMessage(msg.data));
        })
    }));
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    #[instrument(skip(self, spec, events), fields(peer_id = %spec.peer_id, generation = spec.generation))]
    async fn open(&self, spec: LinkSpec, events: LinkEventSink) -> Result<Box<dyn RtcConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&spec),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                    RTCPeerConnectionState::Closed => ConnectivityState::Closed,
                    _ => return,
                };
                debug!(peer_id = sink.peer_id(), ?state, "Peer connection state changed");
                sink.emit(LinkEvent::Connectivity(state));
            })
        }));

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(peer_id = sink.peer_id(), error = %e, "Failed to encode local candidate"),
                }
            })
        }));

        let track_sink = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = track_sink.clone();
            Box::pin(async move {
                let handle = RemoteStreamHandle::new(track.stream_id(), track.kind().to_string());
                info!(peer_id = sink.peer_id(), stream_id = %handle.stream_id, "Remote track added");
                sink.emit(LinkEvent::RemoteStream(handle));
            })
        }));

        let channel: SharedChannel = Arc::new(RwLock::new(None));
        if spec.create_data_channel {
            let init = RTCDataChannelInit {
                ordered: Some(spec.data_channel_mode.ordered()),
                max_retransmits: spec.data_channel_mode.max_retransmits(),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&spec.data_channel_label, Some(init))
                .await
                .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;
            wire_channel(&dc, &events);
            *channel.write().await = Some(dc);
        } else {
            let adopted = Arc::clone(&channel);
            let dc_sink = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let adopted = Arc::clone(&adopted);
                let sink = dc_sink.clone();
                Box::pin(async move {
                    debug!(peer_id = sink.peer_id(), label = dc.label(), "Remote data channel announced");
                    wire_channel(&dc, &sink);
                    *adopted.write().await = Some(dc);
                })
            }));
        }

        let mut audio = None;
        if let Some(media) = &spec.local_media {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48_000,
                    channels: 1,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                format!("audio-{}", spec.local_id),
                media.id().to_string(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to add audio track: {}", e)))?;
            if !media.is_enabled() {
                sender
                    .replace_track(None)
                    .await
                    .map_err(|e| Error::WebRtcError(format!("Failed to mute audio track: {}", e)))?;
            }
            audio = Some((track, sender));
        }

        info!(role = ?spec.role, "Peer connection created");
        Ok(Box::new(WebRtcConnection {
            peer_id: spec.peer_id,
            pc,
            channel,
            audio,
        }))
    }
}

struct WebRtcConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: SharedChannel,
    audio: Option<(Arc<TrackLocalStaticSample>, Arc<RTCRtpSender>)>,
}

impl WebRtcConnection {
    async fn local_description(&self, kind: SdpType) -> Result<SessionDescription> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))?;
        Ok(SessionDescription {
            sdp_type: kind,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        debug!(peer_id = %self.peer_id, ice_restart, "Created offer");
        self.local_description(SdpType::Offer).await
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;
        debug!(peer_id = %self.peer_id, "Created answer");
        self.local_description(SdpType::Answer).await
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn send_data(&mut self, data: Bytes) -> Result<()> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::DataChannelError("Data channel not established".to_string()))?;
        channel
            .send(&data)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send: {}", e)))?;
        Ok(())
    }

    async fn set_outgoing_enabled(&mut self, enabled: bool) -> Result<()> {
        let Some((track, sender)) = &self.audio else {
            return Ok(());
        };
        let replacement = enabled.then(|| Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>);
        sender
            .replace_track(replacement)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to toggle audio track: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        info!(peer_id = %self.peer_id, "Closing peer connection");
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
