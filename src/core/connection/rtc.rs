//! `webrtc` crate implementation of the transport seam.
//!
//! One ordered, reliable data channel labelled `chat`, created by the
//! initiator and picked up by the responder via `on_data_channel`. Local ICE
//! candidates trickle out through the sink as they are gathered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::connection::transport::{PeerTransport, TransportEvent, TransportFactory, TransportSink};
use crate::core::identity::PeerId;
use crate::core::session::Role;
use crate::core::signaling::envelope::SdpKind;
use crate::core::signaling::{IceCandidate, SessionDescription};

/// Sink that goes quiet once the transport is closed locally.
#[derive(Clone)]
struct GatedSink {
    sink: TransportSink,
    closed: Arc<AtomicBool>,
}

impl GatedSink {
    fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::Acquire) {
            self.sink.emit(event);
        }
    }
}

pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }

    fn build_api() -> Result<webrtc::api::API> {
        let mut me = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut me)?;
        Ok(APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        role: Role,
        epoch: u64,
        sink: TransportSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let api = Self::build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.rtc_ice_servers(),
                ..Default::default()
            })
            .await?,
        );
        let sink = GatedSink {
            sink,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        watch_connection_state(&pc, peer_id, sink.clone());
        trickle_candidates(&pc, sink.clone());

        match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
                attach_channel_handlers(&dc, sink.clone());
                *channel.write().await = Some(dc);
            }
            Role::Responder => {
                let slot = channel.clone();
                let dc_sink = sink.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let sink = dc_sink.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            warn!(event = "unexpected_data_channel", label = %dc.label(), "Ignoring data channel");
                            return;
                        }
                        attach_channel_handlers(&dc, sink);
                        *slot.write().await = Some(dc);
                    })
                }));
            }
        }

        debug!(event = "transport_created", peer_id = %peer_id, role = ?role, epoch, "Peer connection created");
        Ok(Arc::new(WebRtcTransport {
            pc,
            channel,
            sink,
        }))
    }
}

fn watch_connection_state(pc: &Arc<RTCPeerConnection>, peer_id: &PeerId, sink: GatedSink) {
    let peer_id = peer_id.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        let peer_id = peer_id.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", peer_id = %peer_id, "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", peer_id = %peer_id, "WebRTC connection failed");
                    sink.emit(TransportEvent::Dropped {
                        reason: "peer connection failed".into(),
                    });
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        peer_id = %peer_id,
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    sink.emit(TransportEvent::Dropped {
                        reason: "peer connection closed".into(),
                    });
                }
                _ => {}
            }
        })
    }));
}

fn trickle_candidates(pc: &Arc<RTCPeerConnection>, sink: GatedSink) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!(event = "candidate_encode_failure", error = %e, "Could not encode local candidate"),
            }
        })
    }));
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, sink: GatedSink) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::Established);
        })
    }));

    let close_sink = sink.clone();
    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        let label = label.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            sink.emit(TransportEvent::Dropped {
                reason: "data channel closed".into(),
            });
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            if msg.is_string {
                sink.emit(TransportEvent::Text(String::from_utf8_lossy(&msg.data).into_owned()));
            } else {
                sink.emit(TransportEvent::Binary(msg.data));
            }
        })
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => return Err(anyhow!("rollback descriptions are not supported")),
    })
}

fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => return Err(anyhow!("unexpected local description type {other}")),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    sink: GatedSink,
}

impl WebRtcTransport {
    async fn channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("data channel not open yet"))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        from_rtc(&answer)
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
        // An inbound offer over our own pending one needs the local offer rolled back.
        if sdp.kind == SdpKind::Offer && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc.set_local_description(rollback).await?;
        }
        self.pc.set_remote_description(to_rtc(sdp)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.channel().await?.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.channel().await?.send(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.sink.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "transport_close_failure", error = %e, "Error while closing peer connection");
        }
    }
}
