//! Production adapter backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::{
    AdapterError, AdapterEvent, AdapterEvents, AdapterFactory, EventSink, IceConnectionState,
    IceServer, PeerConnectionAdapter,
};
use crate::media::{MediaStreamHandle, RemoteTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Builds one `RTCPeerConnection` per call with default codecs and interceptors.
#[derive(Debug, Clone)]
pub struct WebRtcAdapterFactory {
    event_capacity: usize,
}

impl WebRtcAdapterFactory {
    pub fn new(event_capacity: usize) -> Self {
        Self { event_capacity }
    }
}

#[async_trait]
impl AdapterFactory for WebRtcAdapterFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerConnectionAdapter>, AdapterEvents), AdapterError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| AdapterError::Setup(format!("register codecs: {err}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| AdapterError::Setup(format!("register interceptors: {err}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| AdapterError::Setup(format!("create peer connection: {err}")))?,
        );

        let (sink, events) = EventSink::channel(self.event_capacity);
        observe(&pc, &sink);
        debug!(target: "talkspot::transport", servers = ice_servers.len(), "peer connection created");

        Ok((
            Box::new(WebRtcAdapter {
                pc,
                pending: Vec::new(),
                tracks_attached: false,
                closed: false,
            }),
            events,
        ))
    }
}

fn observe(pc: &Arc<RTCPeerConnection>, sink: &EventSink) {
    let ice_sink = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = ice_sink.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                trace!(target: "talkspot::transport", %state, "ice connection state");
                sink.deliver(AdapterEvent::IceStateChanged(state)).await;
            }
        })
    }));

    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            // None marks the end of gathering; browsers do not need it relayed
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    sink.deliver(AdapterEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }))
                    .await
                }
                Err(err) => {
                    warn!(target: "talkspot::transport", error = %err, "failed to serialize local candidate")
                }
            }
        })
    }));

    let track_sink = sink.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = track_sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                other => {
                    debug!(target: "talkspot::transport", ?other, "ignoring track of unknown kind");
                    return;
                }
            };
            let remote = RemoteTrack::new(track.id(), kind, track.stream_id()).with_rtp(track);
            debug!(target: "talkspot::transport", track = %remote.id, %kind, "remote track");
            sink.deliver(AdapterEvent::RemoteTrack(remote)).await;
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, AdapterError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|err| AdapterError::Negotiation(format!("malformed sdp: {err}")))
}

pub struct WebRtcAdapter {
    pc: Arc<RTCPeerConnection>,
    pending: Vec<IceCandidate>,
    tracks_attached: bool,
    closed: bool,
}

impl WebRtcAdapter {
    fn ensure_open(&self) -> Result<(), AdapterError> {
        if self.closed {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }

    fn expect_state(&self, expected: RTCSignalingState, step: &str) -> Result<(), AdapterError> {
        let current = self.pc.signaling_state();
        if current == expected {
            Ok(())
        } else {
            Err(AdapterError::Negotiation(format!(
                "cannot {step} in signaling state {current}"
            )))
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), AdapterError> {
        if candidate.is_end_of_candidates() {
            trace!(target: "talkspot::transport", "end of remote candidates");
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| AdapterError::Negotiation(format!("add candidate: {err}")))
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcAdapter {
    async fn attach_local_tracks(&mut self, media: &MediaStreamHandle) -> Result<(), AdapterError> {
        self.ensure_open()?;
        for track in media.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track.rtp()) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|err| AdapterError::Setup(format!("attach {} track: {err}", track.kind())))?;
            // RTCP has to be read for interceptors (NACK, reports) to run
            tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
        }
        self.tracks_attached = true;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        if !self.tracks_attached {
            return Err(AdapterError::Negotiation("local tracks not attached".into()));
        }
        self.expect_state(RTCSignalingState::Stable, "create offer")?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| AdapterError::Negotiation(format!("create offer: {err}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, AdapterError> {
        self.ensure_open()?;
        if !self.tracks_attached {
            return Err(AdapterError::Negotiation("local tracks not attached".into()));
        }
        self.expect_state(RTCSignalingState::HaveRemoteOffer, "create answer")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| AdapterError::Negotiation(format!("create answer: {err}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), AdapterError> {
        self.ensure_open()?;
        let required = match desc.kind {
            SdpKind::Offer => RTCSignalingState::Stable,
            SdpKind::Answer => RTCSignalingState::HaveRemoteOffer,
        };
        self.expect_state(required, "set local description")?;
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|err| AdapterError::Negotiation(format!("set local description: {err}")))
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), AdapterError> {
        self.ensure_open()?;
        let required = match desc.kind {
            SdpKind::Offer => RTCSignalingState::Stable,
            SdpKind::Answer => RTCSignalingState::HaveLocalOffer,
        };
        self.expect_state(required, "set remote description")?;
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|err| AdapterError::Negotiation(format!("set remote description: {err}")))?;

        let buffered = std::mem::take(&mut self.pending);
        if !buffered.is_empty() {
            debug!(target: "talkspot::transport", count = buffered.len(), "flushing buffered candidates");
        }
        for candidate in buffered {
            if let Err(err) = self.apply_candidate(candidate).await {
                warn!(target: "talkspot::transport", error = %err, "buffered candidate rejected");
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), AdapterError> {
        self.ensure_open()?;
        if self.pc.remote_description().await.is_none() {
            trace!(target: "talkspot::transport", "buffering early candidate");
            self.pending.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        if let Err(err) = self.pc.close().await {
            debug!(target: "talkspot::transport", error = %err, "peer connection close reported an error");
        }
        debug!(target: "talkspot::transport", "peer connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaRequest;

    async fn adapter() -> (Box<dyn PeerConnectionAdapter>, AdapterEvents) {
        WebRtcAdapterFactory::new(64)
            .create(&[])
            .await
            .expect("peer connection")
    }

    #[tokio::test]
    async fn offer_requires_attached_tracks() {
        let (mut pc, _events) = adapter().await;
        assert!(matches!(
            pc.create_offer().await,
            Err(AdapterError::Negotiation(_))
        ));
        pc.close().await;
    }

    #[tokio::test]
    async fn answer_without_remote_offer_is_rejected() {
        let (mut pc, _events) = adapter().await;
        let media = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        pc.attach_local_tracks(&media).await.expect("attach");
        assert!(matches!(
            pc.create_answer().await,
            Err(AdapterError::Negotiation(_))
        ));
        assert!(matches!(
            pc.set_remote_description(SessionDescription::answer("v=0\r\n"))
                .await,
            Err(AdapterError::Negotiation(_))
        ));
        pc.close().await;
    }

    #[tokio::test]
    async fn offer_lists_both_media_sections() {
        let (mut pc, _events) = adapter().await;
        let media = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        pc.attach_local_tracks(&media).await.expect("attach");
        let offer = pc.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        pc.close().await;
    }

    #[tokio::test]
    async fn early_candidates_are_buffered() {
        let (mut pc, _events) = adapter().await;
        pc.add_remote_candidate(IceCandidate::new(
            "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
        ))
        .await
        .expect("buffered");
        pc.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let (mut pc, _events) = adapter().await;
        pc.close().await;
        pc.close().await;
        assert!(pc.is_closed());
        assert!(matches!(pc.create_offer().await, Err(AdapterError::Closed)));
        assert!(matches!(
            pc.add_remote_candidate(IceCandidate::new("")).await,
            Err(AdapterError::Closed)
        ));
    }
}
