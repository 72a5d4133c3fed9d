//! Deterministic in-process adapter with the same ordering rules as the real
//! transport. SDP is a tiny text format listing the local track ids.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AdapterError, AdapterEvent, AdapterEvents, AdapterFactory, EventSink, IceConnectionState,
    IceServer, PeerConnectionAdapter,
};
use crate::media::{MediaStreamHandle, RemoteTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockSignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub signaling: MockSignalingState,
    pub local_tracks: Vec<(TrackKind, String)>,
    pub pending_candidates: Vec<IceCandidate>,
    pub applied_candidates: Vec<IceCandidate>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub closed: bool,
    pub close_calls: usize,
}

/// Test-side view of one mock adapter.
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
    sink: EventSink,
}

impl MockProbe {
    pub fn with_state<R>(&self, f: impl FnOnce(&MockState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Push an event as though the transport raised it.
    pub fn emit(&self, event: AdapterEvent) {
        self.sink.emit(event);
    }
}

#[derive(Debug)]
pub struct MockAdapterFactory {
    event_capacity: usize,
    fail_setup: AtomicBool,
    created: Mutex<Vec<MockProbe>>,
    label: String,
}

impl MockAdapterFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            event_capacity: 64,
            fail_setup: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            label: label.into(),
        }
    }

    pub fn fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<MockProbe> {
        self.created.lock().clone()
    }

    pub fn latest(&self) -> Option<MockProbe> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl AdapterFactory for MockAdapterFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerConnectionAdapter>, AdapterEvents), AdapterError> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(AdapterError::Setup("mock transport refused".into()));
        }
        let (sink, events) = EventSink::channel(self.event_capacity);
        let state = Arc::new(Mutex::new(MockState::default()));
        let mut created = self.created.lock();
        let ordinal = created.len();
        created.push(MockProbe {
            state: Arc::clone(&state),
            sink: sink.clone(),
        });
        Ok((
            Box::new(MockAdapter {
                name: format!("{}-{ordinal}", self.label),
                state,
                sink,
                candidates: AtomicUsize::new(0),
            }),
            events,
        ))
    }
}

pub struct MockAdapter {
    name: String,
    state: Arc<Mutex<MockState>>,
    sink: EventSink,
    candidates: AtomicUsize,
}

impl MockAdapter {
    fn check_open(state: &MockState) -> Result<(), AdapterError> {
        if state.closed {
            Err(AdapterError::Closed)
        } else {
            Ok(())
        }
    }

    fn out_of_order(step: &str, state: MockSignalingState) -> AdapterError {
        AdapterError::Negotiation(format!("cannot {step} in state {state:?}"))
    }

    fn render_sdp(&self, state: &MockState) -> String {
        let mut sdp = format!("v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.name);
        for (kind, id) in &state.local_tracks {
            sdp.push_str(&format!("a=track:{kind}:{id}\r\n"));
        }
        sdp
    }

    fn parse_tracks(sdp: &str) -> Result<Vec<RemoteTrack>, AdapterError> {
        if !sdp.starts_with("v=0") {
            return Err(AdapterError::Negotiation("malformed sdp: missing version line".into()));
        }
        let stream_id = sdp
            .lines()
            .find_map(|line| line.strip_prefix("o=mock "))
            .and_then(|origin| origin.split_whitespace().next())
            .unwrap_or("remote")
            .to_string();
        let mut tracks = Vec::new();
        for line in sdp.lines() {
            let Some(rest) = line.strip_prefix("a=track:") else {
                continue;
            };
            let (kind, id) = rest
                .split_once(':')
                .ok_or_else(|| AdapterError::Negotiation(format!("malformed track line {line:?}")))?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                other => {
                    return Err(AdapterError::Negotiation(format!("unknown track kind {other}")));
                }
            };
            tracks.push(RemoteTrack::new(id, kind, stream_id.clone()));
        }
        Ok(tracks)
    }

    fn gather(&self) {
        let n = self.candidates.fetch_add(1, Ordering::SeqCst);
        let mut candidate = IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
            50_000 + n
        ));
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        self.sink.emit(AdapterEvent::IceStateChanged(IceConnectionState::Checking));
        self.sink.emit(AdapterEvent::LocalCandidate(candidate));
    }
}

#[async_trait]
impl PeerConnectionAdapter for MockAdapter {
    async fn attach_local_tracks(&mut self, media: &MediaStreamHandle) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.local_tracks = media
            .tracks()
            .iter()
            .map(|track| (track.kind(), track.id().to_string()))
            .collect();
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, AdapterError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.local_tracks.is_empty() {
            return Err(AdapterError::Negotiation("local tracks not attached".into()));
        }
        if state.signaling != MockSignalingState::Stable {
            return Err(Self::out_of_order("create offer", state.signaling));
        }
        Ok(SessionDescription::offer(self.render_sdp(&state)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, AdapterError> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.local_tracks.is_empty() {
            return Err(AdapterError::Negotiation("local tracks not attached".into()));
        }
        if state.signaling != MockSignalingState::HaveRemoteOffer {
            return Err(Self::out_of_order("create answer", state.signaling));
        }
        Ok(SessionDescription::answer(self.render_sdp(&state)))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), AdapterError> {
        let completed = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            Self::parse_tracks(&desc.sdp)?;
            let (required, next) = match desc.kind {
                SdpKind::Offer => (MockSignalingState::Stable, MockSignalingState::HaveLocalOffer),
                SdpKind::Answer => (MockSignalingState::HaveRemoteOffer, MockSignalingState::Stable),
            };
            if state.signaling != required {
                return Err(Self::out_of_order("set local description", state.signaling));
            }
            state.signaling = next;
            state.local_description = Some(desc);
            next == MockSignalingState::Stable
        };
        self.gather();
        if completed {
            self.sink.emit(AdapterEvent::IceStateChanged(IceConnectionState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), AdapterError> {
        let (tracks, completed) = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            let tracks = Self::parse_tracks(&desc.sdp)?;
            let (required, next) = match desc.kind {
                SdpKind::Offer => (MockSignalingState::Stable, MockSignalingState::HaveRemoteOffer),
                SdpKind::Answer => (MockSignalingState::HaveLocalOffer, MockSignalingState::Stable),
            };
            if state.signaling != required {
                return Err(Self::out_of_order("set remote description", state.signaling));
            }
            state.signaling = next;
            state.remote_description = Some(desc);
            let buffered = std::mem::take(&mut state.pending_candidates);
            state.applied_candidates.extend(buffered);
            (tracks, next == MockSignalingState::Stable)
        };
        for track in tracks {
            self.sink.emit(AdapterEvent::RemoteTrack(track));
        }
        if completed {
            self.sink.emit(AdapterEvent::IceStateChanged(IceConnectionState::Connected));
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote_description.is_none() {
            state.pending_candidates.push(candidate);
        } else {
            state.applied_candidates.push(candidate);
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if !state.closed {
            state.closed = true;
            state.pending_candidates.clear();
            drop(state);
            self.sink.emit(AdapterEvent::IceStateChanged(IceConnectionState::Closed));
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaRequest;

    async fn pair() -> (MockAdapterFactory, Box<dyn PeerConnectionAdapter>, AdapterEvents) {
        let factory = MockAdapterFactory::new("mock");
        let (adapter, events) = factory.create(&[]).await.expect("create");
        (factory, adapter, events)
    }

    #[tokio::test]
    async fn out_of_order_calls_fail_loudly() {
        let (_factory, mut pc, _events) = pair().await;
        let media = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        pc.attach_local_tracks(&media).await.expect("attach");
        assert!(matches!(pc.create_answer().await, Err(AdapterError::Negotiation(_))));
        assert!(matches!(
            pc.set_remote_description(SessionDescription::answer("v=0\r\n")).await,
            Err(AdapterError::Negotiation(_))
        ));
        assert!(matches!(
            pc.set_remote_description(SessionDescription::offer("garbage")).await,
            Err(AdapterError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn offer_answer_exposes_remote_tracks() {
        let factory = MockAdapterFactory::new("mock");
        let (mut caller, _caller_events) = factory.create(&[]).await.expect("create");
        let (mut callee, mut callee_events) = factory.create(&[]).await.expect("create");
        let media = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        caller.attach_local_tracks(&media).await.expect("attach");
        callee.attach_local_tracks(&media).await.expect("attach");

        let offer = caller.create_offer().await.expect("offer");
        caller.set_local_description(offer.clone()).await.expect("local");
        callee.set_remote_description(offer).await.expect("remote");
        let answer = callee.create_answer().await.expect("answer");
        callee.set_local_description(answer.clone()).await.expect("local");
        caller.set_remote_description(answer).await.expect("remote");

        let mut kinds = Vec::new();
        while let Ok(event) = callee_events.try_recv() {
            if let AdapterEvent::RemoteTrack(track) = event {
                kinds.push(track.kind);
            }
        }
        assert_eq!(kinds, vec![TrackKind::Audio, TrackKind::Video]);
        assert!(factory.created().iter().all(|probe| {
            probe.with_state(|state| state.signaling == MockSignalingState::Stable)
        }));
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_kept() {
        let (factory, mut pc, _events) = pair().await;
        pc.add_remote_candidate(IceCandidate::new("candidate:early")).await.expect("buffer");
        let probe = factory.latest().expect("probe");
        assert!(probe.applied_candidates().is_empty());

        pc.set_remote_description(SessionDescription::offer("v=0\r\no=mock peer 0 IN IP4 127.0.0.1\r\n"))
            .await
            .expect("remote");
        pc.add_remote_candidate(IceCandidate::new("candidate:late")).await.expect("apply");
        let applied: Vec<String> = probe
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:early", "candidate:late"]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (factory, mut pc, _events) = pair().await;
        pc.close().await;
        pc.close().await;
        let probe = factory.latest().expect("probe");
        assert!(probe.is_closed());
        assert_eq!(probe.with_state(|state| state.close_calls), 2);
        assert!(matches!(pc.create_offer().await, Err(AdapterError::Closed)));
    }

    #[tokio::test]
    async fn setup_failure_is_reported() {
        let factory = MockAdapterFactory::new("mock");
        factory.fail_setup(true);
        assert!(matches!(factory.create(&[]).await, Err(AdapterError::Setup(_))));
    }
}
