use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::observers::{CallObservers, CallWatch, MediaToggles};
use super::{CallSession, CallStatus};
use crate::captions::{CaptionService, spawn_captions};
use crate::config::CallConfig;
use crate::error::{CallError, CallNotice};
use crate::media::{MediaRequest, MediaSource, RemoteTrack, TrackKind};
use crate::profile::ProfileProvider;
use crate::protocol::{IceCandidate, SessionDescription, SignalKind, SignalingMessage};
use crate::room::{ParticipantId, RoomToken};
use crate::signaling::{ChannelHandle, SignalingChannel};
use crate::transport::{
    AdapterError, AdapterEvent, AdapterFactory, AdapterEvents, IceConnectionState,
    PeerConnectionAdapter,
};

/// One input for the sequential processing loop.
#[derive(Debug)]
pub enum SessionInput {
    Signal(SignalingMessage),
    Adapter(AdapterEvent),
}

/// Owns the call lifecycle and mediates between the signaling channel and
/// the peer connection adapter. All mutation happens through `&mut self`, so
/// inputs are handled strictly one at a time.
pub struct NegotiationController {
    config: CallConfig,
    signaling: SignalingChannel,
    media: Arc<dyn MediaSource>,
    adapters: Arc<dyn AdapterFactory>,
    profile: Arc<dyn ProfileProvider>,
    captions: Option<Arc<dyn CaptionService>>,
    observers: CallObservers,
    session: Option<CallSession>,
}

impl NegotiationController {
    pub fn new(
        config: CallConfig,
        signaling: SignalingChannel,
        media: Arc<dyn MediaSource>,
        adapters: Arc<dyn AdapterFactory>,
        profile: Arc<dyn ProfileProvider>,
    ) -> Self {
        let observers = CallObservers::new(config.notice_duration);
        Self {
            config,
            signaling,
            media,
            adapters,
            profile,
            captions: None,
            observers,
            session: None,
        }
    }

    pub fn with_captions(mut self, service: Arc<dyn CaptionService>) -> Self {
        self.captions = Some(service);
        self
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn status(&self) -> CallStatus {
        self.observers.status()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.observers.ice_state()
    }

    pub fn watch(&self) -> CallWatch {
        self.observers.watch()
    }

    pub fn room(&self) -> Option<&RoomToken> {
        self.session.as_ref().map(|session| &session.room)
    }

    pub fn participant(&self) -> Option<&ParticipantId> {
        self.session.as_ref().map(|session| &session.participant)
    }

    /// Enter `room`: acquire media, open the room channel, create the
    /// transport and announce presence. Any previous call is torn down first.
    pub async fn join_room(&mut self, raw_room: &str) -> Result<(), CallError> {
        let room = match RoomToken::parse(raw_room) {
            Ok(room) => room,
            Err(err) => return Err(self.reject(err.into())),
        };
        let Some(profile) = self.profile.current() else {
            return Err(self.reject(CallError::NoProfile));
        };

        self.cleanup().await;

        let participant = ParticipantId::for_profile(&profile);
        info!(
            target: "talkspot::controller",
            room = %room,
            participant = %participant,
            name = %profile.name,
            "joining room"
        );
        self.session = Some(CallSession::new(room, participant));
        self.observers.set_toggles(MediaToggles::default());
        self.observers.set_ice_state(IceConnectionState::New);
        self.observers.set_remote_media(None);
        self.publish_status(CallStatus::Connecting);

        match self.acquire().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_join(&err).await;
                Err(err)
            }
        }
    }

    async fn acquire(&mut self) -> Result<(), CallError> {
        let request = MediaRequest::audio_video();
        let media = self.media.acquire(request).await?;
        media.ensure_complete(request)?;
        let session = self.session.as_mut().ok_or(CallError::Cancelled)?;
        session.local_media = Some(media);

        let channel = self.signaling.open(&session.room)?;
        session.channel = Some(channel);

        let (adapter, events) = self
            .adapters
            .create(&self.config.ice_servers)
            .await
            .map_err(CallError::AdapterSetup)?;
        let session = self.session.as_mut().ok_or(CallError::Cancelled)?;
        session.events = Some(events);
        let adapter = session.adapter.insert(adapter);
        if let Some(media) = session.local_media.as_ref() {
            adapter
                .attach_local_tracks(media)
                .await
                .map_err(CallError::AdapterSetup)?;
        }

        self.publish(SignalKind::Join);
        debug!(target: "talkspot::controller", "presence announced");
        Ok(())
    }

    async fn fail_join(&mut self, err: &CallError) {
        warn!(target: "talkspot::controller", error = %err, category = %err.category(), "join failed");
        if let Some(session) = self.session.take() {
            release(session).await;
        }
        self.observers.set_remote_media(None);
        self.publish_status(CallStatus::Error);
        self.observers.notify(CallNotice::from(err));
    }

    /// Refuse a request without touching the current call.
    fn reject(&self, err: CallError) -> CallError {
        debug!(target: "talkspot::controller", error = %err, "request rejected");
        self.observers.notify(CallNotice::from(&err));
        err
    }

    /// Announce `Hangup` to the room, then tear down. Safe to call repeatedly
    /// and with nobody listening.
    pub async fn hangup(&mut self) {
        if self.session.is_some() {
            info!(target: "talkspot::controller", "hanging up");
            self.publish(SignalKind::Hangup);
        }
        self.cleanup().await;
    }

    /// The host signed the user out; leave the call the same way a hangup does.
    pub async fn logout(&mut self) {
        info!(target: "talkspot::controller", "logout requested");
        self.hangup().await;
    }

    /// Release every resource of the current call and return to `Idle`.
    pub async fn cleanup(&mut self) {
        let released = match self.session.take() {
            Some(session) => {
                release(session).await;
                true
            }
            None => false,
        };
        if released {
            self.observers.set_ice_state(IceConnectionState::Closed);
        }
        self.observers.set_remote_media(None);
        if self.publish_status(CallStatus::Idle) {
            info!(target: "talkspot::controller", "call ended");
        } else {
            trace!(target: "talkspot::controller", "cleanup with nothing to release");
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.toggle(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.toggle(TrackKind::Video, enabled);
    }

    fn toggle(&mut self, kind: TrackKind, enabled: bool) {
        let mut toggles = self.observers.toggles();
        match kind {
            TrackKind::Audio => toggles.audio = enabled,
            TrackKind::Video => toggles.video = enabled,
        }
        self.observers.set_toggles(toggles);
        if let Some(media) = self
            .session
            .as_ref()
            .and_then(|session| session.local_media.as_ref())
        {
            media.set_enabled(kind, enabled);
        }
        debug!(target: "talkspot::controller", %kind, enabled, "local track toggled");
    }

    /// Wait for the next channel message or adapter event. Pends forever
    /// while there is no call.
    pub async fn next_input(&mut self) -> SessionInput {
        let Some(session) = self.session.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            Some(message) = recv_signal(session.channel.as_mut()) => SessionInput::Signal(message),
            Some(event) = recv_event(session.events.as_mut()) => SessionInput::Adapter(event),
            else => std::future::pending().await,
        }
    }

    pub async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signal(message) => self.handle_signal(message).await,
            SessionInput::Adapter(event) => self.handle_adapter_event(event).await,
        }
    }

    /// Process exactly one input.
    pub async fn handle_next(&mut self) {
        let input = self.next_input().await;
        self.handle_input(input).await;
    }

    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if message.sender == session.participant {
            trace!(target: "talkspot::controller", kind = message.kind.name(), "own message ignored");
            return;
        }
        if message.room != session.room {
            trace!(target: "talkspot::controller", room = %message.room, "message for another room ignored");
            return;
        }
        if session
            .peer
            .as_ref()
            .is_some_and(|peer| *peer != message.sender)
        {
            debug!(target: "talkspot::controller", sender = %message.sender, kind = message.kind.name(), "message from third participant ignored");
            return;
        }

        let status = session.status;
        let sender = message.sender;
        match message.kind {
            SignalKind::Join if status == CallStatus::Connecting => {
                info!(target: "talkspot::controller", peer = %sender, "peer joined; sending offer");
                self.set_peer(sender);
                self.send_offer().await;
            }
            SignalKind::Offer(offer) if status == CallStatus::Connecting => {
                self.set_peer(sender);
                self.send_answer(offer).await;
            }
            SignalKind::Offer(offer) if status == CallStatus::Negotiating => {
                let yields = self
                    .session
                    .as_ref()
                    .is_some_and(|session| session.participant < sender);
                if yields {
                    info!(target: "talkspot::controller", peer = %sender, "offer collision; yielding to peer offer");
                    if let Err(err) = self.rebuild_adapter().await {
                        self.negotiation_failed(err).await;
                        return;
                    }
                    self.send_answer(offer).await;
                } else {
                    debug!(target: "talkspot::controller", peer = %sender, "offer collision; keeping our offer");
                }
            }
            SignalKind::Answer(answer) if status == CallStatus::Negotiating => {
                self.accept_answer(answer).await;
            }
            SignalKind::Candidate(candidate) => self.forward_candidate(candidate).await,
            SignalKind::Hangup => {
                info!(target: "talkspot::controller", peer = %sender, "peer hung up");
                self.cleanup().await;
            }
            other => {
                debug!(target: "talkspot::controller", kind = other.name(), %status, "out-of-state message ignored");
            }
        }
    }

    pub async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            AdapterEvent::IceStateChanged(state) => {
                let previous = std::mem::replace(&mut session.ice_state, state);
                self.observers.set_ice_state(state);
                debug!(target: "talkspot::controller", from = %previous, to = %state, "ice state changed");
                // failure is reported, never acted on; teardown stays with hangup
                if state == IceConnectionState::Failed && previous != IceConnectionState::Failed {
                    warn!(target: "talkspot::controller", status = %session.status, "ice connectivity failed");
                    self.observers
                        .notify(CallNotice::from(&CallError::TransportFailed));
                }
            }
            AdapterEvent::LocalCandidate(candidate) => {
                self.publish(SignalKind::Candidate(candidate));
            }
            AdapterEvent::RemoteTrack(track) => {
                if exposes_remote_media(session.status) {
                    self.expose_track(track);
                } else {
                    trace!(target: "talkspot::controller", track = %track.id, "parking early remote track");
                    session.parked_tracks.push(track);
                }
            }
        }
    }

    fn set_peer(&mut self, peer: ParticipantId) {
        if let Some(session) = self.session.as_mut() {
            session.peer = Some(peer);
        }
    }

    fn adapter_mut(&mut self) -> Option<&mut Box<dyn PeerConnectionAdapter>> {
        self.session
            .as_mut()
            .and_then(|session| session.adapter.as_mut())
    }

    async fn send_offer(&mut self) {
        let Some(adapter) = self.adapter_mut() else {
            return;
        };
        match offer_step(adapter.as_mut()).await {
            Ok(offer) => {
                self.publish(SignalKind::Offer(offer));
                self.transition(CallStatus::Negotiating);
            }
            Err(err) => self.negotiation_failed(err).await,
        }
    }

    async fn send_answer(&mut self, offer: SessionDescription) {
        let Some(adapter) = self.adapter_mut() else {
            return;
        };
        match answer_step(adapter.as_mut(), offer).await {
            Ok(answer) => {
                self.publish(SignalKind::Answer(answer));
                self.transition(CallStatus::InCall);
            }
            Err(err) => self.negotiation_failed(err).await,
        }
    }

    async fn accept_answer(&mut self, answer: SessionDescription) {
        let Some(adapter) = self.adapter_mut() else {
            return;
        };
        match adapter.set_remote_description(answer).await {
            Ok(()) => self.transition(CallStatus::InCall),
            Err(err) => self.negotiation_failed(err).await,
        }
    }

    async fn forward_candidate(&mut self, candidate: IceCandidate) {
        let Some(adapter) = self.adapter_mut() else {
            return;
        };
        if let Err(err) = adapter.add_remote_candidate(candidate).await {
            warn!(target: "talkspot::controller", error = %err, "remote candidate rejected");
        }
    }

    /// Replace the transport with a fresh one so a pending local offer can be
    /// abandoned in favour of the peer's.
    async fn rebuild_adapter(&mut self) -> Result<(), AdapterError> {
        let Some(session) = self.session.as_mut() else {
            return Err(AdapterError::Closed);
        };
        if let Some(mut old) = session.adapter.take() {
            old.close().await;
        }
        session.events = None;
        session.parked_tracks.clear();

        let (mut adapter, events) = self.adapters.create(&self.config.ice_servers).await?;
        let session = self.session.as_mut().ok_or(AdapterError::Closed)?;
        if let Some(media) = session.local_media.as_ref() {
            adapter.attach_local_tracks(media).await?;
        }
        session.adapter = Some(adapter);
        session.events = Some(events);
        Ok(())
    }

    async fn negotiation_failed(&mut self, err: AdapterError) {
        let err = CallError::Negotiation(err);
        warn!(target: "talkspot::controller", error = %err, "negotiation failed; ending call");
        self.observers.notify(CallNotice::from(&err));
        self.hangup().await;
    }

    fn transition(&mut self, status: CallStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let previous = std::mem::replace(&mut session.status, status);
        if previous == status {
            return;
        }
        info!(target: "talkspot::controller", from = %previous, to = %status, room = %session.room, "call status");
        self.observers.set_status(status);

        let parked = if exposes_remote_media(status) {
            std::mem::take(&mut session.parked_tracks)
        } else {
            Vec::new()
        };
        for track in parked {
            self.expose_track(track);
        }
        self.maybe_start_captions();
    }

    fn expose_track(&mut self, track: RemoteTrack) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let remote = session.remote_media.get_or_insert_with(Default::default);
        if remote.add_track(track) {
            debug!(target: "talkspot::controller", tracks = remote.tracks().len(), "remote media updated");
            self.observers.set_remote_media(Some(remote.clone()));
        }
        self.maybe_start_captions();
    }

    fn maybe_start_captions(&mut self) {
        let Some(service) = self.captions.as_ref() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.status != CallStatus::InCall || session.captions.is_some() {
            return;
        }
        let Some(audio) = session
            .remote_media
            .as_ref()
            .and_then(|media| media.audio())
            .cloned()
        else {
            return;
        };
        let sender = session
            .peer
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "partner".to_string());
        debug!(target: "talkspot::captions", track = %audio.id, "starting captions");
        session.captions = Some(spawn_captions(
            Arc::clone(service),
            audio,
            sender,
            self.observers.caption_sink(),
        ));
    }

    fn publish(&self, kind: SignalKind) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(channel) = session.channel.as_ref() else {
            return;
        };
        let message = SignalingMessage::new(kind, session.participant.clone(), session.room.clone());
        channel.publish(&message);
    }

    fn publish_status(&self, status: CallStatus) -> bool {
        self.observers.set_status(status)
    }
}

fn exposes_remote_media(status: CallStatus) -> bool {
    matches!(
        status,
        CallStatus::Negotiating | CallStatus::InCall
    )
}

async fn offer_step(
    adapter: &mut dyn PeerConnectionAdapter,
) -> Result<SessionDescription, AdapterError> {
    let offer = adapter.create_offer().await?;
    adapter.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn answer_step(
    adapter: &mut dyn PeerConnectionAdapter,
    offer: SessionDescription,
) -> Result<SessionDescription, AdapterError> {
    adapter.set_remote_description(offer).await?;
    let answer = adapter.create_answer().await?;
    adapter.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn recv_signal(channel: Option<&mut ChannelHandle>) -> Option<SignalingMessage> {
    match channel {
        Some(channel) => channel.recv().await,
        None => None,
    }
}

async fn recv_event(events: Option<&mut AdapterEvents>) -> Option<AdapterEvent> {
    match events {
        Some(events) => events.recv().await,
        None => None,
    }
}

/// Tear down a session's resources. Each step tolerates the resource never
/// having been acquired.
async fn release(mut session: CallSession) {
    if let Some(task) = session.captions.take() {
        task.abort();
    }
    if let Some(mut adapter) = session.adapter.take() {
        adapter.close().await;
    }
    session.events = None;
    if let Some(mut channel) = session.channel.take() {
        channel.close();
    }
    if let Some(media) = session.local_media.take() {
        media.stop();
    }
    session.remote_media = None;
    debug!(target: "talkspot::controller", room = %session.room, "session resources released");
}
