//! Call lifecycle: the negotiation controller, its observers and the
//! task handle that drives it.

pub mod controller;
pub mod handle;
pub mod observers;

use std::fmt;

use tokio::task::JoinHandle;

use crate::media::{MediaStreamHandle, RemoteMedia, RemoteTrack};
use crate::room::{ParticipantId, RoomToken};
use crate::signaling::ChannelHandle;
use crate::transport::{AdapterEvents, IceConnectionState, PeerConnectionAdapter};

pub use controller::{NegotiationController, SessionInput};
pub use handle::{CallHandle, spawn};
pub use observers::{Banner, CallObservers, CallWatch, MediaToggles};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Negotiating,
    InCall,
    /// Never entered by the controller; lost connectivity shows up on
    /// `ice_state` while the call stays `InCall`.
    Disconnected,
    Error,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Negotiating => "negotiating",
            CallStatus::InCall => "in_call",
            CallStatus::Disconnected => "disconnected",
            CallStatus::Error => "error",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything owned by one pending or active call. Resources are filled in
/// as join acquires them so a cancelled join can still be released.
pub(crate) struct CallSession {
    pub room: RoomToken,
    pub participant: ParticipantId,
    pub status: CallStatus,
    pub ice_state: IceConnectionState,
    pub local_media: Option<MediaStreamHandle>,
    pub remote_media: Option<RemoteMedia>,
    /// Tracks reported before the call reached a state that may expose them.
    pub parked_tracks: Vec<RemoteTrack>,
    pub channel: Option<ChannelHandle>,
    pub adapter: Option<Box<dyn PeerConnectionAdapter>>,
    pub events: Option<AdapterEvents>,
    pub peer: Option<ParticipantId>,
    pub captions: Option<JoinHandle<()>>,
}

impl CallSession {
    pub fn new(room: RoomToken, participant: ParticipantId) -> Self {
        Self {
            room,
            participant,
            status: CallStatus::Connecting,
            ice_state: IceConnectionState::New,
            local_media: None,
            remote_media: None,
            parked_tracks: Vec::new(),
            channel: None,
            adapter: None,
            events: None,
            peer: None,
            captions: None,
        }
    }
}
