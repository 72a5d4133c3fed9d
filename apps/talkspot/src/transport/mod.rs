use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::media::{MediaStreamHandle, RemoteTrack};
use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
pub mod webrtc;

pub use self::webrtc::WebRtcAdapterFactory;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("peer connection is closed")]
    Closed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// ICE agent state as reported by the transport. Observational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum AdapterEvent {
    IceStateChanged(IceConnectionState),
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
}

/// STUN/TURN server entry handed to the transport at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
        }
    }
}

/// One media/negotiation transport per call.
///
/// SDP methods reject out-of-order or malformed input with
/// [`AdapterError::Negotiation`]; after [`close`](Self::close) every call
/// fails with [`AdapterError::Closed`].
#[async_trait]
pub trait PeerConnectionAdapter: Send {
    async fn attach_local_tracks(&mut self, media: &MediaStreamHandle) -> Result<(), AdapterError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, AdapterError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, AdapterError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), AdapterError>;
    async fn set_remote_description(&mut self, desc: SessionDescription)
    -> Result<(), AdapterError>;
    /// Buffers until a remote description has been applied.
    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), AdapterError>;
    async fn close(&mut self);
    fn is_closed(&self) -> bool;
}

pub type AdapterEvents = mpsc::Receiver<AdapterEvent>;

#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Allocate a transport. Event observation is wired before this returns.
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerConnectionAdapter>, AdapterEvents), AdapterError>;
}

/// Sending half of the bounded adapter event stream.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<AdapterEvent>,
}

impl EventSink {
    pub(crate) fn channel(capacity: usize) -> (Self, AdapterEvents) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits for room in the stream, so nothing is lost while the controller
    /// catches up. Only a closed stream discards the event.
    pub(crate) async fn deliver(&self, event: AdapterEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event).await {
            trace!(target: "talkspot::transport", ?event, "adapter event after controller went away");
        }
    }

    /// Non-waiting variant for synchronous call sites; drops the event when
    /// the controller has fallen behind or gone away.
    pub(crate) fn emit(&self, event: AdapterEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(target: "talkspot::transport", ?event, "adapter event stream full; dropping event")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
