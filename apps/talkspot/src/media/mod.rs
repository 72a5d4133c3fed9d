//! Local capture handles and inbound media exposed to the controller.

pub mod synthetic;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub use synthetic::SyntheticCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("capture granted without a {missing} track")]
    Incomplete { missing: TrackKind },
    #[error("capture device error: {0}")]
    Device(String),
}

/// What the controller asks the host environment to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub const fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}

/// Host capture boundary (camera + microphone).
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, request: MediaRequest) -> Result<MediaStreamHandle, MediaError>;
}

/// A single captured track, bound to an RTP sample track for sending.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", Uuid::new_v4().simple());
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn rtp(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtp
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Exclusively owned capture; stopping it ends every track. Dropping stops too.
#[derive(Debug)]
pub struct MediaStreamHandle {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
    stopped: watch::Sender<bool>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
            stopped: watch::channel(false).0,
        }
    }

    /// Build a stream with one fresh track per requested kind.
    pub fn with_kinds(request: MediaRequest) -> Self {
        let id = format!("stream-{}", Uuid::new_v4().simple());
        let tracks = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .filter(|kind| request.wants(*kind))
            .map(|kind| Arc::new(LocalTrack::new(kind, &id)))
            .collect();
        Self::new(id, tracks)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|track| track.kind() == kind)
    }

    /// Fail unless every requested kind is present; partial grants are refused.
    pub fn ensure_complete(&self, request: MediaRequest) -> Result<(), MediaError> {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if request.wants(kind) && !self.has_kind(kind) {
                return Err(MediaError::Incomplete { missing: kind });
            }
        }
        Ok(())
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|track| track.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn stopped_signal(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|track| track.is_live()).count()
    }

    pub fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        self.stopped.send_replace(true);
        debug!(target: "talkspot::media", stream = %self.id, "local media stopped");
    }
}

impl Drop for MediaStreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One inbound track announced by the transport.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            rtp: None,
        }
    }

    pub fn with_rtp(mut self, rtp: Arc<TrackRemote>) -> Self {
        self.rtp = Some(rtp);
        self
    }

    /// Read-only access to the RTP source, when backed by a real transport.
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        self.rtp.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// The peer's stream, assembled from per-track announcements.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    /// Returns false when the track was already known.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|known| known.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|track| track.kind == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|track| track.kind == TrackKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_with_kinds_builds_requested_tracks() {
        let stream = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(stream.has_kind(TrackKind::Video));
        assert!(stream.ensure_complete(MediaRequest::audio_video()).is_ok());
        assert_eq!(stream.live_track_count(), 2);
    }

    #[test]
    fn partial_capture_is_refused() {
        let stream = MediaStreamHandle::with_kinds(MediaRequest {
            audio: true,
            video: false,
        });
        assert!(matches!(
            stream.ensure_complete(MediaRequest::audio_video()),
            Err(MediaError::Incomplete {
                missing: TrackKind::Video
            })
        ));
    }

    #[test]
    fn stop_is_idempotent_and_ends_tracks() {
        let stream = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        let signal = stream.stopped_signal();
        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
        assert!(*signal.borrow());
        assert_eq!(stream.live_track_count(), 0);
    }

    #[test]
    fn mute_only_touches_matching_kind() {
        let stream = MediaStreamHandle::with_kinds(MediaRequest::audio_video());
        stream.set_enabled(TrackKind::Audio, false);
        for track in stream.tracks() {
            assert_eq!(track.is_enabled(), track.kind() == TrackKind::Video);
        }
    }

    #[test]
    fn remote_media_deduplicates_tracks() {
        let mut remote = RemoteMedia::default();
        assert!(remote.add_track(RemoteTrack::new("a1", TrackKind::Audio, "s")));
        assert!(!remote.add_track(RemoteTrack::new("a1", TrackKind::Audio, "s")));
        assert!(remote.add_track(RemoteTrack::new("v1", TrackKind::Video, "s")));
        assert_eq!(remote.tracks().len(), 2);
        assert_eq!(remote.audio().map(|t| t.id.as_str()), Some("a1"));
    }
}
