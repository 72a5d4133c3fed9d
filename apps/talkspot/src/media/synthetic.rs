//! Capture source that needs no camera or microphone.
//!
//! Produces an Opus and a VP8 track and pumps placeholder frames into them
//! until the stream is stopped. Used by the loopback command and tests.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};
use webrtc::media::Sample;

use super::{LocalTrack, MediaError, MediaRequest, MediaSource, MediaStreamHandle, TrackKind};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
/// Opus TOC byte plus padding that decoders treat as a silent frame.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
/// Smallest VP8 key-frame header; enough to keep the RTP stream flowing.
const VP8_PLACEHOLDER: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x02, 0x00, 0x02, 0x00];

#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    deny: Option<String>,
    omit: Option<TrackKind>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition fails as if the user refused the permission prompt.
    pub fn denying(reason: impl Into<String>) -> Self {
        Self {
            deny: Some(reason.into()),
            omit: None,
        }
    }

    /// Grant the request but leave out one kind, like a browser with no webcam.
    pub fn without(kind: TrackKind) -> Self {
        Self {
            deny: None,
            omit: Some(kind),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticCapture {
    async fn acquire(&self, request: MediaRequest) -> Result<MediaStreamHandle, MediaError> {
        if let Some(reason) = &self.deny {
            return Err(MediaError::PermissionDenied(reason.clone()));
        }
        let granted = MediaRequest {
            audio: request.audio && self.omit != Some(TrackKind::Audio),
            video: request.video && self.omit != Some(TrackKind::Video),
        };
        let stream = MediaStreamHandle::with_kinds(granted);
        if let Err(err) = stream.ensure_complete(request) {
            stream.stop();
            return Err(err);
        }
        for track in stream.tracks() {
            tokio::spawn(pump(Arc::clone(track), stream.stopped_signal()));
        }
        debug!(target: "talkspot::media", stream = %stream.id(), tracks = stream.tracks().len(), "synthetic capture started");
        Ok(stream)
    }
}

async fn pump(track: Arc<LocalTrack>, mut stopped: watch::Receiver<bool>) {
    let mut ticker = interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                tick = tick.wrapping_add(1);
                if !track.is_live() {
                    break;
                }
                if !track.is_enabled() {
                    continue;
                }
                let (data, duration) = match track.kind() {
                    TrackKind::Audio => (Bytes::from_static(&OPUS_SILENCE), FRAME_INTERVAL),
                    // 25 fps: every other audio tick
                    TrackKind::Video if tick % 2 == 0 => {
                        (Bytes::from_static(&VP8_PLACEHOLDER), FRAME_INTERVAL * 2)
                    }
                    TrackKind::Video => continue,
                };
                let sample = Sample {
                    data,
                    duration,
                    timestamp: SystemTime::now(),
                    ..Default::default()
                };
                if let Err(err) = track.rtp().write_sample(&sample).await {
                    trace!(target: "talkspot::media", track = %track.id(), error = %err, "sample write failed");
                }
            }
        }
    }
    trace!(target: "talkspot::media", track = %track.id(), "pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_both_kinds() {
        let stream = SyntheticCapture::new()
            .acquire(MediaRequest::audio_video())
            .await
            .expect("capture");
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(stream.has_kind(TrackKind::Video));
        stream.stop();
    }

    #[tokio::test]
    async fn denial_surfaces_as_permission_error() {
        let result = SyntheticCapture::denying("user dismissed prompt")
            .acquire(MediaRequest::audio_video())
            .await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn missing_camera_is_incomplete() {
        let result = SyntheticCapture::without(TrackKind::Video)
            .acquire(MediaRequest::audio_video())
            .await;
        assert!(matches!(
            result,
            Err(MediaError::Incomplete {
                missing: TrackKind::Video
            })
        ));
    }
}
