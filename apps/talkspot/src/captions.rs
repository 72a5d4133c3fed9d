//! Live captions for the remote participant's audio.
//!
//! A [`CaptionService`] turns the remote audio track into text fragments; the
//! [`CaptionFeed`] merges fragments of one utterance into a single growing
//! caption. Caption failures are logged and never touch call state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::media::RemoteTrack;

/// Fragments closer together than this extend the current caption.
pub const MERGE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("caption service unavailable: {0}")]
    Unavailable(String),
    #[error("caption stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionFragment {
    Text(String),
    /// The speaker finished a turn; the next text starts a new caption.
    TurnComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub id: u64,
    pub sender: String,
    pub text: String,
    pub timestamp: OffsetDateTime,
}

#[async_trait]
pub trait CaptionService: Send + Sync {
    /// Stream fragments for `audio` until the track ends or the task is aborted.
    async fn transcribe(
        &self,
        audio: RemoteTrack,
        fragments: mpsc::Sender<CaptionFragment>,
    ) -> Result<(), CaptionError>;
}

#[derive(Debug)]
pub struct CaptionFeed {
    sender: String,
    window: Duration,
    current: Option<Caption>,
    next_id: u64,
}

impl CaptionFeed {
    pub fn new(sender: impl Into<String>) -> Self {
        Self::with_window(sender, MERGE_WINDOW)
    }

    pub fn with_window(sender: impl Into<String>, window: Duration) -> Self {
        Self {
            sender: sender.into(),
            window,
            current: None,
            next_id: 0,
        }
    }

    /// Apply one fragment; returns the caption to display, if it changed.
    pub fn push(&mut self, fragment: CaptionFragment, now: OffsetDateTime) -> Option<Caption> {
        let text = match fragment {
            CaptionFragment::TurnComplete => {
                self.current = None;
                return None;
            }
            CaptionFragment::Text(text) if text.is_empty() => return None,
            CaptionFragment::Text(text) => text,
        };

        let within_window = self
            .current
            .as_ref()
            .is_some_and(|caption| now - caption.timestamp < self.window);
        match self.current.as_mut() {
            Some(caption) if within_window => caption.text.push_str(&text),
            _ => {
                self.next_id += 1;
                self.current = Some(Caption {
                    id: self.next_id,
                    sender: self.sender.clone(),
                    text,
                    timestamp: now,
                });
            }
        }
        self.current.clone()
    }
}

/// Run `service` against the remote audio and publish merged captions.
pub(crate) fn spawn_captions(
    service: Arc<dyn CaptionService>,
    audio: RemoteTrack,
    sender: String,
    out: broadcast::Sender<Caption>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel(64);
        let mut feed = CaptionFeed::new(sender);
        let transcribe = service.transcribe(audio, tx);
        tokio::pin!(transcribe);
        let mut finished = false;
        loop {
            tokio::select! {
                result = &mut transcribe, if !finished => {
                    finished = true;
                    match result {
                        Ok(()) => debug!(target: "talkspot::captions", "caption service finished"),
                        Err(err) => warn!(target: "talkspot::captions", error = %err, "caption service failed"),
                    }
                }
                fragment = rx.recv() => {
                    let Some(fragment) = fragment else { break };
                    if let Some(caption) = feed.push(fragment, OffsetDateTime::now_utc()) {
                        let _ = out.send(caption);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration as TimeDuration;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(secs)
    }

    #[test]
    fn fragments_within_window_grow_one_caption() {
        let mut feed = CaptionFeed::new("grace:2");
        let first = feed.push(CaptionFragment::Text("Hello".into()), at(0)).expect("caption");
        let second = feed
            .push(CaptionFragment::Text(" there".into()), at(3))
            .expect("caption");
        assert_eq!(first.id, second.id);
        assert_eq!(second.text, "Hello there");
        assert_eq!(second.timestamp, at(0));
    }

    #[test]
    fn window_expiry_and_turn_end_start_new_captions() {
        let mut feed = CaptionFeed::new("grace:2");
        let first = feed.push(CaptionFragment::Text("one".into()), at(0)).expect("caption");
        let late = feed.push(CaptionFragment::Text("two".into()), at(6)).expect("caption");
        assert_ne!(first.id, late.id);
        assert_eq!(late.text, "two");

        assert!(feed.push(CaptionFragment::TurnComplete, at(7)).is_none());
        let next = feed.push(CaptionFragment::Text("three".into()), at(7)).expect("caption");
        assert_ne!(next.id, late.id);
        assert_eq!(next.text, "three");
    }

    struct Scripted(Vec<CaptionFragment>);

    #[async_trait]
    impl CaptionService for Scripted {
        async fn transcribe(
            &self,
            _audio: RemoteTrack,
            fragments: mpsc::Sender<CaptionFragment>,
        ) -> Result<(), CaptionError> {
            for fragment in self.0.clone() {
                fragments
                    .send(fragment)
                    .await
                    .map_err(|err| CaptionError::Stream(err.to_string()))?;
            }
            Err(CaptionError::Stream("socket closed".into()))
        }
    }

    #[tokio::test]
    async fn service_failure_still_delivers_earlier_captions() {
        let (out, mut rx) = broadcast::channel(8);
        let service = Arc::new(Scripted(vec![
            CaptionFragment::Text("hi".into()),
            CaptionFragment::TurnComplete,
            CaptionFragment::Text("bye".into()),
        ]));
        let task = spawn_captions(
            service,
            RemoteTrack::new("a1", crate::media::TrackKind::Audio, "s"),
            "grace:2".into(),
            out,
        );
        assert_eq!(rx.recv().await.expect("caption").text, "hi");
        assert_eq!(rx.recv().await.expect("caption").text, "bye");
        task.await.expect("caption task");
    }
}
