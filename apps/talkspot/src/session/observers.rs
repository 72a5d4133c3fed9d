//! Subscription hooks for UI layers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::warn;

use super::CallStatus;
use crate::captions::Caption;
use crate::error::CallNotice;
use crate::media::RemoteMedia;
use crate::transport::IceConnectionState;

/// The notice currently shown on the banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub seq: u64,
    pub notice: CallNotice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaToggles {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaToggles {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

struct Hooks {
    status: watch::Sender<CallStatus>,
    ice: watch::Sender<IceConnectionState>,
    remote_media: watch::Sender<Option<RemoteMedia>>,
    toggles: watch::Sender<MediaToggles>,
    banner: watch::Sender<Option<Banner>>,
    notices: broadcast::Sender<CallNotice>,
    captions: broadcast::Sender<Caption>,
    notice_duration: Duration,
    seq: AtomicU64,
}

/// Publisher side, owned by the controller. Cloning shares the same hooks.
#[derive(Clone)]
pub struct CallObservers {
    hooks: Arc<Hooks>,
}

impl CallObservers {
    pub fn new(notice_duration: Duration) -> Self {
        Self {
            hooks: Arc::new(Hooks {
                status: watch::channel(CallStatus::Idle).0,
                ice: watch::channel(IceConnectionState::New).0,
                remote_media: watch::channel(None).0,
                toggles: watch::channel(MediaToggles::default()).0,
                banner: watch::channel(None).0,
                notices: broadcast::channel(32).0,
                captions: broadcast::channel(64).0,
                notice_duration,
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> CallStatus {
        *self.hooks.status.borrow()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        *self.hooks.ice.borrow()
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.hooks.remote_media.borrow().clone()
    }

    pub fn toggles(&self) -> MediaToggles {
        *self.hooks.toggles.borrow()
    }

    pub(crate) fn set_status(&self, status: CallStatus) -> bool {
        self.hooks.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        })
    }

    pub(crate) fn set_ice_state(&self, state: IceConnectionState) {
        self.hooks.ice.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub(crate) fn set_remote_media(&self, media: Option<RemoteMedia>) {
        self.hooks.remote_media.send_replace(media);
    }

    pub(crate) fn set_toggles(&self, toggles: MediaToggles) {
        self.hooks.toggles.send_replace(toggles);
    }

    pub(crate) fn caption_sink(&self) -> broadcast::Sender<Caption> {
        self.hooks.captions.clone()
    }

    /// Broadcast `notice` and show it on the banner until the display
    /// duration passes or a newer notice replaces it.
    pub(crate) fn notify(&self, notice: CallNotice) {
        warn!(target: "talkspot::controller", category = %notice.category, message = %notice.message, "call notice");
        let seq = self.hooks.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.hooks.notices.send(notice.clone());
        self.hooks.banner.send_replace(Some(Banner { seq, notice }));

        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            tokio::time::sleep(hooks.notice_duration).await;
            hooks.banner.send_if_modified(|banner| {
                if banner.as_ref().is_some_and(|shown| shown.seq == seq) {
                    *banner = None;
                    true
                } else {
                    false
                }
            });
        });
    }

    pub fn watch(&self) -> CallWatch {
        CallWatch {
            hooks: Arc::clone(&self.hooks),
        }
    }
}

/// Read-only subscription handle given to UI layers.
#[derive(Clone)]
pub struct CallWatch {
    hooks: Arc<Hooks>,
}

impl CallWatch {
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.hooks.status.subscribe()
    }

    pub fn ice_state(&self) -> watch::Receiver<IceConnectionState> {
        self.hooks.ice.subscribe()
    }

    /// `Some` while the peer's stream is available.
    pub fn remote_media(&self) -> watch::Receiver<Option<RemoteMedia>> {
        self.hooks.remote_media.subscribe()
    }

    pub fn toggles(&self) -> watch::Receiver<MediaToggles> {
        self.hooks.toggles.subscribe()
    }

    pub fn banner(&self) -> watch::Receiver<Option<Banner>> {
        self.hooks.banner.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<CallNotice> {
        self.hooks.notices.subscribe()
    }

    pub fn captions(&self) -> broadcast::Receiver<Caption> {
        self.hooks.captions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn notice(message: &str) -> CallNotice {
        CallNotice {
            category: ErrorCategory::Transport,
            message: message.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn banner_clears_after_display_duration() {
        let observers = CallObservers::new(Duration::from_secs(5));
        let watch = observers.watch();
        let mut banner = watch.banner();
        let mut errors = watch.errors();

        observers.notify(notice("lost"));
        assert_eq!(errors.recv().await.expect("notice"), notice("lost"));
        assert!(banner.borrow_and_update().is_some());

        banner.changed().await.expect("cleared");
        assert!(banner.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_notice_is_not_cleared_by_older_timer() {
        let observers = CallObservers::new(Duration::from_secs(5));
        let banner = observers.watch().banner();

        observers.notify(notice("first"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        observers.notify(notice("second"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            banner.borrow().as_ref().map(|b| b.notice.message.clone()),
            Some("second".to_string())
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(banner.borrow().is_none());
    }

    #[test]
    fn status_updates_only_signal_real_changes() {
        let observers = CallObservers::new(Duration::from_secs(5));
        assert!(!observers.set_status(CallStatus::Idle));
        assert!(observers.set_status(CallStatus::Connecting));
        assert_eq!(observers.status(), CallStatus::Connecting);
    }
}
