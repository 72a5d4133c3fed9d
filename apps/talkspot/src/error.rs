use std::fmt;

use thiserror::Error;

use crate::media::MediaError;
use crate::profile::ProfileError;
use crate::room::RoomError;
use crate::signaling::ChannelError;
use crate::transport::AdapterError;

/// Which row of the failure table an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    MediaAcquisition,
    ChannelUnavailable,
    AdapterSetup,
    Negotiation,
    Transport,
    InvalidRequest,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::MediaAcquisition => "media_acquisition",
            ErrorCategory::ChannelUnavailable => "channel_unavailable",
            ErrorCategory::AdapterSetup => "adapter_setup",
            ErrorCategory::Negotiation => "negotiation",
            ErrorCategory::Transport => "transport",
            ErrorCategory::InvalidRequest => "invalid_request",
        })
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error(transparent)]
    ChannelUnavailable(#[from] ChannelError),
    #[error("transport setup failed: {0}")]
    AdapterSetup(#[source] AdapterError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] AdapterError),
    #[error("ice connection failed")]
    TransportFailed,
    #[error("invalid room: {0}")]
    Room(#[from] RoomError),
    #[error("no signed-in profile")]
    NoProfile,
    #[error("invalid profile: {0}")]
    Profile(#[from] ProfileError),
    #[error("call controller is no longer running")]
    ControllerGone,
    #[error("request was superseded before it completed")]
    Cancelled,
}

impl CallError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CallError::MediaAcquisition(_) => ErrorCategory::MediaAcquisition,
            CallError::ChannelUnavailable(_) | CallError::ControllerGone => {
                ErrorCategory::ChannelUnavailable
            }
            CallError::AdapterSetup(_) => ErrorCategory::AdapterSetup,
            CallError::Negotiation(_) => ErrorCategory::Negotiation,
            CallError::TransportFailed => ErrorCategory::Transport,
            CallError::Room(_)
            | CallError::NoProfile
            | CallError::Profile(_)
            | CallError::Cancelled => ErrorCategory::InvalidRequest,
        }
    }

    /// Text shown to the user on the notice banner.
    pub fn user_message(&self) -> String {
        match self {
            CallError::MediaAcquisition(_) => {
                "Camera/Microphone access is required for TalkSpot.".to_string()
            }
            CallError::ChannelUnavailable(_) | CallError::ControllerGone => {
                "Could not reach the meeting room. Please try again.".to_string()
            }
            CallError::AdapterSetup(_) => "Could not start the call connection.".to_string(),
            CallError::Negotiation(_) => "The call could not be set up and was ended.".to_string(),
            CallError::TransportFailed => {
                "Connection lost. Check your network or ask your partner to rejoin.".to_string()
            }
            CallError::Room(err) => format!("That meeting code is not valid: {err}."),
            CallError::NoProfile | CallError::Profile(_) => {
                "Sign in before joining a meeting.".to_string()
            }
            CallError::Cancelled => "The join request was cancelled.".to_string(),
        }
    }
}

/// A user-facing failure report, one per failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNotice {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&CallError> for CallNotice {
    fn from(err: &CallError) -> Self {
        Self {
            category: err.category(),
            message: err.user_message(),
        }
    }
}

impl fmt::Display for CallNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;

    #[test]
    fn media_errors_map_to_acquisition_notice() {
        let err = CallError::from(MediaError::NoDevice(TrackKind::Video));
        let notice = CallNotice::from(&err);
        assert_eq!(notice.category, ErrorCategory::MediaAcquisition);
        assert_eq!(
            notice.message,
            "Camera/Microphone access is required for TalkSpot."
        );
    }

    #[test]
    fn adapter_errors_keep_their_phase() {
        let setup = CallError::AdapterSetup(AdapterError::Setup("no codecs".into()));
        let negotiation = CallError::Negotiation(AdapterError::Negotiation("bad sdp".into()));
        assert_eq!(setup.category(), ErrorCategory::AdapterSetup);
        assert_eq!(negotiation.category(), ErrorCategory::Negotiation);
        assert!(negotiation.to_string().contains("bad sdp"));
    }
}
