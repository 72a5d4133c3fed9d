//! Room and participant identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::profile::UserProfile;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room token cannot be empty")]
    EmptyToken,
    #[error("room token may not contain whitespace: {0:?}")]
    InvalidToken(String),
    #[error("invalid share base url {base}: {reason}")]
    ShareBase { base: String, reason: String },
}

/// Case-normalized meeting identifier; also scopes the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomToken(String);

impl RoomToken {
    pub fn parse(raw: &str) -> Result<Self, RoomError> {
        let token = raw.trim().to_lowercase();
        if token.is_empty() {
            return Err(RoomError::EmptyToken);
        }
        if token.chars().any(char::is_whitespace) {
            return Err(RoomError::InvalidToken(token));
        }
        Ok(Self(token))
    }

    /// Accept a token exactly as received from the wire. No normalization is
    /// applied, so a peer using a different casing never matches our room.
    pub fn from_wire(raw: &str) -> Result<Self, RoomError> {
        if raw.is_empty() {
            return Err(RoomError::EmptyToken);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic name on the signaling bus; same namespace and token always meet.
    pub fn channel_name(&self, namespace: &str) -> String {
        format!("{namespace}_{}", self.0)
    }

    pub fn share_url(&self, base: &str) -> Result<Url, RoomError> {
        let mut url = Url::parse(base).map_err(|err| RoomError::ShareBase {
            base: base.to_string(),
            reason: err.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| RoomError::ShareBase {
                base: base.to_string(),
                reason: "url cannot carry a path".into(),
            })?
            .pop_if_empty()
            .push(&self.0);
        Ok(url)
    }
}

impl fmt::Display for RoomToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity stamped on every outbound signaling message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Derive a tab-unique id from a profile handle. Two tabs signed into the
    /// same profile must not mistake each other's messages for their own.
    pub fn for_profile(profile: &UserProfile) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}:{}", profile.id, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
