//! Read-only view of the signed-in user, supplied by the host application.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_AVATAR_COLOR: &str = "#00f3ff";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("display name cannot be empty")]
    MissingName,
    #[error("profile handle cannot be empty")]
    MissingHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    /// Normalized handle (phone, email or username).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub avatar_color: String,
}

impl UserProfile {
    pub fn new(name: &str, handle: &str) -> Result<Self, ProfileError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProfileError::MissingName);
        }
        let id = handle.trim().to_lowercase();
        if id.is_empty() {
            return Err(ProfileError::MissingHandle);
        }
        Ok(Self {
            name: name.to_string(),
            id,
            avatar: None,
            avatar_color: DEFAULT_AVATAR_COLOR.to_string(),
        })
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn initial(&self) -> char {
        self.name.chars().next().unwrap_or('?')
    }
}

/// Source of the current profile at join time.
pub trait ProfileProvider: Send + Sync {
    fn current(&self) -> Option<UserProfile>;
}

/// Profile held in memory; `clear` models a logout performed by the host.
#[derive(Debug, Default)]
pub struct StaticProfile {
    inner: RwLock<Option<UserProfile>>,
}

impl StaticProfile {
    pub fn new(profile: UserProfile) -> Self {
        Self {
            inner: RwLock::new(Some(profile)),
        }
    }

    pub fn set(&self, profile: UserProfile) {
        *self.inner.write() = Some(profile);
    }

    pub fn clear(&self) {
        self.inner.write().take();
    }
}

impl ProfileProvider for StaticProfile {
    fn current(&self) -> Option<UserProfile> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_normalized() {
        let profile = UserProfile::new(" Grace ", " GRACE.h ").expect("profile");
        assert_eq!(profile.name, "Grace");
        assert_eq!(profile.id, "grace.h");
        assert_eq!(profile.initial(), 'G');
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert_eq!(UserProfile::new("", "x"), Err(ProfileError::MissingName));
        assert_eq!(UserProfile::new("x", "  "), Err(ProfileError::MissingHandle));
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let profile = UserProfile::new("Ada", "ada").expect("profile");
        let value = serde_json::to_value(&profile).expect("json");
        assert_eq!(value["avatarColor"], DEFAULT_AVATAR_COLOR);
        assert!(value.get("avatar").is_none());
    }

    #[test]
    fn static_profile_can_be_cleared() {
        let store = StaticProfile::new(UserProfile::new("Ada", "ada").expect("profile"));
        assert!(store.current().is_some());
        store.clear();
        assert!(store.current().is_none());
    }
}
