//! User profiles and the profile store capability.
//!
//! Profiles live in the identity provider's document store, keyed by the
//! user id a [`TokenVerifier`](crate::auth::TokenVerifier) returns. The relay
//! itself never reads profiles; [`ProfileStore`] is exported for other
//! components in the same process (account tooling, admin surfaces) that need
//! them. [`IdentityClient`](crate::identity::IdentityClient) is the
//! HTTP-backed store and [`InMemoryProfileStore`] stands in for it in tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Access level of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    #[default]
    Viewer,
}

/// A user's profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    /// Creates a profile with the default [`Role::Viewer`] role, stamped now.
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        full_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            full_name: full_name.into(),
            role: Role::default(),
            created_at: Utc::now(),
        }
    }
}

/// Errors returned by a [`ProfileStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// No profile exists for the user id.
    #[error("user profile not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("profile store error: {0}")]
    Backend(String),
}

/// Read/write access to user profiles keyed by user id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Loads the profile for `user_id`.
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, ProfileError>;

    /// Creates or replaces the profile keyed by `profile.id`.
    async fn put_profile(&self, profile: &UserProfile) -> Result<(), ProfileError>;
}

/// Process-local profile store.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, ProfileError> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(user_id.to_string()))
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<(), ProfileError> {
        debug!(user_id = %profile.id, role = ?profile.role, "Storing user profile");
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_defaults_to_viewer() {
        let profile = UserProfile::new("u1", "u1@example.com", "Ada Lovelace");
        assert_eq!(profile.role, Role::Viewer);
    }

    #[test]
    fn profile_uses_camel_case_fields() {
        let profile = UserProfile::new("u1", "u1@example.com", "Ada Lovelace");
        let json = serde_json::to_value(&profile).unwrap();

        assert_eq!(json["fullName"], "Ada Lovelace");
        assert_eq!(json["role"], "viewer");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("full_name").is_none());
    }

    #[test]
    fn profile_without_role_deserializes_as_viewer() {
        let profile: UserProfile = serde_json::from_value(serde_json::json!({
            "id": "u2",
            "email": "u2@example.com",
            "fullName": "Grace Hopper",
            "createdAt": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(profile.role, Role::Viewer);
        assert_eq!(profile.full_name, "Grace Hopper");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result: Result<UserProfile, _> = serde_json::from_value(serde_json::json!({
            "id": "u3",
            "email": "u3@example.com",
            "fullName": "X",
            "role": "superuser",
            "createdAt": "2024-05-01T12:00:00Z"
        }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_by_id() {
        let store = InMemoryProfileStore::new();
        assert!(store.is_empty());

        let mut profile = UserProfile::new("u1", "u1@example.com", "Ada");
        store.put_profile(&profile).await.unwrap();
        assert_eq!(store.get_profile("u1").await.unwrap(), profile);

        profile.role = Role::Operator;
        store.put_profile(&profile).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_profile("u1").await.unwrap().role, Role::Operator);
    }

    #[tokio::test]
    async fn in_memory_store_reports_missing_profile() {
        let store = InMemoryProfileStore::new();
        let err = store.get_profile("ghost").await.unwrap_err();
        assert_eq!(err, ProfileError::NotFound("ghost".to_string()));
    }
}
