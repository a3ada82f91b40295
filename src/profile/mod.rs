//! Per-user profile records and the row store that holds them.

mod rest;

pub use rest::RestProfileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::identity::AuthIdentity;

/// Plantation preference written into freshly created profiles
pub const DEFAULT_AGRICULTURAL_PREFERENCE: &str = "oil_palm";

/// Default interface language for new profiles
pub const DEFAULT_LANGUAGE: &str = "en";

/// Errors returned by the profile row store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile store error ({code}): {message}")]
    Store { code: String, message: String },

    #[error("profile store request failed: {0}")]
    Network(String),

    #[error("invalid profile row: {0}")]
    InvalidResponse(String),
}

impl ProfileError {
    pub fn code(&self) -> &str {
        match self {
            ProfileError::Store { code, .. } => code,
            ProfileError::Network(_) => "network",
            ProfileError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Access role stored on the profile row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    /// Also what any unrecognized stored value reads as
    #[default]
    #[serde(other)]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Manager => "manager",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the profiles table, keyed by identity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub full_name: Option<String>,
    pub organization: Option<String>,
    #[serde(default)]
    pub role: Role,
    pub location: Option<String>,
    #[serde(default = "default_language")]
    pub preferred_language: String,
    pub agricultural_preference: Option<String>,
    pub default_plantation_type: Option<String>,
    pub default_soil_type: Option<String>,
    pub default_focus: Option<String>,
    pub land_size: Option<f64>,
    pub experience_years: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl ProfileRecord {
    /// The row inserted for a user who has none yet.
    pub fn default_for(identity: &AuthIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id: identity.id.clone(),
            full_name: Some(identity.display_name().to_string()),
            organization: None,
            role: Role::User,
            location: None,
            preferred_language: default_language(),
            agricultural_preference: Some(DEFAULT_AGRICULTURAL_PREFERENCE.to_string()),
            default_plantation_type: None,
            default_soil_type: None,
            default_focus: None,
            land_size: None,
            experience_years: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial profile update. Absent fields are left untouched by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agricultural_preference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_plantation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_soil_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_focus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub land_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_years: Option<u32>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }

    /// Apply the present fields onto `record` and stamp `updated_at`.
    pub fn apply_to(&self, record: &mut ProfileRecord, now: DateTime<Utc>) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn set_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set_opt(&mut record.full_name, &self.full_name);
        set_opt(&mut record.organization, &self.organization);
        set(&mut record.role, &self.role);
        set_opt(&mut record.location, &self.location);
        set(&mut record.preferred_language, &self.preferred_language);
        set_opt(&mut record.agricultural_preference, &self.agricultural_preference);
        set_opt(&mut record.default_plantation_type, &self.default_plantation_type);
        set_opt(&mut record.default_soil_type, &self.default_soil_type);
        set_opt(&mut record.default_focus, &self.default_focus);
        set_opt(&mut record.land_size, &self.land_size);
        set_opt(&mut record.experience_years, &self.experience_years);
        record.updated_at = now;
    }
}

/// Outcome of a profile read that did not fail outright
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileLookup {
    Found(ProfileRecord),
    /// The store reported "no rows" for this id
    Missing,
    /// Neither a row nor an error came back
    Empty,
}

/// External row store holding one profile per user.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<ProfileLookup, ProfileError>;
    async fn create_default(&self, identity: &AuthIdentity) -> Result<ProfileRecord, ProfileError>;
    /// Upsert the given fields; `updated_at` is always re-stamped
    async fn update(&self, user_id: &str, fields: &ProfileUpdate) -> Result<(), ProfileError>;
}
