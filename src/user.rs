//! The merged identity + profile view handed to the rest of the application.

use serde::Serialize;

use crate::identity::{AuthIdentity, Metadata};
use crate::profile::{ProfileRecord, Role};

/// Agricultural preference reported when the profile does not set one
pub const DEFAULT_PREFERENCE: &str = "balanced";

/// In-memory union of an identity and its (optional) profile row.
///
/// Built fresh on every merge and published as a whole; never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtendedUser {
    pub id: String,
    pub email: String,
    pub metadata: Metadata,
    pub profile: Option<ProfileRecord>,
    pub role: Role,
    pub agricultural_preference: String,
}

impl ExtendedUser {
    pub fn merge(identity: &AuthIdentity, profile: Option<ProfileRecord>) -> Self {
        let role = profile.as_ref().map(|p| p.role).unwrap_or_default();
        let agricultural_preference = profile
            .as_ref()
            .and_then(|p| p.agricultural_preference.clone())
            .unwrap_or_else(|| DEFAULT_PREFERENCE.to_string());
        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            metadata: identity.metadata.clone(),
            profile,
            role,
            agricultural_preference,
        }
    }

    /// The identity alone, used when no profile could be read or created.
    pub fn bare(identity: &AuthIdentity) -> Self {
        Self::merge(identity, None)
    }

    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .and_then(|p| p.full_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.email)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_manager(&self) -> bool {
        self.role == Role::Manager
    }
}
