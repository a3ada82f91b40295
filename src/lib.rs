pub mod cache;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod profile;
pub mod surface;
pub mod user;

#[cfg(test)]
mod testing;

pub use controller::{ControllerStats, FetchOutcome, SessionController, StaleReason};
pub use error::SessionError;
pub use identity::{AuthError, AuthIdentity, IdentityAdapter, IdentityClient, Session};
pub use profile::{ProfileError, ProfileRecord, ProfileStore, ProfileUpdate, Role};
pub use surface::{AuthContext, AuthState, Phase};
pub use user::ExtendedUser;
