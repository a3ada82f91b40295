//! Errors returned by the session controller's mutators.

use thiserror::Error;

use crate::profile::ProfileError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no user is signed in")]
    NotSignedIn,

    #[error(transparent)]
    Profile(#[from] ProfileError),
}
