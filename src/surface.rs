//! Read-only view of the session state consumed by every screen.
//!
//! [`AuthState`] is an immutable snapshot; a new one is published on every
//! change. [`AuthContext`] is the handle screens hold: it reads the latest
//! snapshot without locking and forwards the few mutators to the controller.

use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::watch;

use crate::controller::SessionController;
use crate::error::SessionError;
use crate::identity::{AuthError, AuthIdentity, Metadata, Session, SignUp};
use crate::profile::ProfileUpdate;
use crate::user::ExtendedUser;

/// Controller lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

/// Snapshot of the session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub phase: Phase,
    /// Never serialized; tokens stay in-process
    pub session: Option<Session>,
    pub user: Option<ExtendedUser>,
    /// Set once `Ready` is first reached; never reverts
    pub initialized: bool,
    /// The identity backend could not be constructed at startup
    pub backend_unavailable: bool,
}

impl AuthState {
    pub fn loading(&self) -> bool {
        self.phase != Phase::Ready
    }

    pub fn is_admin(&self) -> bool {
        self.user.as_ref().is_some_and(ExtendedUser::is_admin)
    }

    pub fn is_manager(&self) -> bool {
        self.user.as_ref().is_some_and(ExtendedUser::is_manager)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn session_user_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::user_id)
    }
}

/// Serialized form of [`AuthState`], with the derived flags filled in.
#[derive(Serialize)]
struct StateView<'a> {
    phase: Phase,
    loading: bool,
    initialized: bool,
    backend_unavailable: bool,
    is_admin: bool,
    is_manager: bool,
    user: Option<&'a ExtendedUser>,
}

impl Serialize for AuthState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StateView {
            phase: self.phase,
            loading: self.loading(),
            initialized: self.initialized,
            backend_unavailable: self.backend_unavailable,
            is_admin: self.is_admin(),
            is_manager: self.is_manager(),
            user: self.user.as_ref(),
        }
        .serialize(serializer)
    }
}

/// Handle through which the application reads and drives the session state.
#[derive(Clone)]
pub struct AuthContext {
    controller: SessionController,
}

impl AuthContext {
    pub(crate) fn new(controller: SessionController) -> Self {
        Self { controller }
    }

    pub fn state(&self) -> Arc<AuthState> {
        self.controller.state()
    }

    pub fn user(&self) -> Option<ExtendedUser> {
        self.state().user.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.state().session.clone()
    }

    pub fn loading(&self) -> bool {
        self.state().loading()
    }

    pub fn initialized(&self) -> bool {
        self.state().initialized
    }

    pub fn backend_unavailable(&self) -> bool {
        self.state().backend_unavailable
    }

    pub fn is_admin(&self) -> bool {
        self.state().is_admin()
    }

    pub fn is_manager(&self) -> bool {
        self.state().is_manager()
    }

    /// Receiver that is notified on every published change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.controller.changes()
    }

    /// Wait for the next published change and return the new snapshot.
    pub async fn changed(&self) -> Arc<AuthState> {
        let mut changes = self.watch();
        let _ = changes.changed().await;
        self.state()
    }

    /// Wait until the published state satisfies `pred`.
    ///
    /// Returns the current snapshot if the controller goes away first.
    pub async fn wait_until<F>(&self, pred: F) -> Arc<AuthState>
    where
        F: Fn(&AuthState) -> bool,
    {
        let mut changes = self.watch();
        loop {
            let state = self.state();
            if pred(&state) {
                return state;
            }
            if changes.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(AuthIdentity, Session), AuthError> {
        self.controller.sign_in(email, password).await
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Metadata>,
    ) -> Result<SignUp, AuthError> {
        self.controller.sign_up(email, password, metadata).await
    }

    pub async fn sign_out(&self) {
        self.controller.sign_out().await
    }

    pub async fn refresh_user(&self) {
        self.controller.refresh_user().await
    }

    pub async fn update_profile(&self, fields: ProfileUpdate) -> Result<(), SessionError> {
        self.controller.update_profile(fields).await
    }
}
