//! Identity backend boundary.
//!
//! [`IdentityClient`] is the external identity service: session retrieval,
//! credential sign-in/sign-up, sign-out and a stream of session changes.
//! [`IdentityAdapter`] owns the client handle for the rest of the crate. The
//! handle is built lazily by a [`Connector`]; when construction fails (usually
//! missing connection parameters) the failure is reported as
//! [`AuthError::BackendUnavailable`] and construction is retried on the next
//! access.

mod http;

pub use http::{BearerToken, HttpConnector, HttpIdentityClient};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Free-form user metadata attached to an identity.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by the identity backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("identity backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("rejected by identity backend ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("identity backend request failed: {0}")]
    Network(String),

    #[error("invalid response from identity backend: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Short machine-readable code for log fields.
    pub fn code(&self) -> &str {
        match self {
            AuthError::BackendUnavailable(_) => "backend_unavailable",
            AuthError::Rejected { code, .. } => code,
            AuthError::Network(_) => "network",
            AuthError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Minimal identity record issued by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthIdentity {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "user_metadata")]
    pub metadata: Metadata,
}

impl AuthIdentity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Name from metadata (`full_name`, then `name`), falling back to email.
    pub fn display_name(&self) -> &str {
        ["full_name", "name"]
            .iter()
            .filter_map(|key| self.metadata.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|name| !name.is_empty())
            .unwrap_or(&self.email)
    }
}

/// Backend-issued token bundle.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: AuthIdentity,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// True when the access token expires within `margin` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
                expires_at - margin <= now
            }
            None => false,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Kind of session change reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Initial,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventKind::Initial => "INITIAL_SESSION",
            SessionEventKind::SignedIn => "SIGNED_IN",
            SessionEventKind::SignedOut => "SIGNED_OUT",
            SessionEventKind::TokenRefreshed => "TOKEN_REFRESHED",
            SessionEventKind::UserUpdated => "USER_UPDATED",
        }
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEventKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIAL_SESSION" | "INITIAL" => Ok(SessionEventKind::Initial),
            "SIGNED_IN" => Ok(SessionEventKind::SignedIn),
            "SIGNED_OUT" => Ok(SessionEventKind::SignedOut),
            "TOKEN_REFRESHED" => Ok(SessionEventKind::TokenRefreshed),
            "USER_UPDATED" => Ok(SessionEventKind::UserUpdated),
            other => Err(AuthError::InvalidResponse(format!(
                "unknown session event: {}",
                other
            ))),
        }
    }
}

/// One session change, delivered in backend emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// Result of a sign-up. `session` is absent while e-mail confirmation is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct SignUp {
    pub identity: AuthIdentity,
    pub session: Option<Session>,
}

/// Receiving end of a session-change subscription.
///
/// Dropping it unsubscribes; the client prunes closed senders on the next emit.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the client has gone away.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

/// Fan-out list of subscribers kept by client implementations.
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, optionally seeding it with a first event.
    pub fn subscribe(&self, initial: Option<SessionEvent>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(event) = initial {
            let _ = tx.send(event);
        }
        self.senders.lock().push(tx);
        Subscription::new(rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::debug!(
            event = %event.kind,
            subscribers = senders.len(),
            "Session event emitted"
        );
    }

    /// Drop every subscriber; their streams end.
    pub fn close(&self) {
        self.senders.lock().clear();
    }

    /// Number of subscribers that have not been dropped.
    pub fn len(&self) -> usize {
        self.senders.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The external identity service.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(AuthIdentity, Session), AuthError>;
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> Result<SignUp, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    /// Subscribe to session changes
    fn subscribe(&self) -> Subscription;
}

/// Builds an [`IdentityClient`] from connection parameters.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn IdentityClient>, AuthError>;
}

/// Connector handing out an already-built client.
pub struct StaticConnector(pub Arc<dyn IdentityClient>);

impl Connector for StaticConnector {
    fn connect(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        Ok(self.0.clone())
    }
}

/// Owner of the identity client handle.
pub struct IdentityAdapter {
    connector: Box<dyn Connector>,
    client: Mutex<Option<Arc<dyn IdentityClient>>>,
}

impl IdentityAdapter {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            client: Mutex::new(None),
        }
    }

    pub fn from_client(client: Arc<dyn IdentityClient>) -> Self {
        Self::new(StaticConnector(client))
    }

    /// The client handle, constructing it on first use.
    fn client(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        match self.connector.connect() {
            Ok(client) => {
                tracing::debug!("Identity client constructed");
                *slot = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                tracing::error!(error = %e, "Identity client construction failed, will retry on next access");
                Err(e)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    pub async fn get_current_session(&self) -> Result<Option<Session>, AuthError> {
        self.client()?.get_session().await
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(AuthIdentity, Session), AuthError> {
        let result = self.client()?.sign_in_with_password(email, password).await;
        if let Err(e) = &result {
            tracing::info!(operation = "sign_in", code = e.code(), "Sign-in rejected");
        }
        result
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Metadata>,
    ) -> Result<SignUp, AuthError> {
        let result = self
            .client()?
            .sign_up(email, password, metadata.unwrap_or_default())
            .await;
        if let Err(e) = &result {
            tracing::info!(operation = "sign_up", code = e.code(), "Sign-up rejected");
        }
        result
    }

    /// Best-effort sign-out; failures are logged and swallowed.
    pub async fn sign_out(&self) {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(operation = "sign_out", error = %e, "Sign-out skipped");
                return;
            }
        };
        if let Err(e) = client.sign_out().await {
            tracing::warn!(operation = "sign_out", code = e.code(), error = %e, "Sign-out failed");
        }
    }

    pub fn on_session_change(&self) -> Result<Subscription, AuthError> {
        Ok(self.client()?.subscribe())
    }
}
