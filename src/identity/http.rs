//! REST identity client for a GoTrue-style auth API.
//!
//! Endpoints used (relative to the configured backend URL):
//! - `POST /auth/v1/token?grant_type=password` - credential sign-in
//! - `POST /auth/v1/token?grant_type=refresh_token` - token refresh
//! - `POST /auth/v1/signup` - account creation
//! - `POST /auth/v1/logout` - session revocation
//!
//! The client keeps the current session in memory, publishes the access token
//! through a shared [`BearerToken`] for the row-store client, and reports every
//! change to its subscribers.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use super::{
    AuthError, AuthIdentity, Connector, IdentityClient, Metadata, Session, SessionEvent,
    SessionEventKind, SignUp, Subscribers, Subscription,
};
use crate::config::BackendConfig;

/// Access token shared between the identity client and row-store requests.
#[derive(Debug, Clone, Default)]
pub struct BearerToken(Arc<ArcSwapOption<String>>);

impl BearerToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<String>> {
        self.0.load_full()
    }

    pub fn set(&self, token: Option<String>) {
        self.0.store(token.map(Arc::new));
    }
}

/// Builds [`HttpIdentityClient`]s from backend configuration.
pub struct HttpConnector {
    config: BackendConfig,
    bearer: BearerToken,
}

impl HttpConnector {
    pub fn new(config: BackendConfig, bearer: BearerToken) -> Self {
        Self { config, bearer }
    }
}

impl Connector for HttpConnector {
    fn connect(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        let client = HttpIdentityClient::from_config(&self.config, self.bearer.clone())?;
        let client = Arc::new(client);
        if self.config.auto_refresh {
            HttpIdentityClient::spawn_auto_refresh(
                &client,
                self.config.refresh_check_interval(),
                self.config.refresh_margin(),
            );
        }
        Ok(client)
    }
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<Metadata>,
}

impl From<UserPayload> for AuthIdentity {
    fn from(user: UserPayload) -> Self {
        Self {
            id: user.id,
            email: user.email.unwrap_or_default(),
            metadata: user.user_metadata.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: UserPayload,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(now + chrono::Duration::seconds(secs)),
            (None, None) => None,
        };
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: self.user.into(),
        }
    }
}

/// Parse a token grant response body into a session.
pub(crate) fn parse_token_response(body: &str, now: DateTime<Utc>) -> Result<Session, AuthError> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::InvalidResponse(format!("token response: {}", e)))?;
    Ok(response.into_session(now))
}

/// Parse a sign-up response: either a full token response or a bare user
/// (confirmation pending), possibly wrapped in `{"user": ...}`.
pub(crate) fn parse_sign_up_response(body: &str, now: DateTime<Utc>) -> Result<SignUp, AuthError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AuthError::InvalidResponse(format!("sign-up response: {}", e)))?;

    if value.get("access_token").is_some() {
        let session = serde_json::from_value::<TokenResponse>(value)
            .map_err(|e| AuthError::InvalidResponse(format!("sign-up response: {}", e)))?
            .into_session(now);
        return Ok(SignUp {
            identity: session.user.clone(),
            session: Some(session),
        });
    }

    let user = value.get("user").cloned().unwrap_or(value);
    let user: UserPayload = serde_json::from_value(user)
        .map_err(|e| AuthError::InvalidResponse(format!("sign-up user: {}", e)))?;
    Ok(SignUp {
        identity: user.into(),
        session: None,
    })
}

/// Normalize a backend error body into [`AuthError::Rejected`].
pub(crate) fn parse_error(status: StatusCode, body: &str) -> AuthError {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let field = |keys: &[&str]| {
        keys.iter().find_map(|key| match value.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    };

    let code = field(&["error_code", "code", "error"]).unwrap_or_else(|| status.as_u16().to_string());
    let message = field(&["error_description", "msg", "message", "error"]).unwrap_or_else(|| {
        if body.trim().is_empty() {
            status.to_string()
        } else {
            body.trim().to_string()
        }
    });

    AuthError::Rejected { code, message }
}

/// GoTrue-style identity client.
pub struct HttpIdentityClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: ArcSwapOption<Session>,
    bearer: BearerToken,
    subscribers: Subscribers,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl HttpIdentityClient {
    pub fn from_config(config: &BackendConfig, bearer: BearerToken) -> Result<Self, AuthError> {
        let (url, key) = config.connection().ok_or_else(|| {
            AuthError::BackendUnavailable("backend url or anon key not configured".to_string())
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("agri-session/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::BackendUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: url.to_string(),
            anon_key: key.to_string(),
            session: ArcSwapOption::empty(),
            bearer,
            subscribers: Subscribers::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Currently held session, without any network round-trip.
    pub fn current_session(&self) -> Option<Session> {
        self.session.load_full().map(|s| s.as_ref().clone())
    }

    fn store_session(&self, session: Option<Session>) {
        self.bearer
            .set(session.as_ref().map(|s| s.access_token.clone()));
        self.session.store(session.map(Arc::new));
    }

    async fn post(&self, path: &str, bearer: Option<&str>, body: &Value) -> Result<String, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let bearer = bearer.unwrap_or(&self.anon_key);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(parse_error(status, &text));
        }
        Ok(text)
    }

    /// Exchange the refresh token for a new session.
    ///
    /// A rejected refresh ends the session and emits `SIGNED_OUT`; transport
    /// failures leave the current session in place.
    pub async fn refresh_session(&self) -> Result<Option<Session>, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let Some(current) = self.session.load_full() else {
            return Ok(None);
        };

        let body = json!({ "refresh_token": current.refresh_token });
        match self
            .post("/auth/v1/token?grant_type=refresh_token", None, &body)
            .await
        {
            Ok(text) => {
                let session = parse_token_response(&text, Utc::now())?;
                tracing::debug!(user_id = %session.user.id, "Access token refreshed");
                self.store_session(Some(session.clone()));
                self.subscribers.emit(SessionEvent::new(
                    SessionEventKind::TokenRefreshed,
                    Some(session.clone()),
                ));
                Ok(Some(session))
            }
            Err(e @ AuthError::Rejected { .. }) => {
                tracing::warn!(
                    user_id = %current.user.id,
                    code = e.code(),
                    "Refresh token rejected, ending session"
                );
                self.store_session(None);
                self.subscribers
                    .emit(SessionEvent::new(SessionEventKind::SignedOut, None));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Periodically refresh the session shortly before it expires.
    ///
    /// The task holds only a weak reference and ends once the client is dropped.
    pub fn spawn_auto_refresh(
        client: &Arc<Self>,
        check_interval: std::time::Duration,
        margin: std::time::Duration,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, token auto-refresh disabled");
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(client);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    break;
                };
                let due = client
                    .session
                    .load_full()
                    .is_some_and(|s| s.expires_within(Utc::now(), margin));
                if due {
                    if let Err(e) = client.refresh_session().await {
                        tracing::warn!(code = e.code(), error = %e, "Token auto-refresh failed");
                    }
                }
            }
            tracing::debug!("Token auto-refresh task stopped");
        });
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        let expired = self
            .session
            .load_full()
            .is_some_and(|s| s.expires_within(Utc::now(), std::time::Duration::ZERO));
        if expired {
            return self.refresh_session().await;
        }
        Ok(self.current_session())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(AuthIdentity, Session), AuthError> {
        let body = json!({ "email": email, "password": password });
        let text = self
            .post("/auth/v1/token?grant_type=password", None, &body)
            .await?;
        let session = parse_token_response(&text, Utc::now())?;

        tracing::info!(user_id = %session.user.id, "Signed in");
        self.store_session(Some(session.clone()));
        self.subscribers.emit(SessionEvent::new(
            SessionEventKind::SignedIn,
            Some(session.clone()),
        ));
        Ok((session.user.clone(), session))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Metadata,
    ) -> Result<SignUp, AuthError> {
        let body = json!({ "email": email, "password": password, "data": metadata });
        let text = self.post("/auth/v1/signup", None, &body).await?;
        let sign_up = parse_sign_up_response(&text, Utc::now())?;

        match &sign_up.session {
            Some(session) => {
                tracing::info!(user_id = %sign_up.identity.id, "Signed up");
                self.store_session(Some(session.clone()));
                self.subscribers.emit(SessionEvent::new(
                    SessionEventKind::SignedIn,
                    Some(session.clone()),
                ));
            }
            None => {
                tracing::info!(user_id = %sign_up.identity.id, "Signed up, confirmation pending");
            }
        }
        Ok(sign_up)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let current = self.session.load_full();
        let result = match &current {
            Some(session) => self
                .post("/auth/v1/logout", Some(session.access_token.as_str()), &json!({}))
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        // Local state is cleared even when revocation fails
        self.store_session(None);
        self.subscribers
            .emit(SessionEvent::new(SessionEventKind::SignedOut, None));
        result
    }

    fn subscribe(&self) -> Subscription {
        let initial = SessionEvent::new(SessionEventKind::Initial, self.current_session());
        self.subscribers.subscribe(Some(initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> BackendConfig {
        BackendConfig {
            url: Some("https://backend.example.com/".to_string()),
            anon_key: Some("anon".to_string()),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_connector_requires_connection_parameters() {
        let connector = HttpConnector::new(BackendConfig::default(), BearerToken::new());
        let result = connector.connect();
        assert!(matches!(result, Err(AuthError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connector_builds_client_when_configured() {
        let mut config = configured();
        config.auto_refresh = false;
        let connector = HttpConnector::new(config, BearerToken::new());
        let client = connector.connect().unwrap();
        assert_eq!(client.get_session().await, Ok(None));
    }

    #[test]
    fn test_parse_token_response_with_expires_in() {
        let now = Utc::now();
        let body = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "token_type": "bearer",
            "expires_in": 3600,
            "user": {"id": "u1", "email": "grower@example.com", "user_metadata": {"full_name": "Ana"}}
        }"#;
        let session = parse_token_response(body, now).unwrap();
        assert_eq!(session.user.id, "u1");
        assert_eq!(session.user.display_name(), "Ana");
        assert_eq!(session.expires_at, Some(now + chrono::Duration::seconds(3600)));
    }

    #[test]
    fn test_parse_token_response_prefers_absolute_expiry() {
        let body = r#"{
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "expires_at": 1700000000,
            "user": {"id": "u1"}
        }"#;
        let session = parse_token_response(body, Utc::now()).unwrap();
        assert_eq!(session.expires_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(session.token_type, "bearer");
        assert_eq!(session.user.email, "");
    }

    #[test]
    fn test_parse_sign_up_pending_confirmation() {
        let body = r#"{"id": "u9", "email": "new@example.com", "user_metadata": {}}"#;
        let sign_up = parse_sign_up_response(body, Utc::now()).unwrap();
        assert_eq!(sign_up.identity.id, "u9");
        assert!(sign_up.session.is_none());

        let wrapped = r#"{"user": {"id": "u10", "email": "w@example.com"}, "session": null}"#;
        let sign_up = parse_sign_up_response(wrapped, Utc::now()).unwrap();
        assert_eq!(sign_up.identity.id, "u10");
    }

    #[test]
    fn test_parse_sign_up_with_session() {
        let body = r#"{
            "access_token": "at", "refresh_token": "rt", "expires_in": 60,
            "user": {"id": "u3", "email": "s@example.com"}
        }"#;
        let sign_up = parse_sign_up_response(body, Utc::now()).unwrap();
        assert_eq!(sign_up.session.unwrap().user.id, "u3");
    }

    #[test]
    fn test_parse_error_shapes() {
        let err = parse_error(
            StatusCode::BAD_REQUEST,
            r#"{"error": "invalid_grant", "error_description": "Invalid login credentials"}"#,
        );
        assert_eq!(
            err,
            AuthError::Rejected {
                code: "invalid_grant".to_string(),
                message: "Invalid login credentials".to_string()
            }
        );

        let err = parse_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"code": 422, "error_code": "user_already_exists", "msg": "User already registered"}"#,
        );
        assert_eq!(err.code(), "user_already_exists");

        let err = parse_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.code(), "502");
    }

    #[test]
    fn test_bearer_token_shared_between_clones() {
        let bearer = BearerToken::new();
        let shared = bearer.clone();
        bearer.set(Some("token".to_string()));
        assert_eq!(shared.get().as_deref().map(String::as_str), Some("token"));
        bearer.set(None);
        assert!(shared.get().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_seeds_initial_event() {
        let client = HttpIdentityClient::from_config(&configured(), BearerToken::new()).unwrap();
        let mut subscription = client.subscribe();
        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind, SessionEventKind::Initial);
        assert!(event.session.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_without_session_clears_and_emits() {
        let bearer = BearerToken::new();
        let client = HttpIdentityClient::from_config(&configured(), bearer.clone()).unwrap();
        let mut subscription = client.subscribe();
        let _ = subscription.recv().await;

        bearer.set(Some("stale".to_string()));
        assert_eq!(client.sign_out().await, Ok(()));
        assert!(bearer.get().is_none());
        assert_eq!(
            subscription.recv().await.unwrap().kind,
            SessionEventKind::SignedOut
        );
    }
}
