//! PostgREST-style client for the profiles table.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use super::{ProfileError, ProfileLookup, ProfileRecord, ProfileStore, ProfileUpdate};
use crate::config::{BackendConfig, ProfilesConfig};
use crate::identity::{AuthIdentity, BearerToken};

/// Error code the row API uses for "single object requested, zero rows found"
const NO_ROWS_CODE: &str = "PGRST116";

/// Accept header asking for a single object instead of an array
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Row-store client reading and writing `profiles` over REST.
pub struct RestProfileStore {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    table: String,
    bearer: BearerToken,
}

impl RestProfileStore {
    /// Returns `None` when the backend connection parameters are missing.
    pub fn from_config(
        backend: &BackendConfig,
        profiles: &ProfilesConfig,
        bearer: BearerToken,
    ) -> Option<Self> {
        let (url, key) = backend.connection()?;
        let http = reqwest::Client::builder()
            .timeout(backend.request_timeout())
            .user_agent(concat!("agri-session/", env!("CARGO_PKG_VERSION")))
            .build()
            .ok()?;
        Some(Self {
            http,
            base_url: url.to_string(),
            anon_key: key.to_string(),
            table: profiles.table.clone(),
            bearer,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .bearer
            .get()
            .map(|t| t.as_ref().clone())
            .unwrap_or_else(|| self.anon_key.clone());
        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String), ProfileError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ProfileError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProfileError::Network(e.to_string()))?;
        Ok((status, body))
    }
}

/// Normalize a row API error body.
pub(crate) fn parse_store_error(status: StatusCode, body: &str) -> ProfileError {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    ProfileError::Store {
        code: text("code").unwrap_or_else(|| status.as_u16().to_string()),
        message: text("message")
            .or_else(|| text("details"))
            .unwrap_or_else(|| status.to_string()),
    }
}

/// Interpret the response to a single-row profile read.
pub(crate) fn parse_fetch_response(status: StatusCode, body: &str) -> Result<ProfileLookup, ProfileError> {
    let trimmed = body.trim();

    if status.is_success() {
        if trimmed.is_empty() || trimmed == "null" || trimmed == "[]" {
            return Ok(ProfileLookup::Empty);
        }
        let record: ProfileRecord = serde_json::from_str(trimmed)
            .map_err(|e| ProfileError::InvalidResponse(e.to_string()))?;
        return Ok(ProfileLookup::Found(record));
    }

    let value: Value = serde_json::from_str(trimmed).unwrap_or(Value::Null);
    if value.get("code").and_then(Value::as_str) == Some(NO_ROWS_CODE) {
        return Ok(ProfileLookup::Missing);
    }
    // An error object with no content carries no diagnosis; treat as no row
    if value.as_object().is_some_and(|o| o.is_empty()) {
        return Ok(ProfileLookup::Empty);
    }
    Err(parse_store_error(status, trimmed))
}

#[async_trait]
impl ProfileStore for RestProfileStore {
    async fn fetch(&self, user_id: &str) -> Result<ProfileLookup, ProfileError> {
        let request = self
            .http
            .get(self.table_url())
            .query(&[("id", format!("eq.{}", user_id)), ("select", "*".to_string())])
            .header("Accept", SINGLE_OBJECT);
        let (status, body) = self.send(request).await?;
        parse_fetch_response(status, &body)
    }

    async fn create_default(&self, identity: &AuthIdentity) -> Result<ProfileRecord, ProfileError> {
        let record = ProfileRecord::default_for(identity, Utc::now());
        let request = self
            .http
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .header("Accept", SINGLE_OBJECT)
            .json(&record);
        let (status, body) = self.send(request).await?;

        if !status.is_success() {
            return Err(parse_store_error(status, &body));
        }
        if body.trim().is_empty() {
            // Insert accepted without representation; the row is what we sent
            return Ok(record);
        }
        serde_json::from_str(&body).map_err(|e| ProfileError::InvalidResponse(e.to_string()))
    }

    async fn update(&self, user_id: &str, fields: &ProfileUpdate) -> Result<(), ProfileError> {
        let mut row = serde_json::to_value(fields)
            .map_err(|e| ProfileError::InvalidResponse(e.to_string()))?;
        if let Some(object) = row.as_object_mut() {
            object.insert("id".to_string(), Value::String(user_id.to_string()));
            object.insert("updated_at".to_string(), serde_json::json!(Utc::now()));
        }

        let request = self
            .http
            .post(self.table_url())
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&row);
        let (status, body) = self.send(request).await?;

        if !status.is_success() {
            return Err(parse_store_error(status, &body));
        }
        Ok(())
    }
}
