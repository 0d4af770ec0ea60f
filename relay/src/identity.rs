//! User identity verification, delegated to an external identity provider.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Resolves an identity token to the user id it was issued for.
    async fn verify(&self, id_token: &str) -> Result<String>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenValidateRequest<'a> {
    id_token: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenValidateResponse {
    pub valid: bool,
    #[serde(default)]
    pub uid: Option<String>,
}

/// Asks the provider's validation endpoint about every token.
#[derive(Debug, Clone)]
pub struct HttpIdentityVerifier {
    client: Client,
    validate_url: String,
}

impl HttpIdentityVerifier {
    pub fn new(validate_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("cannot build identity client: {}", e)))?;
        Ok(Self::with_client(client, validate_url))
    }

    pub fn with_client(client: Client, validate_url: impl Into<String>) -> Self {
        Self {
            client,
            validate_url: validate_url.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, id_token: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.validate_url)
            .json(&TokenValidateRequest { id_token })
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "identity validate request failed");
                Error::IdentityProvider("identity provider unavailable".to_string())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "identity validate returned non-success");
            return Err(Error::Unauthenticated("Invalid token".to_string()));
        }

        let body = response
            .json::<TokenValidateResponse>()
            .await
            .map_err(|e| {
                error!(error = %e, "failed to decode identity validate response");
                Error::IdentityProvider("invalid identity provider response".to_string())
            })?;

        match (body.valid, body.uid) {
            (true, Some(uid)) if !uid.is_empty() => Ok(uid),
            (true, _) => Err(Error::IdentityProvider(
                "identity provider accepted the token without a uid".to_string(),
            )),
            (false, _) => Err(Error::Unauthenticated("Invalid token".to_string())),
        }
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| Error::Unauthenticated("Missing Authorization header".to_string()))?;
    let auth_str = auth_header
        .to_str()
        .map_err(|_| Error::Unauthenticated("Invalid Authorization header".to_string()))?;
    auth_str
        .strip_prefix("Bearer ")
        .or_else(|| auth_str.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Unauthenticated("Invalid bearer token".to_string()))
}
