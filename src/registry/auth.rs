//! Bearer-token authentication against distribution registries
//!
//! Handles the `WWW-Authenticate: Bearer` challenge flow: parse the challenge,
//! request a token from the realm with repository scope, and cache nothing
//! beyond the returned token (callers hold it per session).

use crate::error::{Result, SarError};
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug)]
struct AuthChallenge {
    realm: String,
    service: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Optional username/password credentials
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

/// Token fetcher bound to one registry endpoint
#[derive(Debug, Clone)]
pub struct TokenAuth {
    client: Client,
    endpoint: String,
    credentials: Credentials,
}

impl TokenAuth {
    pub fn new(client: Client, endpoint: String, credentials: Credentials) -> Self {
        Self {
            client,
            endpoint,
            credentials,
        }
    }

    /// Obtain a token scoped to `repository`, or `None` when the registry
    /// does not challenge.
    pub async fn token_for(&self, repository: &str, push: bool) -> Result<Option<String>> {
        let probe = format!("{}/v2/", self.endpoint);
        let response = self
            .client
            .get(&probe)
            .send()
            .await
            .map_err(|e| SarError::Io(format!("registry probe failed: {}", e)))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let header = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !header.starts_with("Bearer ") {
            // Basic or no auth; credentials go straight on each request.
            return Ok(None);
        }

        let challenge = parse_challenge(&header)?;
        let scope = if push {
            format!("repository:{}:push,pull", repository)
        } else {
            format!("repository:{}:pull", repository)
        };
        let token_url = format!(
            "{}?service={}&scope={}",
            challenge.realm, challenge.service, scope
        );
        self.request_token(&token_url).await.map(Some)
    }

    async fn request_token(&self, token_url: &str) -> Result<String> {
        let mut request = self.client.get(token_url);
        if let (Some(user), Some(pass)) = (&self.credentials.username, &self.credentials.password) {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| SarError::Io(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SarError::Unauthorized(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SarError::Unauthorized(format!("token response unreadable: {}", e)))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| SarError::Unauthorized("no token in auth response".to_string()))
    }
}

/// Parse `Bearer realm="...",service="..."`
fn parse_challenge(header: &str) -> Result<AuthChallenge> {
    let params = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| SarError::Unauthorized("not a Bearer challenge".to_string()))?;

    let mut realm = String::new();
    let mut service = String::new();
    for param in params.split(',') {
        if let Some((key, value)) = param.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = value.to_string(),
                "service" => service = value.to_string(),
                _ => {}
            }
        }
    }
    if realm.is_empty() || service.is_empty() {
        return Err(SarError::Unauthorized(format!(
            "malformed auth challenge: {}",
            header
        )));
    }
    Ok(AuthChallenge { realm, service })
}
