//! Client-credentials token acquisition for Microsoft Graph.

use crate::config::AuthConfig;
use crate::utils::{MigratorError, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tokens are renewed this long before they expire, or halfway through
/// their lifetime when that is shorter
pub const REFRESH_MARGIN: Duration = Duration::from_secs(600);

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
    refresh_at: Instant,
}

impl CachedToken {
    fn new(access_token: String, issued_at: Instant, lifetime: Duration) -> Self {
        let margin = REFRESH_MARGIN.min(lifetime / 2);
        Self {
            access_token,
            expires_at: issued_at + lifetime,
            refresh_at: issued_at + lifetime - margin,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

/// Caches one app-only bearer token and refreshes it ahead of expiry.
///
/// Failures are returned as [`MigratorError::Authentication`] and are not
/// retried here.
pub struct GraphAuthenticator {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl GraphAuthenticator {
    pub fn new(http: reqwest::Client, auth: &AuthConfig) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                auth.authority_host.trim_end_matches('/'),
                auth.tenant_id
            ),
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            cached: Mutex::new(None),
        }
    }

    /// Authenticator that already holds `token`
    #[cfg(test)]
    pub(crate) fn with_token(http: reqwest::Client, token: &str) -> Self {
        let authenticator = Self::new(http, &AuthConfig::default());
        *authenticator.cached.try_lock().expect("fresh mutex") = Some(CachedToken::new(
            token.to_string(),
            Instant::now(),
            Duration::from_secs(3600),
        ));
        authenticator
    }

    /// Current bearer token, acquiring a new one when needed
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.access_token.clone());
            }
            debug!(
                "Access token expires in {}s, refreshing",
                token.expires_at.saturating_duration_since(Instant::now()).as_secs()
            );
        }

        let token = self.request_token().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn request_token(&self) -> Result<CachedToken> {
        let requested_at = Instant::now();
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| MigratorError::Authentication(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MigratorError::Authentication(format!("token response unreadable: {}", e)))?;

        let token = parse_token_response(&body, requested_at).map_err(|reason| {
            MigratorError::Authentication(format!("HTTP {}: {}", status.as_u16(), reason))
        })?;

        info!("Acquired Graph access token");
        Ok(token)
    }
}

fn parse_token_response(body: &str, requested_at: Instant) -> std::result::Result<CachedToken, String> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| format!("malformed token response: {}", e))?;

    match parsed.access_token {
        Some(access_token) => Ok(CachedToken::new(
            access_token,
            requested_at,
            Duration::from_secs(parsed.expires_in.unwrap_or(3600)),
        )),
        None => Err(parsed
            .error_description
            .or(parsed.error)
            .unwrap_or_else(|| "no access_token in response".to_string())),
    }
}
