//! Azure AD authentication module
//!
//! OAuth2 client-credentials flow for service-principal (M2M) access to the
//! Dataverse Web API. Tokens are cached in-process and refreshed shortly
//! before expiry; concurrent refreshes collapse into a single request whose
//! outcome, token or failure, is shared by every waiting caller.

use crate::config::Credentials;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Refresh this long before the token actually expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Bound on the token-endpoint round trip
const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Authentication errors. Cloneable so a failed refresh can be re-raised
/// to every caller that shared the flight.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Token request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Token request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Token request failed: {0}")]
    Transport(String),

    #[error("Token parse error: {0}")]
    Parse(String),
}

/// Token response from Azure AD
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Cached token with expiry tracking
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        self.expires_at > Instant::now() + EXPIRY_MARGIN
    }
}

/// Single cached bearer token for the process, refreshed on demand.
///
/// The refresh path is single-flight: callers that find the cache expired
/// serialize on `refresh_flight`. The flight's outcome is published under
/// the lock (the cache on success, the failure slot otherwise), and the
/// generation counter lets a waiter tell a refresh that completed while it
/// waited from one that finished before it arrived, so N concurrent callers
/// produce one token call and all N see that call's result.
#[derive(Debug)]
pub struct TokenCache {
    credentials: Credentials,
    authority: String,
    timeout: Duration,
    http_client: Client,
    cache: RwLock<Option<CachedToken>>,
    refresh_flight: Mutex<Option<AuthError>>,
    refresh_generation: AtomicU64,
}

impl TokenCache {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            authority: DEFAULT_AUTHORITY.to_string(),
            timeout: TOKEN_TIMEOUT,
            http_client: Client::builder().timeout(TOKEN_TIMEOUT).build().unwrap(),
            cache: RwLock::new(None),
            refresh_flight: Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
        }
    }

    /// Override the Azure AD authority (sovereign clouds, tests)
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the token-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.http_client = Client::builder().timeout(timeout).build().unwrap();
        self
    }

    fn token_endpoint(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority, self.credentials.tenant_id
        )
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.credentials.host)
    }

    async fn cached_token(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|cached| cached.is_valid())
            .map(|cached| cached.access_token.clone())
    }

    /// Return a valid access token, refreshing if absent or near expiry.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_token().await {
            tracing::debug!("Using cached token");
            return Ok(token);
        }

        let observed_generation = self.refresh_generation.load(Ordering::Acquire);
        let mut flight = self.refresh_flight.lock().await;

        // A refresh may have completed while we waited on the lock:
        // on success the cache holds its token, on failure the flight slot
        // holds its error, and the generation moved past what we observed.
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }
        if self.refresh_generation.load(Ordering::Acquire) != observed_generation {
            if let Some(ref failure) = *flight {
                return Err(failure.clone());
            }
        }

        tracing::info!("Acquiring new access token for {}", self.credentials.host);
        let result = self.acquire_token().await;
        self.refresh_generation.fetch_add(1, Ordering::Release);
        *flight = result.as_ref().err().cloned();
        result
    }

    /// Drop the cached token so the next `get_token` refreshes.
    /// Called by the request layer after a 401.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    async fn acquire_token(&self) -> Result<String, AuthError> {
        let scope = self.scope();
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", &self.credentials.client_id),
            ("client_secret", &self.credentials.client_secret),
            ("scope", &scope),
        ];

        let response = self
            .http_client
            .post(self.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout(self.timeout)
                } else {
                    AuthError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Token request failed: {} - {}", status, body);
            return Err(AuthError::Rejected { status, body });
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Parse(format!("Failed to parse token response: {}", e)))?;

        let cached = CachedToken {
            access_token: token_response.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token_response.expires_in),
        };

        {
            let mut cache = self.cache.write().await;
            *cache = Some(cached);
        }

        tracing::info!(
            "Token acquired, expires in {} seconds",
            token_response.expires_in
        );

        Ok(token_response.access_token)
    }
}
