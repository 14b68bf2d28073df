//! App-only authentication for Microsoft Graph
//!
//! The SharePoint backend authenticates as the application itself using the
//! OAuth2 client-credentials grant; no user session is involved. Tokens are
//! cached and reused until shortly before they expire.

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, EndpointNotSet, EndpointSet, Scope, TokenResponse, TokenUrl};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Scope granting the application's configured Graph permissions
pub const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Tokens are refreshed this long before they expire
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);

/// Client with only the token endpoint configured
pub type CredentialsClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Authentication failures
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token endpoint URL is malformed
    #[error("Invalid token URL: {0}")]
    InvalidTokenUrl(String),

    /// The token endpoint rejected the request or could not be reached
    #[error("Token request failed: {0}")]
    TokenRequest(String),
}

/// Errors from [`async_http_client`]
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request could not be sent or its body read
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// The response could not be rebuilt
    #[error(transparent)]
    Http(#[from] http::Error),
}

/// Supplies bearer tokens for Graph requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a currently valid access token
    async fn access_token(&self) -> Result<String, AuthError>;
}

/// A fixed token, for tests and pre-provisioned credentials
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps `token`
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

struct CachedToken {
    secret: String,
    refresh_at: Instant,
}

/// Holds one token and refreshes it on demand
///
/// The lock is held across a refresh so concurrent callers wait for a single
/// token request instead of issuing their own.
#[derive(Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token, or calls `fetch` when it is missing or stale
    ///
    /// `fetch` yields the token and its lifetime as reported by the issuer.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, AuthError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(String, Option<Duration>), AuthError>> + Send,
    {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.secret.clone());
            }
        }

        let (secret, lifetime) = fetch().await?;
        let lifetime = lifetime.unwrap_or(DEFAULT_LIFETIME);
        let refresh_at = Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN);

        debug!(lifetime_secs = lifetime.as_secs(), "graph auth: token refreshed");
        *slot = Some(CachedToken {
            secret: secret.clone(),
            refresh_at,
        });
        Ok(secret)
    }

    /// Drops the cached token
    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

/// Client-credentials token source for an Azure AD tenant
pub struct ClientCredentials {
    client: CredentialsClient,
    scope: String,
    cache: TokenCache,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Creates a token source for `tenant_id` at `authority_url`
    ///
    /// The token endpoint is `{authority_url}/{tenant_id}/oauth2/v2.0/token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidTokenUrl`] if the endpoint is malformed.
    pub fn new(
        authority_url: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, AuthError> {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            authority_url.trim_end_matches('/'),
            tenant_id
        );

        // oauth2 5.0 API: BasicClient::new() only takes ClientId
        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.to_string()))
            .set_token_uri(
                TokenUrl::new(token_url).map_err(|e| AuthError::InvalidTokenUrl(e.to_string()))?,
            );

        Ok(Self {
            client,
            scope: GRAPH_DEFAULT_SCOPE.to_string(),
            cache: TokenCache::new(),
        })
    }

    /// Requests a different scope than [`GRAPH_DEFAULT_SCOPE`]
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    async fn request_token(&self) -> Result<(String, Option<Duration>), AuthError> {
        let response = self
            .client
            .exchange_client_credentials()
            .add_scope(Scope::new(self.scope.clone()))
            .request_async(&async_http_client)
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;

        Ok((
            response.access_token().secret().clone(),
            response.expires_in(),
        ))
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.cache.get_or_refresh(|| self.request_token()).await
    }
}

/// Async HTTP client for the token exchange
///
/// Redirects are not followed. Request headers are forwarded and the
/// response body is fully buffered.
pub async fn async_http_client(
    request: oauth2::HttpRequest,
) -> Result<oauth2::HttpResponse, HttpClientError> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let method = request.method().clone();
    let url = request.uri().to_string();
    let headers = request.headers().clone();
    let body = request.into_body();

    let response = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status_code = response.status();
    let headers = response.headers().to_owned();
    let body = response.bytes().await?.to_vec();

    let mut builder = http::Response::builder().status(status_code);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    Ok(builder.body(body)?)
}
