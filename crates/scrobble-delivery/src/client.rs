//! Upstream tracking API client.
//!
//! [`TrackerApi`] is the seam the engine and token manager depend on;
//! [`TraktClient`] implements it over HTTP. Failed calls come back as
//! [`DeliveryError`] values carrying the HTTP status and the upstream's
//! `error` / `error_description` body fields so callers can classify them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, RequestBuilder, Response};
use scrobble_core::{MediaItem, MediaKind, PlaybackEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

const API_VERSION: &str = "2";

/// Default upstream base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.trakt.tv";

/// Token pair issued by the upstream OAuth endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// New access token
    pub access_token: String,
    /// New refresh token
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Successful scrobble submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrobbleReceipt {
    /// HTTP status returned by the upstream
    pub status_code: u16,
    /// Upstream history id, when returned
    pub id: Option<u64>,
}

/// Operations against the upstream tracking service.
#[async_trait]
pub trait TrackerApi: Send + Sync + 'static {
    /// Exchanges an authorization code for a token pair.
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    /// Exchanges a refresh token for a new token pair.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Fetches the account's display name.
    async fn display_name(&self, access_token: &str) -> Result<Option<String>>;

    /// Submits a playback event.
    async fn scrobble(&self, access_token: &str, event: &PlaybackEvent) -> Result<ScrobbleReceipt>;
}

/// Configuration for the upstream client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API base URL without trailing slash.
    pub base_url: String,
    /// OAuth client id, also sent as the API key.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Redirect URI registered with the upstream.
    pub redirect_uri: String,
    /// Timeout for token exchange and scrobble calls.
    pub timeout: Duration,
    /// Timeout for the display-name lookup.
    pub display_name_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            display_name_timeout: Duration::from_secs(5),
            user_agent: concat!("scrobble-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsBody {
    user: SettingsUser,
}

#[derive(Debug, Deserialize)]
struct SettingsUser {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleBody {
    id: Option<u64>,
}

/// HTTP implementation of [`TrackerApi`].
#[derive(Debug, Clone)]
pub struct TraktClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl TraktClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn with_api_headers(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("trakt-api-version", API_VERSION)
            .header("trakt-api-key", &self.config.client_id)
    }

    async fn send(&self, request: RequestBuilder, timeout: Duration) -> Result<Response> {
        let response = request.timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::timeout(timeout.as_secs())
            } else if e.is_connect() {
                DeliveryError::network(format!("connection failed: {e}"))
            } else {
                DeliveryError::network(e.to_string())
            }
        })?;

        if response.status().is_success() {
            return Ok(response);
        }
        Err(upstream_error(response).await)
    }

    async fn token_request(&self, grant: Value) -> Result<TokenGrant> {
        let mut body = json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "redirect_uri": self.config.redirect_uri,
        });
        if let (Some(body), Value::Object(grant)) = (body.as_object_mut(), grant) {
            body.extend(grant);
        }

        let request = self.client.post(self.url("/oauth/token")).json(&body);
        let response = self.send(request, self.config.timeout).await?;
        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| DeliveryError::internal(format!("malformed token response: {e}")))
    }
}

#[async_trait]
impl TrackerApi for TraktClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let span = info_span!("token_exchange", grant_type = "authorization_code");
        self.token_request(json!({ "code": code, "grant_type": "authorization_code" }))
            .instrument(span)
            .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let span = info_span!("token_exchange", grant_type = "refresh_token");
        self.token_request(json!({ "refresh_token": refresh_token, "grant_type": "refresh_token" }))
            .instrument(span)
            .await
    }

    async fn display_name(&self, access_token: &str) -> Result<Option<String>> {
        let request = self
            .with_api_headers(self.client.get(self.url("/users/settings")))
            .bearer_auth(access_token);

        let response = self.send(request, self.config.display_name_timeout).await?;
        let body: SettingsBody = response
            .json()
            .await
            .map_err(|e| DeliveryError::internal(format!("malformed settings response: {e}")))?;
        Ok(body.user.name.filter(|n| !n.trim().is_empty()))
    }

    async fn scrobble(&self, access_token: &str, event: &PlaybackEvent) -> Result<ScrobbleReceipt> {
        let span = info_span!(
            "scrobble",
            event_id = %event.event_id,
            action = %event.action,
            rating_key = %event.rating_key
        );

        async move {
            let request = self
                .with_api_headers(
                    self.client.post(self.url(&format!("/scrobble/{}", event.action.as_str()))),
                )
                .bearer_auth(access_token)
                .json(&scrobble_body(event));

            let response = self.send(request, self.config.timeout).await?;
            let status_code = response.status().as_u16();
            let id = response.json::<ScrobbleBody>().await.ok().and_then(|b| b.id);

            debug!(status = status_code, history_id = ?id, "scrobble accepted");
            Ok(ScrobbleReceipt { status_code, id })
        }
        .instrument(span)
        .await
    }
}

/// Builds the scrobble request body for an event.
pub fn scrobble_body(event: &PlaybackEvent) -> Value {
    let progress = (event.progress.clamp(0.0, 100.0) * 100.0).round() / 100.0;
    let media = &event.media;

    match media.kind {
        MediaKind::Episode => {
            let mut body = json!({
                "progress": progress,
                "episode": {
                    "title": media.title,
                    "season": media.season,
                    "number": media.number,
                    "ids": media.ids,
                },
            });
            if let (Some(show), Some(body)) = (&media.show, body.as_object_mut()) {
                body.insert(
                    "show".to_string(),
                    json!({ "title": show.title, "year": show.year, "ids": show.ids }),
                );
            }
            body
        },
        MediaKind::Movie => json!({ "progress": progress, "movie": movie_body(media) }),
    }
}

fn movie_body(media: &MediaItem) -> Value {
    json!({ "title": media.title, "year": media.year, "ids": media.ids })
}

async fn upstream_error(response: Response) -> DeliveryError {
    let status_code = response.status().as_u16();
    let retry_after_seconds = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(parse_retry_after);

    let body = response.text().await.unwrap_or_default();
    let (code, description) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (parsed.error, parsed.error_description),
        Err(_) => (None, None),
    };

    warn!(status = status_code, code = ?code, "upstream rejected request");
    DeliveryError::Upstream { status_code, code, description, retry_after_seconds }
}

/// Parses a Retry-After header value into seconds.
///
/// Accepts delta-seconds and HTTP-date forms; unparseable values fall back
/// to 60 seconds.
pub fn parse_retry_after(value: &str) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return seconds;
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(value) {
        let remaining = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return remaining.to_std().map(|d| d.as_secs()).unwrap_or(0);
    }

    DEFAULT_RETRY_AFTER
}
