//! Upstream engagement API
//!
//! [`EngagementSource`] is what the hydrator consumes. [`XrpcEngagementClient`]
//! implements it against an AT Protocol app view:
//!
//! - `com.atproto.server.createSession` to log in with handle + app password
//! - `app.bsky.feed.getPosts?uris=...` for like/reply/repost counts
//!
//! Sessions are kept behind the narrow [`CredentialStore`] interface so they
//! survive restarts without logging in again.

use super::score::Engagement;
use crate::store::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CREATE_SESSION: &str = "xrpc/com.atproto.server.createSession";
const GET_POSTS: &str = "xrpc/app.bsky.feed.getPosts";
const RATE_LIMIT_RESET_HEADER: &str = "ratelimit-reset";
const DEFAULT_RATE_LIMIT_PAUSE_SECS: i64 = 60;

/// Current engagement for one post
#[derive(Debug, Clone, PartialEq)]
pub struct PostEngagement {
    pub uri: String,
    pub engagement: Engagement,
    /// Canonical index time reported by the app view
    pub indexed_at: DateTime<Utc>,
    pub text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngagementError {
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential store error: {0}")]
    Credentials(#[from] StoreError),
}

#[async_trait]
pub trait EngagementSource: Send + Sync {
    async fn fetch_engagement(&self, uris: &[String]) -> Result<Vec<PostEngagement>, EngagementError>;
}

/// Persisted session token for the upstream API
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self) -> StoreResult<Option<String>>;

    async fn put(&self, token: &str) -> StoreResult<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    #[serde(default)]
    did: Option<String>,
}

#[derive(Deserialize)]
struct GetPostsResponse {
    posts: Vec<PostView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    #[serde(default)]
    like_count: Option<u64>,
    #[serde(default)]
    reply_count: Option<u64>,
    #[serde(default)]
    repost_count: Option<u64>,
    indexed_at: String,
    #[serde(default)]
    record: serde_json::Value,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
}

impl PostView {
    fn into_engagement(self) -> Option<PostEngagement> {
        let indexed_at = match DateTime::parse_from_rfc3339(&self.indexed_at) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(e) => {
                log::error!("❌ Bad indexedAt {:?} for {}: {}", self.indexed_at, self.uri, e);
                return None;
            }
        };
        let text = self
            .record
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string);

        Some(PostEngagement {
            engagement: Engagement {
                likes: self.like_count.unwrap_or(0),
                replies: self.reply_count.unwrap_or(0),
                reposts: self.repost_count.unwrap_or(0),
            },
            uri: self.uri,
            indexed_at,
            text,
        })
    }
}

/// Reset time from a 429 response: unix seconds in `ratelimit-reset`,
/// otherwise one minute from now
fn rate_limit_reset(headers: &reqwest::header::HeaderMap) -> DateTime<Utc> {
    headers
        .get(RATE_LIMIT_RESET_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(DEFAULT_RATE_LIMIT_PAUSE_SECS))
}

fn is_token_error(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::UNAUTHORIZED {
        return true;
    }
    if status != StatusCode::BAD_REQUEST {
        return false;
    }
    serde_json::from_str::<XrpcErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .is_some_and(|e| e == "ExpiredToken" || e == "InvalidToken")
}

pub struct XrpcEngagementClient {
    http: reqwest::Client,
    base_url: String,
    handle: String,
    password: String,
    credentials: Arc<dyn CredentialStore>,
    session: Mutex<Option<String>>,
}

impl XrpcEngagementClient {
    pub fn new(
        base_url: impl Into<String>,
        handle: impl Into<String>,
        password: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, EngagementError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            handle: handle.into(),
            password: password.into(),
            credentials,
            session: Mutex::new(None),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Create a fresh session and persist its token
    async fn login(&self) -> Result<String, EngagementError> {
        log::info!("🔑 Logging in as {}", self.handle);

        let response = self
            .http
            .post(self.endpoint(CREATE_SESSION))
            .json(&serde_json::json!({
                "identifier": self.handle,
                "password": self.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngagementError::RateLimited {
                reset_at: rate_limit_reset(response.headers()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngagementError::Auth(format!("{}: {}", status, body)));
        }

        let session: SessionResponse = response.json().await?;
        self.credentials.put(&session.access_jwt).await?;
        *self.session.lock().await = Some(session.access_jwt.clone());

        log::info!(
            "✅ Session created for {}",
            session.did.as_deref().unwrap_or(&self.handle)
        );
        Ok(session.access_jwt)
    }

    /// Cached token, else the persisted one, else a new login
    async fn token(&self) -> Result<String, EngagementError> {
        if let Some(token) = self.session.lock().await.clone() {
            return Ok(token);
        }
        if let Some(token) = self.credentials.get().await? {
            log::info!("🔑 Reusing stored session");
            *self.session.lock().await = Some(token.clone());
            return Ok(token);
        }
        self.login().await
    }

    async fn get_posts(
        &self,
        token: &str,
        uris: &[String],
    ) -> Result<Vec<PostEngagement>, EngagementError> {
        let query: Vec<(&str, &str)> = uris.iter().map(|uri| ("uris", uri.as_str())).collect();

        let response = self
            .http
            .get(self.endpoint(GET_POSTS))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngagementError::RateLimited {
                reset_at: rate_limit_reset(response.headers()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_token_error(status, &body) {
                return Err(EngagementError::Auth(body));
            }
            return Err(EngagementError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let page: GetPostsResponse = response.json().await?;
        Ok(page
            .posts
            .into_iter()
            .filter_map(PostView::into_engagement)
            .collect())
    }
}

#[async_trait]
impl EngagementSource for XrpcEngagementClient {
    async fn fetch_engagement(&self, uris: &[String]) -> Result<Vec<PostEngagement>, EngagementError> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let token = self.token().await?;
        match self.get_posts(&token, uris).await {
            Err(EngagementError::Auth(reason)) => {
                log::warn!("🔑 Session rejected ({}), logging in again", reason);
                *self.session.lock().await = None;
                let token = self.login().await?;
                self.get_posts(&token, uris).await
            }
            other => other,
        }
    }
}
