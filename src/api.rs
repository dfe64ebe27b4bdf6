//! REST client for the notifications resource.
//!
//! Every call presents the current credential as a bearer token. HTTP
//! 401/403 map to [`ApiError::Unauthorized`] so the sync core can treat
//! them the same as a rejected channel handshake.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::keyring::Credential;
use crate::notification::{Notification, NotificationId};

/// REST failure categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Server rejected the credential (HTTP 401/403).
    Unauthorized(u16),
    /// Any other non-success status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        message: String,
    },
    /// Network failure or timeout.
    Transport(String),
    /// Body did not match the expected shape.
    Decode(String),
}

impl ApiError {
    /// `true` when the credential itself was rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(status) => write!(f, "Credential rejected (HTTP {status})"),
            Self::Status { status, message } if message.is_empty() => {
                write!(f, "Server returned HTTP {status}")
            }
            Self::Status { status, message } => {
                write!(f, "Server returned HTTP {status}: {message}")
            }
            Self::Transport(msg) => write!(f, "Request failed: {msg}"),
            Self::Decode(msg) => write!(f, "Unexpected response: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Authoritative server view used by a full refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSnapshot {
    /// First page, newest first.
    pub notifications: Vec<Notification>,
    /// Server unread count.
    pub unread_count: u32,
}

/// Notification REST operations.
#[async_trait]
pub trait NotificationsApi: Send + Sync {
    /// One page of notifications, newest first. Pages start at 1.
    async fn fetch_page(
        &self,
        credential: &Credential,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Notification>, ApiError>;

    /// Server unread count.
    async fn unread_count(&self, credential: &Credential) -> Result<u32, ApiError>;

    /// Mark one notification read.
    async fn mark_read(&self, credential: &Credential, id: NotificationId) -> Result<(), ApiError>;

    /// Mark every notification read.
    async fn mark_all_read(&self, credential: &Credential) -> Result<(), ApiError>;

    /// Delete one notification.
    async fn delete(&self, credential: &Credential, id: NotificationId) -> Result<(), ApiError>;

    /// First page plus unread count.
    async fn refresh(&self, credential: &Credential, limit: u32) -> Result<RefreshSnapshot, ApiError> {
        let notifications = self.fetch_page(credential, 1, limit).await?;
        let unread_count = self.unread_count(credential).await?;
        Ok(RefreshSnapshot {
            notifications,
            unread_count,
        })
    }
}

#[derive(Deserialize)]
struct NotificationsPage {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Deserialize)]
struct UnreadCountResponse {
    unread_count: i64,
}

/// reqwest-backed [`NotificationsApi`].
#[derive(Debug, Clone)]
pub struct RestNotificationsApi {
    client: Client,
    server_url: String,
}

impl RestNotificationsApi {
    /// Client for `server_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, server_url))
    }

    /// Client with a pre-configured reqwest client.
    pub fn with_client(client: Client, server_url: &str) -> Self {
        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL requests are issued against.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        credential: &Credential,
    ) -> Result<reqwest::Response, ApiError> {
        let response = request
            .bearer_auth(credential.expose())
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl NotificationsApi for RestNotificationsApi {
    async fn fetch_page(
        &self,
        credential: &Credential,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Notification>, ApiError> {
        let request = self
            .client
            .get(self.url("/notifications"))
            .query(&[("page", page), ("limit", limit)]);
        let body: NotificationsPage = self
            .execute(request, credential)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        log::debug!(
            "[Notifications] Fetched page {page} ({} items)",
            body.notifications.len()
        );
        Ok(body.notifications)
    }

    async fn unread_count(&self, credential: &Credential) -> Result<u32, ApiError> {
        let request = self.client.get(self.url("/notifications/unread-count"));
        let body: UnreadCountResponse = self
            .execute(request, credential)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(u32::try_from(body.unread_count.max(0)).unwrap_or(u32::MAX))
    }

    async fn mark_read(&self, credential: &Credential, id: NotificationId) -> Result<(), ApiError> {
        let request = self.client.put(self.url(&format!("/notifications/{id}/read")));
        self.execute(request, credential).await?;
        Ok(())
    }

    async fn mark_all_read(&self, credential: &Credential) -> Result<(), ApiError> {
        let request = self.client.put(self.url("/notifications/read-all"));
        self.execute(request, credential).await?;
        Ok(())
    }

    async fn delete(&self, credential: &Credential, id: NotificationId) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("/notifications/{id}")));
        self.execute(request, credential).await?;
        Ok(())
    }
}
