//! JSON over HTTP remote client.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET /health`
//! - `GET /v1/sync/{collection}?since=&sinceId=&limit=`
//! - `POST /v1/sync/{collection}/push`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{PushItem, PushOutcome, RemoteClient, RemoteError, RemoteResult, RemoteRow};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{EntityType, SyncCursor};
use crate::util::{compact_text, is_http_url, normalize_base_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpRemoteClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteClient")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl HttpRemoteClient {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .ok_or_else(|| Error::Config("remote URL must not be empty".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "remote URL must include http:// or https://".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: normalize_base_url(&base_url),
            auth_token: normalize_text_option(auth_token),
            client,
        })
    }

    /// Client for the configured remote, if any
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>> {
        config
            .remote_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.auth_token.clone(), config.request_timeout()))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/v1/sync/{}", self.base_url, entity_type.as_str())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RemoteResult<reqwest::Response> {
        let response = self.authorize(request).send().await.map_err(map_transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Server {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    rows: Vec<RemoteRow>,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    records: &'a [PushItem],
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    results: Vec<PushOutcome>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn probe(&self) -> RemoteResult<()> {
        self.send(self.client.get(format!("{}/health", self.base_url)))
            .await
            .map(|_| ())
    }

    async fn pull(
        &self,
        entity_type: EntityType,
        cursor: &SyncCursor,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        let mut query = vec![
            ("since", cursor.updated_at.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(last_id) = &cursor.last_id {
            query.push(("sinceId", last_id.to_string()));
        }

        let response = self
            .send(self.client.get(self.collection_url(entity_type)).query(&query))
            .await?;
        let page = response
            .json::<PullResponse>()
            .await
            .map_err(|error| RemoteError::Protocol(error.to_string()))?;
        Ok(page.rows)
    }

    async fn push(
        &self,
        entity_type: EntityType,
        batch: &[PushItem],
    ) -> RemoteResult<Vec<PushOutcome>> {
        let url = format!("{}/push", self.collection_url(entity_type));
        let response = self
            .send(self.client.post(url).json(&PushRequest { records: batch }))
            .await?;
        let body = response
            .json::<PushResponse>()
            .await
            .map_err(|error| RemoteError::Protocol(error.to_string()))?;
        Ok(body.results)
    }
}

fn map_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_decode() {
        RemoteError::Protocol(error.to_string())
    } else {
        RemoteError::Network(error.to_string())
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .map_or_else(|| format!("HTTP {}", status.as_u16()), str::to_string)
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_urls() {
        let timeout = Duration::from_secs(1);
        assert!(HttpRemoteClient::new("", None, timeout).is_err());
        assert!(HttpRemoteClient::new("sync.example.com", None, timeout).is_err());
    }

    #[test]
    fn collection_urls() {
        let client =
            HttpRemoteClient::new("https://sync.example.com/", None, Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.base_url(), "https://sync.example.com");
        assert_eq!(
            client.collection_url(EntityType::HabitCompletions),
            "https://sync.example.com/v1/sync/habit_completions"
        );
    }

    #[test]
    fn from_config_without_remote_is_none() {
        assert!(HttpRemoteClient::from_config(&SyncConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let client = HttpRemoteClient::new(
            "https://sync.example.com",
            Some("secret".to_string()),
            Duration::from_secs(1),
        )
        .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, r#"{"message":"bad cursor"}"#),
            "bad cursor"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "upstream down"),
            "upstream down"
        );
        assert_eq!(
            parse_api_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            "Service Unavailable"
        );
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_network_error() {
        // Nothing listens on the discard port of the loopback interface
        let client =
            HttpRemoteClient::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        assert!(client.probe().await.unwrap_err().is_network());
    }
}
