// sync/client.rs - HTTP transport for the sync protocol

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

use super::wire::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Thin wrapper around `reqwest` that knows how to reach the two sync
/// endpoints with a bearer token and the right timeout for each.
#[derive(Clone)]
pub struct SyncClient {
    base_url: String,
    access_token: Option<String>,
    http: reqwest::Client,
}

impl SyncClient {
    /// `sync_timeout` applies to every call this client makes — push and
    /// pull are the only two endpoints it speaks.
    pub fn new(base_url: impl Into<String>, sync_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(sync_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
            http,
        })
    }

    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = Some(token.into());
    }

    pub async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.post("/sync/push", request).await
    }

    pub async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.post("/sync/pull", request).await
    }

    async fn post<T: Serialize, R: DeserializeOwned>(&self, endpoint: &str, body: &T) -> Result<R> {
        let url = format!("{}{}", self.base_url, endpoint);
        let headers = self.build_headers()?;

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{endpoint} timed out: {e}"))
                } else {
                    Error::Network(format!("{endpoint} request failed: {e}"))
                }
            })?;

        self.handle_response(response).await
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| Error::Unauthorized("no access token available".to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::Unauthorized(format!("invalid access token: {e}")))?;
        headers.insert(AUTHORIZATION, value);

        Ok(headers)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(match status.as_u16() {
                401 | 403 => Error::Unauthorized(format!("{status}: {body}")),
                404 => Error::NotFound(body),
                _ => Error::Server(format!("{status}: {body}")),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Server(format!("failed to parse response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_has_no_access_token() {
        let client = SyncClient::new("https://sync.example.com", Duration::from_secs(30)).unwrap();
        assert!(client.access_token.is_none());
        assert_eq!(client.base_url, "https://sync.example.com");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = SyncClient::new("https://sync.example.com/", Duration::from_secs(30)).unwrap();
        assert_eq!(client.base_url, "https://sync.example.com");
    }
}
