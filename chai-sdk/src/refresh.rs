//! HTTP token refresh against the chat API.
//!
//! `POST {api}/auth/refresh` with the current access token in the
//! `Authorization` header and `{ user_id, refresh_token }` as the body. The API
//! answers in snake_case; camelCase keys are accepted too.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialPair, TokenRefresher};
use crate::error::CredentialError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRefresher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRefresher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/auth/refresh", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    username: Option<String>,
    #[serde(alias = "jwt")]
    token: String,
    #[serde(alias = "expiryEpoch")]
    expiry_epoch: i64,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "refreshTokenExpiryEpoch")]
    refresh_token_expiry_epoch: Option<i64>,
    #[serde(alias = "webSocketToken")]
    web_socket_token: String,
    #[serde(alias = "webSocketTokenExpiryEpoch")]
    web_socket_token_expiry_epoch: i64,
}

impl RefreshResponse {
    /// Fields the API leaves out keep their current values.
    fn merge_into(self, current: &CredentialPair) -> CredentialPair {
        CredentialPair {
            id: self.id.unwrap_or(current.id),
            username: self.username.unwrap_or_else(|| current.username.clone()),
            jwt: self.token,
            expiry_epoch: self.expiry_epoch,
            refresh_token: self.refresh_token.or_else(|| current.refresh_token.clone()),
            refresh_token_expiry_epoch: self
                .refresh_token_expiry_epoch
                .or(current.refresh_token_expiry_epoch),
            web_socket_token: self.web_socket_token,
            web_socket_token_expiry_epoch: self.web_socket_token_expiry_epoch,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self, current: &CredentialPair) -> Result<CredentialPair, CredentialError> {
        let url = self.url();
        tracing::debug!(%url, user_id = current.id, "Requesting token refresh");

        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, current.jwt.as_str())
            .json(&RefreshRequest {
                user_id: current.id,
                refresh_token: current.refresh_token.as_deref(),
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        if !is_json {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialError::NotJson(body));
        }

        let body: RefreshResponse = resp.json().await?;
        Ok(body.merge_into(current))
    }
}
