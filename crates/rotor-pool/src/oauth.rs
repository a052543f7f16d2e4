//! OAuth refresh-token grant.

use async_trait::async_trait;
use rotor_common::{GatewayError, GatewayResult};
use serde::Deserialize;

use crate::credential::Family;

/// Seam the pool refreshes tokens through; the real implementation talks
/// to the OAuth endpoint, tests substitute a stub.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self, family: Family, refresh_token: &str) -> GatewayResult<TokenGrant>;
}

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: i64,
}

pub struct TokenRefresher {
    client: wreq::Client,
    endpoint: String,
}

impl TokenRefresher {
    pub fn new() -> GatewayResult<Self> {
        Self::with_endpoint(TOKEN_ENDPOINT)
    }

    /// Test hook: point the grant at a local server.
    pub fn with_endpoint(endpoint: impl Into<String>) -> GatewayResult<Self> {
        let client = wreq::Client::builder()
            .build()
            .map_err(|err| GatewayError::Config(format!("building oauth client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn refresh_grant(&self, family: Family, refresh_token: &str) -> GatewayResult<TokenGrant> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("User-Agent", family.user_agent())
            .form(&[
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamTransient {
                status: None,
                message: format!("token refresh request failed: {err}"),
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamAuth {
                status,
                message: format!("token refresh rejected: {body}"),
            });
        }
        response
            .json::<TokenGrant>()
            .await
            .map_err(|err| GatewayError::UpstreamTransient {
                status: None,
                message: format!("token refresh response unreadable: {err}"),
            })
    }
}

#[async_trait]
impl TokenSource for TokenRefresher {
    async fn refresh(&self, family: Family, refresh_token: &str) -> GatewayResult<TokenGrant> {
        self.refresh_grant(family, refresh_token).await
    }
}
