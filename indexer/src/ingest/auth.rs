use async_trait::async_trait;
use fleet_sync_core::config::AuthConfig;
use fleet_sync_core::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Access token presented as `Authorization: Bearer <token>`.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Acquire a credential for one poll cycle. Every failure is `Error::Auth`.
    async fn authenticate(&self) -> Result<BearerToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// OAuth2 resource-owner password grant against the vendor identity provider.
pub struct PasswordGrantAuthenticator {
    client: reqwest::Client,
    config: AuthConfig,
}

impl PasswordGrantAuthenticator {
    pub fn new(config: AuthConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build identity client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Authenticator for PasswordGrantAuthenticator {
    #[instrument(skip(self), fields(identity_url = %self.config.identity_url))]
    async fn authenticate(&self) -> Result<BearerToken> {
        let form = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
            ("scope", self.config.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.identity_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("identity provider unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "identity provider returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("unreadable token response: {}", e)))?;

        let token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth("token response carried no access_token".to_string()))?;

        debug!("Acquired access token");
        Ok(BearerToken::new(token))
    }
}
