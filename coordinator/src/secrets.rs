//! Secret lookup through Bitwarden Secrets Manager.
//!
//! When `BWS_ACCESS_TOKEN` is set each secret is fetched from Bitwarden by id;
//! otherwise, or when the fetch fails, the plain environment variable is used.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Where a secret lives: a Bitwarden secret id (itself overridable through an
/// env var) and the plain env var used as fallback.
#[derive(Debug, Clone, Copy)]
pub struct SecretRef {
    pub id_var: &'static str,
    pub default_id: &'static str,
    pub env_var: &'static str,
}

impl SecretRef {
    fn secret_id(&self) -> String {
        std::env::var(self.id_var).unwrap_or_else(|_| self.default_id.to_string())
    }
}

pub const DATABASE_URL: SecretRef = SecretRef {
    id_var: "BWS_DATABASE_URL_ID",
    default_id: "database-url",
    env_var: "DATABASE_URL",
};

pub const GEMINI_API_KEY: SecretRef = SecretRef {
    id_var: "BWS_GEMINI_API_KEY_ID",
    default_id: "gemini-api-key",
    env_var: "GEMINI_API_KEY",
};

#[derive(Deserialize)]
struct BwsSecret {
    value: String,
}

pub struct SecretsClient {
    access_token: Option<String>,
    api_url: String,
    http: reqwest::Client,
}

impl SecretsClient {
    pub fn from_env() -> Self {
        Self {
            access_token: std::env::var("BWS_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),
            api_url: std::env::var("BWS_API_URL")
                .unwrap_or_else(|_| "https://api.bitwarden.com".to_string()),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve a secret. Blank values count as absent.
    pub async fn resolve(&self, secret: &SecretRef) -> Option<String> {
        if let Some(token) = &self.access_token {
            let id = secret.secret_id();
            match self.fetch(token, &id).await {
                Ok(value) if !value.trim().is_empty() => return Some(value.trim().to_string()),
                Ok(_) => debug!(secret_id = %id, "bitwarden secret is blank"),
                Err(e) => warn!(
                    secret_id = %id,
                    error = %e,
                    env_var = secret.env_var,
                    "bitwarden lookup failed, falling back to env var"
                ),
            }
        }

        std::env::var(secret.env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn fetch(&self, token: &str, secret_id: &str) -> Result<String> {
        let url = format!("{}/secrets/{}", self.api_url.trim_end_matches('/'), secret_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("request to Bitwarden Secrets Manager failed")?;

        if !resp.status().is_success() {
            bail!("Bitwarden API returned status {}", resp.status());
        }

        let body: BwsSecret = resp.json().await.context("failed to parse Bitwarden response")?;
        Ok(body.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> SecretsClient {
        SecretsClient {
            access_token: None,
            api_url: "http://127.0.0.1:9".into(),
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn env_fallback_without_token() {
        const S: SecretRef = SecretRef {
            id_var: "COORD_TEST_SECRET_ID_A",
            default_id: "a",
            env_var: "COORD_TEST_SECRET_A",
        };
        std::env::set_var(S.env_var, "  value-a ");
        assert_eq!(offline().resolve(&S).await.as_deref(), Some("value-a"));
    }

    #[tokio::test]
    async fn blank_or_missing_is_none() {
        const BLANK: SecretRef = SecretRef {
            id_var: "COORD_TEST_SECRET_ID_B",
            default_id: "b",
            env_var: "COORD_TEST_SECRET_B",
        };
        const MISSING: SecretRef = SecretRef {
            id_var: "COORD_TEST_SECRET_ID_C",
            default_id: "c",
            env_var: "COORD_TEST_SECRET_C_UNSET",
        };
        std::env::set_var(BLANK.env_var, "   ");
        assert_eq!(offline().resolve(&BLANK).await, None);
        assert_eq!(offline().resolve(&MISSING).await, None);
    }

    #[tokio::test]
    async fn unreachable_bitwarden_falls_back() {
        const S: SecretRef = SecretRef {
            id_var: "COORD_TEST_SECRET_ID_D",
            default_id: "d",
            env_var: "COORD_TEST_SECRET_D",
        };
        std::env::set_var(S.env_var, "from-env");
        let client = SecretsClient { access_token: Some("token".into()), ..offline() };
        assert_eq!(client.resolve(&S).await.as_deref(), Some("from-env"));
    }
}
