//! Identity token verification
//!
//! Token cryptography belongs to the identity provider. This module defines
//! the contract the resolver relies on and the HTTP client for the provider's
//! account lookup endpoint. Every call made by the resolver is bounded by a
//! timeout, and a provider that cannot answer is reported as `Unavailable`
//! rather than as a rejection.

use std::time::Duration;

use futures::future::BoxFuture;
use huerto_shared::{Identity, Plan};
use serde::{Deserialize, Serialize};

/// Identity confirmed by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub email_verified: bool,
    /// Plan carried in the token's custom claims, if any
    pub plan: Option<Plan>,
}

impl VerifiedIdentity {
    pub fn uid_only(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
            email_verified: false,
            plan: None,
        }
    }

    /// Convert to an [`Identity`], using `fallback_plan` when the token
    /// carries no plan claim
    pub fn into_identity(self, fallback_plan: Plan) -> Identity {
        Identity {
            uid: self.uid,
            email: self.email,
            display_name: self.display_name,
            email_verified: self.email_verified,
            plan: self.plan.unwrap_or(fallback_plan),
            provenance: None,
        }
    }
}

/// Token verification failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Invalid token")]
    Invalid,
    #[error("Token has expired")]
    Expired,
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Contract with the identity provider
pub trait TokenVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedIdentity, VerifyError>>;
}

/// Run a verification bounded by `timeout`. An elapsed timeout counts as
/// `Unavailable`.
pub async fn verify_with_timeout(
    verifier: &dyn TokenVerifier,
    token: &str,
    timeout: Duration,
) -> Result<VerifiedIdentity, VerifyError> {
    match tokio::time::timeout(timeout, verifier.verify(token)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Token verification timed out");
            Err(VerifyError::Unavailable("verification timed out".to_string()))
        }
    }
}

/// Verifier used when no identity provider is configured: every token is
/// reported as unverifiable, so resolution falls back to weaker signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledVerifier;

impl TokenVerifier for DisabledVerifier {
    fn verify<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, Result<VerifiedIdentity, VerifyError>> {
        Box::pin(futures::future::ready(Err(VerifyError::Unavailable(
            "no identity provider configured".to_string(),
        ))))
    }
}

/// Verifies tokens through the provider's account lookup endpoint
/// (`POST {base}/v1/accounts:lookup?key=...`)
#[derive(Clone)]
pub struct RemoteTokenVerifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    id_token: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<ProviderUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderUser {
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    email_verified: bool,
    /// Custom claims, as a JSON-encoded string
    custom_attributes: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderError,
}

#[derive(Deserialize)]
struct ProviderError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CustomClaims {
    #[serde(default)]
    plan: Option<String>,
}

impl RemoteTokenVerifier {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client for identity provider");
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn lookup(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let url = format!("{}/v1/accounts:lookup", self.base_url);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&LookupRequest { id_token: token })
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, timeout = e.is_timeout(), "Identity provider request failed");
                VerifyError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, "Identity provider returned a server error");
            return Err(VerifyError::Unavailable(format!("provider returned {}", status)));
        }

        if status.is_client_error() {
            let message = response
                .json::<ProviderErrorBody>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_default();
            return Err(if message.contains("TOKEN_EXPIRED") {
                VerifyError::Expired
            } else {
                tracing::debug!(status = %status, message = %message, "Identity provider rejected token");
                VerifyError::Invalid
            });
        }

        let body: LookupResponse = response.json().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse identity provider response");
            VerifyError::Unavailable(e.to_string())
        })?;

        let user = body.users.into_iter().next().ok_or(VerifyError::Invalid)?;
        if user.local_id.trim().is_empty() {
            return Err(VerifyError::Invalid);
        }

        let plan = user
            .custom_attributes
            .as_deref()
            .and_then(|raw| serde_json::from_str::<CustomClaims>(raw).ok())
            .and_then(|claims| claims.plan)
            .map(|label| Plan::from_label(Some(&label)));

        Ok(VerifiedIdentity {
            uid: user.local_id,
            email: user.email,
            display_name: user.display_name,
            email_verified: user.email_verified,
            plan,
        })
    }
}

impl TokenVerifier for RemoteTokenVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedIdentity, VerifyError>> {
        Box::pin(self.lookup(token))
    }
}
