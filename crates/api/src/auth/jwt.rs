//! Local verification of HS256 identity tokens
//!
//! Used instead of the remote account lookup when the identity provider
//! shares its signing secret with us.

use futures::future::BoxFuture;
use huerto_shared::Plan;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::verifier::{TokenVerifier, VerifiedIdentity, VerifyError};

/// Claims carried by provider-issued identity tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject (uid)
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    /// Custom claim set by the billing side
    pub plan: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    /// Expiration
    pub exp: i64,
}

impl From<IdentityClaims> for VerifiedIdentity {
    fn from(claims: IdentityClaims) -> Self {
        let plan = claims.plan.as_deref().map(|label| Plan::from_label(Some(label)));
        Self {
            uid: claims.sub,
            email: claims.email,
            display_name: claims.name,
            email_verified: claims.email_verified,
            plan,
        }
    }
}

/// Verifies tokens signed with a shared HS256 secret
#[derive(Clone)]
pub struct SharedSecretVerifier {
    decoding_key: DecodingKey,
    audience: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: &str, audience: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            audience: audience.to_string(),
        }
    }

    /// Validate and decode a token.
    /// The algorithm is pinned so a token cannot pick its own.
    pub fn validate(&self, token: &str) -> Result<IdentityClaims, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&[self.audience.as_str()]);

        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("Identity token audience validation failed - rejecting token");
                    VerifyError::Invalid
                }
                _ => {
                    tracing::debug!(error = %e, "Identity token rejected");
                    VerifyError::Invalid
                }
            })?;

        if claims.sub.trim().is_empty() {
            return Err(VerifyError::Invalid);
        }
        Ok(claims)
    }
}

impl TokenVerifier for SharedSecretVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<VerifiedIdentity, VerifyError>> {
        Box::pin(futures::future::ready(self.validate(token).map(VerifiedIdentity::from)))
    }
}
