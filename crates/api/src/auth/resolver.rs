//! Identity resolution
//!
//! Turns the credential signals of one request into exactly one
//! [`Resolution`] by walking a fixed precedence chain, strongest signal
//! first:
//!
//! 1. a valid server session already established at `Trusted`
//! 2. the development bypass token (development only)
//! 3. a bearer token, else the id token cookie, checked by the verifier
//! 4. the mirrored backup cookies (`SemiTrusted`)
//! 5. a `uid` URL/form parameter with a `from=login|register` marker (`LowTrust`)
//! 6. a same-site referer carrying `uid` plus a marker (`LowTrust`)
//!
//! A session established from a weaker signal is still used, but only after
//! a token has had the chance to upgrade it. Token failures never end the
//! chain: the reason is kept and reported only if nothing weaker matches.
//! When the request's session has just expired, steps 4 to 6 are skipped.

use std::sync::Arc;
use std::time::Duration;

use huerto_shared::{AuthUser, Identity, Plan, Provenance, TrustLevel};
use serde::Serialize;
use subtle::ConstantTimeEq;

use super::cookies::BackupData;
use super::credentials::{CredentialOrigin, CredentialSet};
use super::sessions::Session;
use super::verifier::{verify_with_timeout, TokenVerifier, VerifyError};

/// uid assumed by the development bypass when the request names none
pub const DEV_USER_UID: &str = "dev-user";

/// Why a request could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoCredential,
    InvalidCredential,
    ExpiredCredential,
    VerifierUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCredential => "no_credential",
            Self::InvalidCredential => "invalid_credential",
            Self::ExpiredCredential => "expired_credential",
            Self::VerifierUnavailable => "verifier_unavailable",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&VerifyError> for FailureReason {
    fn from(err: &VerifyError) -> Self {
        match err {
            VerifyError::Invalid => Self::InvalidCredential,
            VerifyError::Expired => Self::ExpiredCredential,
            VerifyError::Unavailable(_) => Self::VerifierUnavailable,
        }
    }
}

/// A token that passed verification. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(<redacted>)")
    }
}

/// The single answer to "who is making this request"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved {
        identity: Identity,
        trust_level: TrustLevel,
        /// The signal the identity was taken from
        source: CredentialOrigin,
        /// Set when a token was verified during this request
        verified_token: Option<SecretToken>,
    },
    Failed {
        reason: FailureReason,
        /// Strongest token rejection seen on the way down the chain
        rejected: Option<FailureReason>,
        provenance: Option<Provenance>,
    },
}

impl Resolution {
    fn resolved(identity: Identity, trust_level: TrustLevel, source: CredentialOrigin) -> Self {
        Self::Resolved {
            identity,
            trust_level,
            source,
            verified_token: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Resolved { identity, .. } => Some(identity),
            Self::Failed { .. } => None,
        }
    }

    pub fn trust_level(&self) -> Option<TrustLevel> {
        match self {
            Self::Resolved { trust_level, .. } => Some(*trust_level),
            Self::Failed { .. } => None,
        }
    }

    pub fn source(&self) -> Option<CredentialOrigin> {
        match self {
            Self::Resolved { source, .. } => Some(*source),
            Self::Failed { .. } => None,
        }
    }

    pub fn plan(&self) -> Option<Plan> {
        self.identity().map(|identity| identity.plan)
    }

    pub fn provenance(&self) -> Option<Provenance> {
        match self {
            Self::Resolved { identity, .. } => identity.provenance,
            Self::Failed { provenance, .. } => *provenance,
        }
    }

    /// The reason to report for a failed resolution: the token rejection if
    /// there was one, otherwise the failure itself
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Resolved { .. } => None,
            Self::Failed { reason, rejected, .. } => Some(rejected.unwrap_or(*reason)),
        }
    }

    /// The `(uid, plan)` view handed to application handlers
    pub fn auth_user(&self) -> Option<AuthUser> {
        match self {
            Self::Resolved {
                identity,
                trust_level,
                ..
            } => Some(AuthUser::new(identity, *trust_level)),
            Self::Failed { .. } => None,
        }
    }
}

/// Development-only shortcut keyed by a shared token
#[derive(Clone)]
pub struct DevBypass {
    token: String,
}

impl DevBypass {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn matches(&self, presented: &str) -> bool {
        self.token.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl std::fmt::Debug for DevBypass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DevBypass(<redacted>)")
    }
}

/// Applies the precedence chain. Stateless apart from its collaborators,
/// so one instance is shared by all requests.
#[derive(Clone)]
pub struct IdentityResolver {
    verifier: Arc<dyn TokenVerifier>,
    verifier_timeout: Duration,
    dev_bypass: Option<DevBypass>,
    /// Host of the public URL; referers from other hosts are ignored
    site_host: Option<String>,
}

impl IdentityResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>, verifier_timeout: Duration) -> Self {
        Self {
            verifier,
            verifier_timeout,
            dev_bypass: None,
            site_host: None,
        }
    }

    pub fn with_dev_bypass(mut self, bypass: Option<DevBypass>) -> Self {
        self.dev_bypass = bypass;
        self
    }

    pub fn with_site_host(mut self, host: Option<String>) -> Self {
        self.site_host = host.map(|h| h.to_lowercase());
        self
    }

    pub fn verifier(&self) -> &dyn TokenVerifier {
        self.verifier.as_ref()
    }

    pub fn verifier_timeout(&self) -> Duration {
        self.verifier_timeout
    }

    /// Resolve one request. The verifier is called at most once.
    pub async fn resolve(&self, credentials: &CredentialSet) -> Resolution {
        let provenance = credentials.provenance();

        let weak_session = match credentials.server_session() {
            Some(session) if session.trust_level >= TrustLevel::Trusted => {
                tracing::debug!(uid = %session.uid, "Resolved from server session");
                return from_session(session, provenance);
            }
            other => other,
        };

        if let Some(resolution) = self.dev_bypass(credentials, provenance) {
            return resolution;
        }

        let mut rejected = None;
        if let Some((token, origin)) = credentials.identity_token() {
            match verify_with_timeout(self.verifier.as_ref(), token, self.verifier_timeout).await {
                Ok(verified) => {
                    // Without a plan claim, keep what this user's session knew
                    let fallback_plan = weak_session
                        .filter(|s| s.uid == verified.uid)
                        .map(|s| s.plan)
                        .unwrap_or_default();
                    let identity = verified.into_identity(fallback_plan).with_provenance(provenance);
                    tracing::info!(
                        uid = %identity.uid,
                        source = origin.as_str(),
                        "Resolved from verified token"
                    );
                    return Resolution::Resolved {
                        identity,
                        trust_level: TrustLevel::Verified,
                        source: origin,
                        verified_token: Some(SecretToken::new(token)),
                    };
                }
                Err(e) => {
                    let reason = FailureReason::from(&e);
                    match reason {
                        FailureReason::VerifierUnavailable => tracing::warn!(
                            error = %e,
                            source = origin.as_str(),
                            "Token verifier unavailable, falling back to weaker signals"
                        ),
                        _ => tracing::info!(
                            reason = reason.as_str(),
                            source = origin.as_str(),
                            "Token rejected, falling back to weaker signals"
                        ),
                    }
                    rejected = Some(reason);
                }
            }
        }

        if let Some(session) = weak_session {
            tracing::debug!(uid = %session.uid, trust = %session.trust_level, "Resolved from server session");
            return from_session(session, provenance);
        }

        // The mirrors and parameters of a voided session must not revive it;
        // only a verified token starts a new one
        if credentials.session_expired() {
            tracing::info!(rejected = ?rejected, "Session expired, ignoring mirrored and uid signals");
            return Resolution::Failed {
                reason: FailureReason::NoCredential,
                rejected: rejected.or(Some(FailureReason::ExpiredCredential)),
                provenance,
            };
        }

        if let Some(resolution) = from_backup_cookies(credentials, provenance) {
            return resolution;
        }

        if let Some((uid, origin)) = credentials.param_uid() {
            match provenance {
                Some(marker) => {
                    tracing::info!(uid = %uid, source = origin.as_str(), from = %marker, "Resolved from uid parameter");
                    return Resolution::resolved(
                        Identity::uid_only(uid).with_provenance(Some(marker)),
                        TrustLevel::LowTrust,
                        origin,
                    );
                }
                None => {
                    tracing::debug!(uid = %uid, source = origin.as_str(), "Ignoring uid parameter without provenance marker");
                }
            }
        }

        if let Some((uid, host, referer_marker)) = credentials.referer_uid() {
            let same_site = matches!((&self.site_host, host), (Some(site), Some(host)) if site == host);
            match (same_site, provenance.or(referer_marker)) {
                (true, Some(marker)) => {
                    tracing::info!(uid = %uid, from = %marker, "Resolved from referer uid");
                    return Resolution::resolved(
                        Identity::uid_only(uid).with_provenance(Some(marker)),
                        TrustLevel::LowTrust,
                        CredentialOrigin::RefererUidParam,
                    );
                }
                _ => {
                    tracing::debug!(same_site, "Ignoring referer uid");
                }
            }
        }

        tracing::debug!(rejected = ?rejected, "No usable credential");
        Resolution::Failed {
            reason: FailureReason::NoCredential,
            rejected,
            provenance,
        }
    }

    fn dev_bypass(&self, credentials: &CredentialSet, provenance: Option<Provenance>) -> Option<Resolution> {
        let presented = credentials.dev_token()?;
        match &self.dev_bypass {
            Some(bypass) if bypass.matches(presented) => {
                let uid = credentials
                    .param_uid()
                    .map(|(uid, _)| uid)
                    .unwrap_or(DEV_USER_UID);
                tracing::warn!(uid = %uid, "Development bypass used");
                Some(Resolution::resolved(
                    Identity::uid_only(uid).with_provenance(provenance),
                    TrustLevel::Trusted,
                    CredentialOrigin::DevToken,
                ))
            }
            Some(_) => {
                tracing::warn!("Development bypass token mismatch");
                None
            }
            None => {
                tracing::warn!("Development bypass token ignored: bypass is disabled");
                None
            }
        }
    }
}

fn from_session(session: &Session, provenance: Option<Provenance>) -> Resolution {
    Resolution::resolved(
        session.identity().with_provenance(provenance),
        session.trust_level,
        CredentialOrigin::ExistingServerSession,
    )
}

/// Highest plan the client-writable metadata cookie can grant. Paid tiers
/// come from a verified claim or a server session.
const MIRRORED_PLAN_CEILING: Plan = Plan::Gratuito;

/// Backup uid cookie, enriched by the metadata cookie when both name the
/// same uid. The metadata cookie alone is enough to recover the uid.
fn from_backup_cookies(credentials: &CredentialSet, provenance: Option<Provenance>) -> Option<Resolution> {
    let data = credentials.backup_data().and_then(|raw| match BackupData::decode(raw) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring malformed backup data cookie");
            None
        }
    });

    let (uid, source) = match (credentials.backup_uid(), &data) {
        (Some(uid), _) => (uid.to_string(), CredentialOrigin::BackupUidCookie),
        (None, Some(data)) => (data.uid.clone(), CredentialOrigin::BackupDataCookie),
        (None, None) => return None,
    };

    let identity = match data.filter(|d| d.uid == uid) {
        Some(data) => Identity {
            uid,
            email: data.email,
            display_name: data.name,
            email_verified: false,
            plan: data.plan.min(MIRRORED_PLAN_CEILING),
            provenance,
        },
        None => Identity::uid_only(uid).with_provenance(provenance),
    };

    tracing::info!(uid = %identity.uid, source = source.as_str(), "Resolved from backup cookies");
    Some(Resolution::resolved(identity, TrustLevel::SemiTrusted, source))
}
