//! Common types used across HuertoRentable

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ParseError;

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan tier
///
/// Variants are declared from lowest to highest tier so that the derived
/// ordering can be used for capability checks (`plan >= Plan::Premium`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Anonymous/demo visitor, data kept client-side only
    Invitado,
    /// Registered free tier
    Gratuito,
    /// Paid tier
    Premium,
}

impl Default for Plan {
    fn default() -> Self {
        Self::Gratuito
    }
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitado => "invitado",
            Self::Gratuito => "gratuito",
            Self::Premium => "premium",
        }
    }

    /// Parse a plan label, falling back to the lowest registered tier
    /// (`gratuito`) when the label is missing or unknown.
    pub fn from_label(label: Option<&str>) -> Self {
        label
            .and_then(|l| l.parse().ok())
            .unwrap_or_default()
    }

    /// Whether this plan includes the features of `required`
    pub fn satisfies(&self, required: Plan) -> bool {
        *self >= required
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "invitado" | "guest" => Ok(Self::Invitado),
            "gratuito" | "free" => Ok(Self::Gratuito),
            "premium" => Ok(Self::Premium),
            _ => Err(ParseError::UnknownPlan(s.to_string())),
        }
    }
}

// Lenient: unknown, null or missing plans become `gratuito` instead of
// failing the whole payload.
impl<'de> Deserialize<'de> for Plan {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(Self::from_label(label.as_deref()))
    }
}

/// Confidence rank assigned to a resolved identity
///
/// Declared weakest first; `Verified > Trusted > SemiTrusted > LowTrust`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Bare uid from URL/form/referer, accepted only with a provenance marker
    LowTrust,
    /// Mirrored backup cookie, unverified
    SemiTrusted,
    /// Previously verified, unexpired server session
    Trusted,
    /// Cryptographically checked during this request
    Verified,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowTrust => "low_trust",
            Self::SemiTrusted => "semi_trusted",
            Self::Trusted => "trusted",
            Self::Verified => "verified",
        }
    }

    /// The level a session keeps once the request that established it is
    /// over. A verification only holds for the request it happened in, so
    /// `Verified` is stored as `Trusted`; every other level is kept as is.
    pub fn session_grade(self) -> Self {
        match self {
            Self::Verified => Self::Trusted,
            other => other,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_trust" => Ok(Self::LowTrust),
            "semi_trusted" => Ok(Self::SemiTrusted),
            "trusted" => Ok(Self::Trusted),
            "verified" => Ok(Self::Verified),
            _ => Err(ParseError::UnknownTrustLevel(s.to_string())),
        }
    }
}

/// Marker that the request belongs to a known legitimate flow
/// (`from=login` / `from=register`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Login,
    Register,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "login" => Ok(Self::Login),
            "register" => Ok(Self::Register),
            _ => Err(ParseError::UnknownProvenance(s.to_string())),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// A resolved end user
///
/// `uid` is the only stable key. Everything else is best-effort metadata
/// and is routinely absent for low-trust resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

impl Identity {
    /// Identity known only by its uid, on the default plan
    pub fn uid_only(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
            email_verified: false,
            plan: Plan::default(),
            provenance: None,
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }

    /// Name to greet the user with: display name, else the email local part
    pub fn greeting_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or_else(|| self.email.as_deref().and_then(|e| e.split('@').next()))
            .filter(|n| !n.is_empty())
    }
}

/// The identity handed to application handlers (crops, analytics, exports)
///
/// Handlers receive this through request extensions and must not re-derive
/// identity from cookies or parameters themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub uid: String,
    pub plan: Plan,
    pub trust_level: TrustLevel,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl AuthUser {
    pub fn new(identity: &Identity, trust_level: TrustLevel) -> Self {
        Self {
            uid: identity.uid.clone(),
            plan: identity.plan,
            trust_level,
            email: identity.email.clone(),
            display_name: identity.greeting_name().map(str::to_string),
        }
    }

    pub fn is_premium(&self) -> bool {
        self.plan.satisfies(Plan::Premium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Plan Tests
    // =========================================================================

    #[test]
    fn test_plan_default_is_gratuito() {
        assert_eq!(Plan::default(), Plan::Gratuito);
    }

    #[test]
    fn test_plan_ordering() {
        assert!(Plan::Invitado < Plan::Gratuito);
        assert!(Plan::Gratuito < Plan::Premium);
        assert!(Plan::Premium.satisfies(Plan::Gratuito));
        assert!(!Plan::Gratuito.satisfies(Plan::Premium));
    }

    #[test]
    fn test_plan_from_label_falls_back() {
        assert_eq!(Plan::from_label(Some("premium")), Plan::Premium);
        assert_eq!(Plan::from_label(Some("PREMIUM")), Plan::Premium);
        assert_eq!(Plan::from_label(Some("platinum")), Plan::Gratuito);
        assert_eq!(Plan::from_label(Some("")), Plan::Gratuito);
        assert_eq!(Plan::from_label(None), Plan::Gratuito);
    }

    #[test]
    fn test_plan_deserialize_is_lenient() {
        #[derive(Deserialize)]
        struct Payload {
            #[serde(default)]
            plan: Plan,
        }

        let p: Payload = serde_json::from_str(r#"{"plan":"premium"}"#).unwrap();
        assert_eq!(p.plan, Plan::Premium);
        let p: Payload = serde_json::from_str(r#"{"plan":"gold"}"#).unwrap();
        assert_eq!(p.plan, Plan::Gratuito);
        let p: Payload = serde_json::from_str(r#"{"plan":null}"#).unwrap();
        assert_eq!(p.plan, Plan::Gratuito);
        let p: Payload = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(p.plan, Plan::Gratuito);
    }

    #[test]
    fn test_plan_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Premium).unwrap(), "\"premium\"");
    }

    // =========================================================================
    // TrustLevel Tests
    // =========================================================================

    #[test]
    fn test_trust_level_ordering() {
        assert!(TrustLevel::Verified > TrustLevel::Trusted);
        assert!(TrustLevel::Trusted > TrustLevel::SemiTrusted);
        assert!(TrustLevel::SemiTrusted > TrustLevel::LowTrust);
    }

    #[test]
    fn test_trust_level_session_grade() {
        assert_eq!(TrustLevel::Verified.session_grade(), TrustLevel::Trusted);
        assert_eq!(TrustLevel::Trusted.session_grade(), TrustLevel::Trusted);
        assert_eq!(TrustLevel::SemiTrusted.session_grade(), TrustLevel::SemiTrusted);
        assert_eq!(TrustLevel::LowTrust.session_grade(), TrustLevel::LowTrust);
    }

    #[test]
    fn test_trust_level_round_trip_str() {
        for level in [
            TrustLevel::LowTrust,
            TrustLevel::SemiTrusted,
            TrustLevel::Trusted,
            TrustLevel::Verified,
        ] {
            assert_eq!(level.as_str().parse::<TrustLevel>(), Ok(level));
        }
        assert!("root".parse::<TrustLevel>().is_err());
    }

    // =========================================================================
    // Provenance / Identity Tests
    // =========================================================================

    #[test]
    fn test_provenance_parse() {
        assert_eq!("login".parse::<Provenance>(), Ok(Provenance::Login));
        assert_eq!("register".parse::<Provenance>(), Ok(Provenance::Register));
        assert_eq!(
            "dashboard".parse::<Provenance>(),
            Err(ParseError::UnknownProvenance("dashboard".to_string()))
        );
    }

    #[test]
    fn test_identity_greeting_name() {
        let mut identity = Identity::uid_only("abc123");
        assert_eq!(identity.greeting_name(), None);

        identity.email = Some("ana@huerto.com".to_string());
        assert_eq!(identity.greeting_name(), Some("ana"));

        identity.display_name = Some("Ana".to_string());
        assert_eq!(identity.greeting_name(), Some("Ana"));
    }

    #[test]
    fn test_auth_user_from_identity() {
        let identity = Identity::uid_only("abc123").with_plan(Plan::Premium);
        let user = AuthUser::new(&identity, TrustLevel::SemiTrusted);
        assert_eq!(user.uid, "abc123");
        assert!(user.is_premium());
        assert_eq!(user.trust_level, TrustLevel::SemiTrusted);
    }
}
