//! Per-route access decisions
//!
//! Works on the resolution already computed for the request and never calls
//! the token verifier again.

use huerto_shared::Plan;
use serde::Serialize;

use super::resolver::Resolution;

/// Where a browser is sent when it is not signed in
pub const ONBOARDING_PATH: &str = "/onboarding";
/// Where a browser is sent when its plan is too low
pub const UPGRADE_PATH: &str = "/upgrade";

/// What a route requires from the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Anyone; the resolved identity is attached when there is one
    Public,
    /// Part of the login/registration handshake itself. Unresolved requests
    /// pass through so the handshake cannot redirect to itself.
    Handshake,
    /// Any resolved identity
    Authenticated,
    /// A resolved identity on at least this plan
    Plan(Plan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    Unauthenticated,
    PlanInsufficient { required: Plan, actual: Plan },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PlanInsufficient { .. } => "plan_insufficient",
        }
    }

    pub fn redirect(&self) -> &'static str {
        match self {
            Self::Unauthenticated => ONBOARDING_PATH,
            Self::PlanInsufficient { .. } => UPGRADE_PATH,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthenticated => "Authentication required".to_string(),
            Self::PlanInsufficient { required, .. } => format!("This feature requires the {} plan", required),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    /// Let the request through without an identity
    Defer,
}

pub fn check(resolution: &Resolution, capability: Capability) -> Decision {
    let decision = match (capability, resolution.plan()) {
        (Capability::Public, _) => Decision::Allow,
        (Capability::Handshake, Some(_)) => Decision::Allow,
        (Capability::Handshake, None) => Decision::Defer,
        (Capability::Authenticated, Some(_)) => Decision::Allow,
        // Handlers behind these expect an identity; only handshake routes defer
        (Capability::Authenticated, None) => Decision::Deny(DenyReason::Unauthenticated),
        (Capability::Plan(required), Some(actual)) if actual.satisfies(required) => Decision::Allow,
        (Capability::Plan(required), Some(actual)) => {
            Decision::Deny(DenyReason::PlanInsufficient { required, actual })
        }
        (Capability::Plan(_), None) => Decision::Deny(DenyReason::Unauthenticated),
    };

    if let Decision::Deny(reason) = &decision {
        tracing::info!(
            reason = reason.code(),
            uid = resolution.identity().map(|i| i.uid.as_str()),
            failure = resolution.failure_reason().map(|r| r.as_str()),
            "Access denied"
        );
    }
    decision
}
