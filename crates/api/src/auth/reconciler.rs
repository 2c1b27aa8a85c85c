//! Session reconciliation
//!
//! Merges a request's [`Resolution`] into its server-side session and
//! mirrors the result into response cookies. The merge never lowers the
//! trust stored in a session, and it is a pure function of its inputs:
//! reconciling the same resolution against the same session twice yields the
//! same session and the same cookies.

use huerto_shared::TrustLevel;
use time::OffsetDateTime;

use super::cookies::CookieSet;
use super::resolver::Resolution;
use super::sessions::{Session, SessionLookup};

/// What the session store has to do after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// The stored session already holds the reconciled state
    Unchanged,
    /// Store `Reconciliation::session` under the request's session id
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The session as it stands after this request, if any
    pub session: Option<Session>,
    pub action: SessionAction,
    /// `Set-Cookie` instructions for the response
    pub cookies: CookieSet,
}

impl Reconciliation {
    fn unchanged(session: Option<Session>, cookies: CookieSet) -> Self {
        Self {
            session,
            action: SessionAction::Unchanged,
            cookies,
        }
    }

    /// Trust level held by the session after reconciliation
    pub fn trust_level(&self) -> Option<TrustLevel> {
        self.session.as_ref().map(|s| s.trust_level)
    }
}

/// Merge `resolution` into the session found by `lookup`.
///
/// `session_id` is the id the session is (or will be) stored under; it goes
/// into the mirrored session cookie.
pub fn reconcile(
    resolution: &Resolution,
    lookup: &SessionLookup,
    session_id: &str,
    now: OffsetDateTime,
) -> Reconciliation {
    let existing = lookup.session();

    let Resolution::Resolved {
        identity,
        trust_level,
        source,
        verified_token,
    } = resolution
    else {
        // A session the client still points at is gone; make it forget the
        // mirrors too so stale backups stop resurrecting it.
        let cookies = if lookup.is_stale() {
            CookieSet::clear_all()
        } else {
            CookieSet::new()
        };
        return Reconciliation::unchanged(None, cookies);
    };

    let mut reconciliation = match existing {
        Some(session) if session.trust_level > trust_level.session_grade() => {
            tracing::debug!(
                session_uid = %session.uid,
                session_trust = %session.trust_level,
                resolved_uid = %identity.uid,
                resolved_trust = %trust_level,
                "Refusing to downgrade session trust"
            );
            Reconciliation::unchanged(Some(session.clone()), mirror(session_id, session))
        }
        Some(session) if session.matches(identity, *trust_level) => {
            Reconciliation::unchanged(Some(session.clone()), mirror(session_id, session))
        }
        // The client already holds these mirrors; rebuilding a session from
        // them on every request that lost the session cookie would leave a
        // new stored session behind each time
        None if source.is_mirror() => Reconciliation::unchanged(None, CookieSet::new()),
        _ => {
            let session = Session::from_identity(identity, *trust_level, now);
            let cookies = mirror(session_id, &session);
            Reconciliation {
                session: Some(session),
                action: SessionAction::Write,
                cookies,
            }
        }
    };

    if let Some(token) = verified_token {
        reconciliation.cookies.push(CookieSet::id_token(token.expose()));
    }

    reconciliation
}

fn mirror(session_id: &str, session: &Session) -> CookieSet {
    CookieSet::mirror(session_id, &session.backup_data()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, uid = %session.uid, "Failed to encode mirrored session cookies");
        CookieSet::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cookies::{
        CookieDirective, BACKUP_DATA_COOKIE, BACKUP_UID_COOKIE, ID_TOKEN_COOKIE, SESSION_COOKIE,
    };
    use crate::auth::credentials::CredentialOrigin;
    use crate::auth::resolver::{FailureReason, SecretToken};
    use huerto_shared::{Identity, Plan, Provenance};

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn resolved(uid: &str, trust_level: TrustLevel, source: CredentialOrigin) -> Resolution {
        Resolution::Resolved {
            identity: Identity::uid_only(uid),
            trust_level,
            source,
            verified_token: None,
        }
    }

    fn failed() -> Resolution {
        Resolution::Failed {
            reason: FailureReason::NoCredential,
            rejected: None,
            provenance: None,
        }
    }

    #[test]
    fn test_new_resolution_writes_session_and_mirrors() {
        let resolution = resolved("xyz", TrustLevel::LowTrust, CredentialOrigin::UrlUidParam);
        let result = reconcile(&resolution, &SessionLookup::NotPresented, "sid", now());

        assert_eq!(result.action, SessionAction::Write);
        let session = result.session.clone().unwrap();
        assert_eq!(session.uid, "xyz");
        assert_eq!(session.trust_level, TrustLevel::LowTrust);
        assert_eq!(session.plan, Plan::Gratuito);
        assert_eq!(session.login_timestamp, now());

        assert_eq!(result.cookies.len(), 3);
        for name in [SESSION_COOKIE, BACKUP_UID_COOKIE, BACKUP_DATA_COOKIE] {
            match result.cookies.get(name) {
                Some(CookieDirective::Set { max_age_secs, .. }) => assert_eq!(*max_age_secs, 86_400),
                other => panic!("expected {} to be set, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_lower_trust_never_downgrades_session() {
        let identity = Identity::uid_only("abc123").with_plan(Plan::Premium);
        let session = Session::from_identity(&identity, TrustLevel::Trusted, now());
        let lookup = SessionLookup::Active(session.clone());

        let resolution = resolved("intruder", TrustLevel::LowTrust, CredentialOrigin::UrlUidParam);
        let result = reconcile(&resolution, &lookup, "sid", now());

        assert_eq!(result.action, SessionAction::Unchanged);
        assert_eq!(result.session, Some(session));
        assert_eq!(result.trust_level(), Some(TrustLevel::Trusted));
        match result.cookies.get(BACKUP_UID_COOKIE) {
            Some(CookieDirective::Set { value, .. }) => assert_eq!(value, "abc123"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_verified_upgrades_weaker_session() {
        let weak = Session::from_identity(&Identity::uid_only("abc123"), TrustLevel::SemiTrusted, now());
        let lookup = SessionLookup::Active(weak);

        let resolution = resolved("abc123", TrustLevel::Verified, CredentialOrigin::BearerHeader);
        let result = reconcile(&resolution, &lookup, "sid", now());

        assert_eq!(result.action, SessionAction::Write);
        assert_eq!(result.trust_level(), Some(TrustLevel::Trusted));
    }

    #[test]
    fn test_matching_session_is_not_rewritten() {
        let identity = Identity::uid_only("abc123");
        let session = Session::from_identity(&identity, TrustLevel::SemiTrusted, now());
        let lookup = SessionLookup::Active(session.clone());

        let resolution = Resolution::Resolved {
            identity,
            trust_level: TrustLevel::SemiTrusted,
            source: CredentialOrigin::ExistingServerSession,
            verified_token: None,
        };
        let result = reconcile(&resolution, &lookup, "sid", now());
        assert_eq!(result.action, SessionAction::Unchanged);
        assert_eq!(result.session, Some(session));
        assert_eq!(result.cookies.len(), 3);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let resolution = Resolution::Resolved {
            identity: Identity::uid_only("abc123")
                .with_plan(Plan::Premium)
                .with_provenance(Some(Provenance::Login)),
            trust_level: TrustLevel::Verified,
            source: CredentialOrigin::BearerHeader,
            verified_token: Some(SecretToken::new("tok")),
        };
        let lookup = SessionLookup::NotPresented;

        let first = reconcile(&resolution, &lookup, "sid", now());
        let second = reconcile(&resolution, &lookup, "sid", now());
        assert_eq!(first, second);
        assert_eq!(first.cookies.header_values(true), second.cookies.header_values(true));
    }

    #[test]
    fn test_verified_token_mirrored_to_cookie() {
        let resolution = Resolution::Resolved {
            identity: Identity::uid_only("abc123"),
            trust_level: TrustLevel::Verified,
            source: CredentialOrigin::BearerHeader,
            verified_token: Some(SecretToken::new("tok")),
        };
        let result = reconcile(&resolution, &SessionLookup::NotPresented, "sid", now());
        assert_eq!(result.cookies.len(), 4);
        assert_eq!(result.cookies.get(ID_TOKEN_COOKIE), Some(&CookieSet::id_token("tok")));
    }

    #[test]
    fn test_failure_after_expiry_clears_cookies() {
        let result = reconcile(&failed(), &SessionLookup::Expired, "sid", now());
        assert_eq!(result.action, SessionAction::Unchanged);
        assert_eq!(result.session, None);
        assert_eq!(result.cookies, CookieSet::clear_all());

        let result = reconcile(&failed(), &SessionLookup::Missing, "sid", now());
        assert_eq!(result.cookies, CookieSet::clear_all());
    }

    #[test]
    fn test_mirror_resolution_without_session_writes_nothing() {
        let resolution = resolved("abc123", TrustLevel::SemiTrusted, CredentialOrigin::BackupUidCookie);

        for lookup in [SessionLookup::NotPresented, SessionLookup::Missing] {
            let first = reconcile(&resolution, &lookup, "sid-1", now());
            let second = reconcile(&resolution, &lookup, "sid-2", now());
            assert_eq!(first.action, SessionAction::Unchanged);
            assert_eq!(first.session, None);
            assert!(first.cookies.is_empty());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_mirror_resolution_upgrades_existing_weaker_session() {
        let weak = Session::from_identity(&Identity::uid_only("abc123"), TrustLevel::LowTrust, now());
        let lookup = SessionLookup::Active(weak);

        let resolution = resolved("abc123", TrustLevel::SemiTrusted, CredentialOrigin::BackupUidCookie);
        let result = reconcile(&resolution, &lookup, "sid", now());
        assert_eq!(result.action, SessionAction::Write);
        assert_eq!(result.trust_level(), Some(TrustLevel::SemiTrusted));
    }

    #[test]
    fn test_failure_without_session_sets_nothing() {
        let result = reconcile(&failed(), &SessionLookup::NotPresented, "sid", now());
        assert!(result.cookies.is_empty());
        assert_eq!(result.session, None);
    }
}
