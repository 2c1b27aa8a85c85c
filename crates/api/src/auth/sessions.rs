//! Server-side sessions
//!
//! Sessions are keyed by an opaque id carried in the session cookie. Stores
//! only ever see the SHA-256 digest of that id. Validity is a rolling window:
//! a session read more than an hour after its last refresh is touched, and a
//! session older than 24h is removed and treated as absent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use huerto_shared::{Identity, Plan, TrustLevel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use super::cookies::BackupData;
use super::reconciler::{Reconciliation, SessionAction};

/// Default session validity window (24h)
pub const DEFAULT_SESSION_TTL: Duration = Duration::hours(24);
/// Default age after which a read refreshes the session (1h)
pub const DEFAULT_REFRESH_AFTER: Duration = Duration::hours(1);

/// Session lifetime policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub ttl: Duration,
    pub refresh_after: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            refresh_after: DEFAULT_REFRESH_AFTER,
        }
    }
}

/// Server-side session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    pub authenticated: bool,
    /// Stored at session grade (see [`TrustLevel::session_grade`])
    pub trust_level: TrustLevel,
    #[serde(with = "time::serde::timestamp")]
    pub login_timestamp: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub last_refresh: OffsetDateTime,
}

impl Session {
    /// New authenticated session for a resolved identity
    pub fn from_identity(identity: &Identity, trust_level: TrustLevel, now: OffsetDateTime) -> Self {
        Self {
            uid: identity.uid.clone(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            plan: identity.plan,
            authenticated: true,
            trust_level: trust_level.session_grade(),
            login_timestamp: now,
            last_refresh: now,
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.login_timestamp
    }

    /// Authenticated and no older than the policy ttl
    pub fn is_valid_at(&self, now: OffsetDateTime, policy: &SessionPolicy) -> bool {
        self.authenticated && self.age(now) <= policy.ttl
    }

    /// Valid, and old enough that reading it should roll the window forward
    pub fn needs_refresh(&self, now: OffsetDateTime, policy: &SessionPolicy) -> bool {
        self.is_valid_at(now, policy) && self.age(now) > policy.refresh_after
    }

    /// Roll the validity window forward
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.login_timestamp = now;
        self.last_refresh = now;
    }

    pub fn identity(&self) -> Identity {
        Identity {
            uid: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            email_verified: false,
            plan: self.plan,
            provenance: None,
        }
    }

    /// Whether this session already holds exactly what `identity` at
    /// `trust_level` would write
    pub fn matches(&self, identity: &Identity, trust_level: TrustLevel) -> bool {
        self.authenticated
            && self.uid == identity.uid
            && self.email == identity.email
            && self.display_name == identity.display_name
            && self.plan == identity.plan
            && self.trust_level == trust_level.session_grade()
    }

    pub fn backup_data(&self) -> BackupData {
        BackupData {
            uid: self.uid.clone(),
            email: self.email.clone(),
            name: self.display_name.clone(),
            plan: self.plan,
            authenticated: self.authenticated,
        }
    }
}

/// Outcome of looking up the session named by a request's session cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// The request carried no session cookie
    NotPresented,
    /// A session id was presented but the store has no record of it
    Missing,
    /// The session existed but was void (too old or not authenticated);
    /// it has been removed
    Expired,
    /// Valid, no write needed
    Active(Session),
    /// Valid and its window has just been rolled forward
    Refreshed(Session),
}

impl SessionLookup {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Active(session) | Self::Refreshed(session) => Some(session),
            _ => None,
        }
    }

    /// Whether the request referred to a session that no longer exists
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Missing | Self::Expired)
    }
}

/// Storage backend for sessions, keyed by session id digest
pub trait SessionStore: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Session>, SessionStoreError>>;

    fn save<'a>(
        &'a self,
        key: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), SessionStoreError>>;

    /// Returns whether a session was removed
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, SessionStoreError>>;

    /// Drop sessions older than `ttl`. Backends with native expiry do nothing.
    fn purge_expired(&self, _now: OffsetDateTime, _ttl: Duration) -> usize {
        0
    }
}

/// In-process session store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Session>, SessionStoreError>> {
        let result = self
            .sessions
            .read()
            .map(|sessions| sessions.get(key).cloned())
            .map_err(|_| SessionStoreError::Poisoned);
        Box::pin(futures::future::ready(result))
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), SessionStoreError>> {
        let result = self
            .sessions
            .write()
            .map(|mut sessions| {
                sessions.insert(key.to_string(), session.clone());
            })
            .map_err(|_| SessionStoreError::Poisoned);
        Box::pin(futures::future::ready(result))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, SessionStoreError>> {
        let result = self
            .sessions
            .write()
            .map(|mut sessions| sessions.remove(key).is_some())
            .map_err(|_| SessionStoreError::Poisoned);
        Box::pin(futures::future::ready(result))
    }

    fn purge_expired(&self, now: OffsetDateTime, ttl: Duration) -> usize {
        let Ok(mut sessions) = self.sessions.write() else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|_, session| session.age(now) <= ttl);
        before - sessions.len()
    }
}

/// Session lifecycle on top of a [`SessionStore`]
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    /// Manager over a fresh in-memory store
    pub fn in_memory(policy: SessionPolicy) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), policy)
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Look up a session, applying the lifecycle rules: void sessions are
    /// removed, sessions past the refresh threshold are touched.
    ///
    /// Store failures are logged and reported as `Missing` so that a flaky
    /// backend degrades to the cookie fallbacks instead of failing requests.
    pub async fn lookup(&self, session_id: Option<&str>, now: OffsetDateTime) -> SessionLookup {
        let Some(session_id) = session_id else {
            return SessionLookup::NotPresented;
        };
        let key = storage_key(session_id);

        let mut session = match self.store.load(&key).await {
            Ok(Some(session)) => session,
            Ok(None) => return SessionLookup::Missing,
            Err(e) => {
                tracing::warn!(error = %e, "Session store load failed, treating session as absent");
                return SessionLookup::Missing;
            }
        };

        if !session.is_valid_at(now, &self.policy) {
            tracing::info!(
                uid = %session.uid,
                age_secs = session.age(now).whole_seconds(),
                "Session expired"
            );
            if let Err(e) = self.store.remove(&key).await {
                tracing::warn!(error = %e, "Failed to remove expired session");
            }
            return SessionLookup::Expired;
        }

        if session.needs_refresh(now, &self.policy) {
            session.touch(now);
            if let Err(e) = self.store.save(&key, &session).await {
                tracing::warn!(error = %e, uid = %session.uid, "Failed to persist session refresh");
            }
            tracing::debug!(uid = %session.uid, "Session refreshed");
            return SessionLookup::Refreshed(session);
        }

        SessionLookup::Active(session)
    }

    /// Create (or replace) the session stored under `session_id`
    pub async fn create(
        &self,
        session_id: &str,
        identity: &Identity,
        trust_level: TrustLevel,
        now: OffsetDateTime,
    ) -> Result<Session, SessionStoreError> {
        let purged = self.store.purge_expired(now, self.policy.ttl);
        if purged > 0 {
            tracing::debug!(count = purged, "Purged expired sessions");
        }

        let session = Session::from_identity(identity, trust_level, now);
        self.store.save(&storage_key(session_id), &session).await?;
        tracing::info!(
            uid = %session.uid,
            trust = %session.trust_level,
            plan = %session.plan,
            "Session created"
        );
        Ok(session)
    }

    /// Roll a session's window forward and persist it
    pub async fn touch(
        &self,
        session_id: &str,
        session: &mut Session,
        now: OffsetDateTime,
    ) -> Result<(), SessionStoreError> {
        session.touch(now);
        self.store.save(&storage_key(session_id), session).await
    }

    /// Explicit logout. Returns whether a session was removed.
    pub async fn invalidate(&self, session_id: &str) -> Result<bool, SessionStoreError> {
        let removed = self.store.remove(&storage_key(session_id)).await?;
        tracing::info!(removed, "Session invalidated");
        Ok(removed)
    }

    /// Persist the outcome of a reconciliation. Failures are logged only:
    /// the mirrored cookies still go out and can rebuild the session later.
    pub async fn apply(&self, session_id: &str, reconciliation: &Reconciliation) {
        let (SessionAction::Write, Some(session)) = (&reconciliation.action, &reconciliation.session) else {
            return;
        };
        match self.store.save(&storage_key(session_id), session).await {
            Ok(()) => tracing::info!(
                uid = %session.uid,
                trust = %session.trust_level,
                plan = %session.plan,
                "Session written"
            ),
            Err(e) => tracing::warn!(error = %e, uid = %session.uid, "Failed to persist session"),
        }
    }
}

/// New random session id: 32 bytes, hex encoded (64 characters)
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Digest under which a session id is stored
pub fn storage_key(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("Session store lock poisoned")]
    Poisoned,
    #[error("Session backend error: {0}")]
    Backend(String),
    #[error("Session serialization failed: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000 + secs).unwrap()
    }

    fn identity() -> Identity {
        Identity::uid_only("abc123").with_plan(Plan::Premium)
    }

    fn session_aged(age: Duration, now: OffsetDateTime) -> Session {
        let mut session = Session::from_identity(&identity(), TrustLevel::Verified, now);
        session.login_timestamp = now - age;
        session.last_refresh = now - age;
        session
    }

    async fn seeded(session: &Session) -> (SessionManager, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        store.save(&storage_key("sid"), session).await.unwrap();
        (SessionManager::new(store.clone(), SessionPolicy::default()), store)
    }

    #[test]
    fn test_session_id_generation() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_storage_key_is_digest() {
        let key = storage_key("sid");
        assert_eq!(key, storage_key("sid"));
        assert_ne!(key, "sid");
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn test_verified_stored_as_trusted() {
        let session = Session::from_identity(&identity(), TrustLevel::Verified, at(0));
        assert_eq!(session.trust_level, TrustLevel::Trusted);
        assert!(session.authenticated);
        assert_eq!(session.plan, Plan::Premium);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = at(0);
        let policy = SessionPolicy::default();

        let just_inside = session_aged(Duration::hours(24) - Duration::seconds(1), now);
        assert!(just_inside.is_valid_at(now, &policy));

        let just_outside = session_aged(Duration::hours(24) + Duration::seconds(1), now);
        assert!(!just_outside.is_valid_at(now, &policy));
    }

    #[test]
    fn test_refresh_threshold() {
        let now = at(0);
        let policy = SessionPolicy::default();
        assert!(!session_aged(Duration::minutes(30), now).needs_refresh(now, &policy));
        assert!(!session_aged(Duration::hours(1), now).needs_refresh(now, &policy));
        assert!(session_aged(Duration::hours(2), now).needs_refresh(now, &policy));
        assert!(!session_aged(Duration::hours(25), now).needs_refresh(now, &policy));
    }

    #[test]
    fn test_unauthenticated_session_is_void() {
        let now = at(0);
        let mut session = session_aged(Duration::minutes(5), now);
        session.authenticated = false;
        assert!(!session.is_valid_at(now, &SessionPolicy::default()));
    }

    #[tokio::test]
    async fn test_lookup_not_presented() {
        let manager = SessionManager::in_memory(SessionPolicy::default());
        assert_eq!(manager.lookup(None, at(0)).await, SessionLookup::NotPresented);
        assert_eq!(manager.lookup(Some("unknown"), at(0)).await, SessionLookup::Missing);
    }

    #[tokio::test]
    async fn test_lookup_fresh_session_no_write() {
        let now = at(0);
        let session = session_aged(Duration::minutes(10), now);
        let (manager, store) = seeded(&session).await;

        assert_eq!(manager.lookup(Some("sid"), now).await, SessionLookup::Active(session.clone()));
        let stored = store.load(&storage_key("sid")).await.unwrap().unwrap();
        assert_eq!(stored.login_timestamp, session.login_timestamp);
    }

    #[tokio::test]
    async fn test_lookup_refreshes_old_session() {
        let now = at(0);
        let session = session_aged(Duration::hours(3), now);
        let (manager, store) = seeded(&session).await;

        match manager.lookup(Some("sid"), now).await {
            SessionLookup::Refreshed(refreshed) => {
                assert_eq!(refreshed.login_timestamp, now);
                assert_eq!(refreshed.last_refresh, now);
            }
            other => panic!("expected Refreshed, got {:?}", other),
        }
        let stored = store.load(&storage_key("sid")).await.unwrap().unwrap();
        assert_eq!(stored.login_timestamp, now);
    }

    #[tokio::test]
    async fn test_lookup_expired_session_removed() {
        let now = at(0);
        let session = session_aged(Duration::hours(24) + Duration::seconds(1), now);
        let (manager, store) = seeded(&session).await;

        assert_eq!(manager.lookup(Some("sid"), now).await, SessionLookup::Expired);
        assert!(store.is_empty());
        assert_eq!(manager.lookup(Some("sid"), now).await, SessionLookup::Missing);
    }

    #[tokio::test]
    async fn test_create_and_invalidate() {
        let manager = SessionManager::in_memory(SessionPolicy::default());
        let now = at(0);

        let created = manager
            .create("sid", &identity(), TrustLevel::SemiTrusted, now)
            .await
            .unwrap();
        assert_eq!(created.trust_level, TrustLevel::SemiTrusted);
        assert_eq!(manager.lookup(Some("sid"), now).await, SessionLookup::Active(created));

        assert!(manager.invalidate("sid").await.unwrap());
        assert!(!manager.invalidate("sid").await.unwrap());
        assert_eq!(manager.lookup(Some("sid"), now).await, SessionLookup::Missing);
    }

    #[tokio::test]
    async fn test_touch_persists() {
        let manager = SessionManager::in_memory(SessionPolicy::default());
        let mut session = manager
            .create("sid", &identity(), TrustLevel::Trusted, at(0))
            .await
            .unwrap();

        manager.touch("sid", &mut session, at(7200)).await.unwrap();
        match manager.lookup(Some("sid"), at(7200)).await {
            SessionLookup::Active(stored) => assert_eq!(stored.login_timestamp, at(7200)),
            other => panic!("expected Active, got {:?}", other),
        }
    }

    #[test]
    fn test_purge_expired() {
        let store = MemorySessionStore::new();
        let now = at(0);
        let fresh = session_aged(Duration::hours(1), now);
        let stale = session_aged(Duration::hours(30), now);
        futures::executor::block_on(async {
            store.save("a", &fresh).await.unwrap();
            store.save("b", &stale).await.unwrap();
        });

        assert_eq!(store.purge_expired(now, DEFAULT_SESSION_TTL), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_session_serde_round_trip() {
        let session = Session::from_identity(&identity(), TrustLevel::SemiTrusted, at(0));
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
