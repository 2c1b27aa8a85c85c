//! Redis-backed session store
//!
//! Sessions are stored as JSON under `huerto:session:<digest>` with a TTL
//! equal to the session lifetime, so redis drops abandoned sessions itself.

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::Duration;

use super::sessions::{Session, SessionStore, SessionStoreError};

const KEY_PREFIX: &str = "huerto:session:";

#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisSessionStore {
    /// Connect to redis at `url`
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, SessionStoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis session store");
        Ok(Self::new(conn, ttl))
    }

    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl_secs: ttl.whole_seconds().max(1) as u64,
        }
    }

    fn key(digest: &str) -> String {
        format!("{}{}", KEY_PREFIX, digest)
    }
}

impl SessionStore for RedisSessionStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Session>, SessionStoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(Self::key(key)).await?;
            raw.map(|json| {
                serde_json::from_str(&json).map_err(|e| SessionStoreError::Serialization(e.to_string()))
            })
            .transpose()
        })
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), SessionStoreError>> {
        Box::pin(async move {
            let json = serde_json::to_string(session)
                .map_err(|e| SessionStoreError::Serialization(e.to_string()))?;
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(Self::key(key), json, self.ttl_secs).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, SessionStoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = conn.del(Self::key(key)).await?;
            Ok(removed > 0)
        })
    }
}

impl From<redis::RedisError> for SessionStoreError {
    fn from(err: redis::RedisError) -> Self {
        SessionStoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sessions::{storage_key, SessionLookup, SessionManager, SessionPolicy};
    use huerto_shared::{Identity, TrustLevel};
    use std::sync::Arc;
    use time::OffsetDateTime;

    #[test]
    fn test_key_layout() {
        assert_eq!(RedisSessionStore::key("abc"), "huerto:session:abc");
    }

    #[tokio::test]
    #[ignore] // Requires a running redis (REDIS_URL)
    async fn test_redis_session_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store = RedisSessionStore::connect(&url, Duration::hours(24)).await.unwrap();
        let manager = SessionManager::new(Arc::new(store.clone()), SessionPolicy::default());
        // Whole seconds: stored timestamps have second precision
        let now = OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp()).unwrap();

        let created = manager
            .create("redis-test-sid", &Identity::uid_only("abc123"), TrustLevel::Verified, now)
            .await
            .unwrap();
        assert_eq!(
            manager.lookup(Some("redis-test-sid"), now).await,
            SessionLookup::Active(created)
        );

        assert!(manager.invalidate("redis-test-sid").await.unwrap());
        assert_eq!(store.load(&storage_key("redis-test-sid")).await.unwrap(), None);
    }
}
