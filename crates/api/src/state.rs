//! Application state shared by all handlers

use std::sync::Arc;

use crate::auth::{
    AuthState, DisabledVerifier, IdentityResolver, MemorySessionStore, RedisSessionStore,
    RemoteTokenVerifier, SessionManager, SessionStore, SessionStoreError, SharedSecretVerifier,
    TokenVerifier,
};
use crate::config::{Config, SessionBackend};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthState,
}

impl AppState {
    /// Build the state with the verifier and session backend the config asks for
    pub async fn from_config(config: Config) -> Result<Self, SessionStoreError> {
        let verifier = verifier_from_config(&config);

        let store: Arc<dyn SessionStore> = match config.session_backend {
            SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
            SessionBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| SessionStoreError::Backend("REDIS_URL not configured".to_string()))?;
                Arc::new(RedisSessionStore::connect(url, config.session_policy().ttl).await?)
            }
        };

        Ok(Self::new(config, verifier, store))
    }

    pub fn new(config: Config, verifier: Arc<dyn TokenVerifier>, store: Arc<dyn SessionStore>) -> Self {
        let resolver = IdentityResolver::new(verifier, config.verifier_timeout())
            .with_dev_bypass(config.dev_bypass())
            .with_site_host(config.public_host());
        let sessions = SessionManager::new(store, config.session_policy());
        let auth = AuthState::new(resolver, sessions, config.secure_cookies());

        Self {
            config: Arc::new(config),
            auth,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}

/// Local HS256 verification when a shared secret is configured, else the
/// provider's account lookup, else nothing
fn verifier_from_config(config: &Config) -> Arc<dyn TokenVerifier> {
    if !config.identity_jwt_secret.is_empty() {
        tracing::info!("Verifying identity tokens locally (HS256)");
        return Arc::new(SharedSecretVerifier::new(
            &config.identity_jwt_secret,
            &config.identity_jwt_audience,
        ));
    }
    if !config.identity_provider_api_key.is_empty() {
        tracing::info!(provider = %config.identity_provider_url, "Verifying identity tokens remotely");
        return Arc::new(RemoteTokenVerifier::new(
            &config.identity_provider_url,
            &config.identity_provider_api_key,
            config.verifier_timeout(),
        ));
    }
    tracing::warn!("No identity provider configured: tokens cannot be verified");
    Arc::new(DisabledVerifier)
}
