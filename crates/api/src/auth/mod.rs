//! Identity resolution and session reconciliation for HuertoRentable

pub mod cookies;
pub mod credentials;
pub mod gate;
pub mod jwt;
pub mod middleware;
pub mod reconciler;
pub mod redis_store;
pub mod resolver;
pub mod sessions;
pub mod verifier;

pub use cookies::{BackupData, CookieDirective, CookieError, CookieSet};
pub use credentials::{Credential, CredentialOrigin, CredentialSet};
pub use gate::{Capability, Decision, DenyReason};
pub use jwt::SharedSecretVerifier;
pub use middleware::{authenticate, protect, AuthGuard, AuthState};
pub use reconciler::{reconcile, Reconciliation, SessionAction};
pub use redis_store::RedisSessionStore;
pub use resolver::{DevBypass, FailureReason, IdentityResolver, Resolution};
pub use sessions::{
    MemorySessionStore, Session, SessionLookup, SessionManager, SessionPolicy, SessionStore,
    SessionStoreError,
};
pub use verifier::{DisabledVerifier, RemoteTokenVerifier, TokenVerifier, VerifiedIdentity, VerifyError};
