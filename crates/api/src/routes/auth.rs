//! Authentication routes
//!
//! The explicit login step (`/auth/login`, `/auth/register`) verifies the
//! provider token directly and does not fall back to weaker signals. All
//! other routes read the resolution the middleware attached.

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use huerto_shared::{AuthUser, Identity, Plan, Provenance, TrustLevel};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::{
        cookies::{self, SESSION_COOKIE},
        sessions::generate_session_id,
        verifier::verify_with_timeout,
        CookieSet, Resolution, Session,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLoginRequest {
    pub id_token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub plan: Plan,
}

impl From<&Session> for SessionUser {
    fn from(session: &Session) -> Self {
        Self {
            uid: session.uid.clone(),
            email: session.email.clone(),
            name: session.display_name.clone(),
            plan: session.plan,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user: SessionUser,
    pub redirect: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub authenticated: bool,
    pub uid: Option<String>,
    pub plan: Option<Plan>,
    pub trust_level: Option<TrustLevel>,
    pub source: Option<&'static str>,
    /// Why resolution failed, when it did
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct PageResponse {
    pub page: &'static str,
    pub authenticated: bool,
    pub uid: Option<String>,
}

// =============================================================================
// Handshake API
// =============================================================================

/// Sign in with a provider id token
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenLoginRequest>,
) -> ApiResult<Response> {
    establish_session(&state, &headers, &req.id_token, Provenance::Login).await
}

/// First sign in after creating the account with the provider
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenLoginRequest>,
) -> ApiResult<Response> {
    establish_session(&state, &headers, &req.id_token, Provenance::Register).await
}

async fn establish_session(
    state: &AppState,
    headers: &HeaderMap,
    id_token: &str,
    provenance: Provenance,
) -> ApiResult<Response> {
    let id_token = id_token.trim();
    if id_token.is_empty() {
        return Err(ApiError::Validation("idToken is required".to_string()));
    }

    let resolver = &state.auth.resolver;
    let verified = verify_with_timeout(resolver.verifier(), id_token, resolver.verifier_timeout())
        .await
        .map_err(|e| {
            tracing::info!(error = %e, from = %provenance, "Login token rejected");
            ApiError::from(e)
        })?;

    let now = OffsetDateTime::now_utc();
    let sessions = &state.auth.sessions;

    // The previous session, if any, is replaced. Its plan carries over when
    // the token has no plan claim and it belonged to the same user.
    let previous_id = cookies::get_cookie(headers, SESSION_COOKIE);
    let previous_plan = match previous_id.as_deref() {
        Some(id) => {
            let plan = sessions
                .lookup(Some(id), now)
                .await
                .session()
                .filter(|s| s.uid == verified.uid)
                .map(|s| s.plan);
            if let Err(e) = sessions.invalidate(id).await {
                tracing::warn!(error = %e, "Failed to invalidate previous session");
            }
            plan
        }
        None => None,
    };

    let identity: Identity = verified
        .into_identity(previous_plan.unwrap_or_default())
        .with_provenance(Some(provenance));

    // A store outage does not fail the login: the mirrored cookies still
    // carry the user until the store is back
    let session_id = generate_session_id();
    let session = match sessions.create(&session_id, &identity, TrustLevel::Verified, now).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, uid = %identity.uid, "Failed to store session, continuing with cookies only");
            Session::from_identity(&identity, TrustLevel::Verified, now)
        }
    };

    let mut cookie_set = CookieSet::mirror(&session_id, &session.backup_data()).map_err(|e| {
        tracing::error!(error = %e, "Failed to encode session cookies");
        ApiError::Internal
    })?;
    cookie_set.push(CookieSet::id_token(id_token));

    tracing::info!(uid = %session.uid, plan = %session.plan, from = %provenance, "User signed in");

    let redirect = format!(
        "/dashboard?from={}&uid={}",
        provenance,
        urlencoding::encode(&session.uid)
    );
    let mut response = Json(LoginResponse {
        success: true,
        user: SessionUser::from(&session),
        redirect,
    })
    .into_response();
    cookie_set.apply_to(response.headers_mut(), state.auth.secure_cookies);
    Ok(response)
}

/// Logout: drop the server session and every mirrored cookie
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(session_id) = cookies::get_cookie(&headers, SESSION_COOKIE) {
        if let Err(e) = state.auth.sessions.invalidate(&session_id).await {
            tracing::warn!(error = %e, "Failed to invalidate session on logout");
        }
    }

    let mut response = Json(SuccessResponse { success: true }).into_response();
    CookieSet::clear_all().apply_to(response.headers_mut(), state.auth.secure_cookies);
    response
}

// =============================================================================
// Resolved-identity routes
// =============================================================================

/// What the server currently knows about the caller
pub async fn session(Extension(resolution): Extension<Resolution>) -> Json<SessionStatusResponse> {
    Json(SessionStatusResponse {
        authenticated: resolution.is_resolved(),
        uid: resolution.identity().map(|i| i.uid.clone()),
        plan: resolution.plan(),
        trust_level: resolution.trust_level(),
        source: resolution.source().map(|s| s.as_str()),
        reason: resolution.failure_reason().map(|r| r.as_str()),
    })
}

/// Get current user
pub async fn me(Extension(user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(user)
}

// Page placeholders; rendering is done by the frontend.

pub async fn onboarding(user: Option<Extension<AuthUser>>) -> Json<PageResponse> {
    page("onboarding", user)
}

pub async fn login_page(user: Option<Extension<AuthUser>>) -> Json<PageResponse> {
    page("login", user)
}

pub async fn register_page(user: Option<Extension<AuthUser>>) -> Json<PageResponse> {
    page("register", user)
}

pub async fn upgrade_page(user: Option<Extension<AuthUser>>) -> Json<PageResponse> {
    page("upgrade", user)
}

fn page(name: &'static str, user: Option<Extension<AuthUser>>) -> Json<PageResponse> {
    let uid = user.map(|Extension(u)| u.uid);
    Json(PageResponse {
        page: name,
        authenticated: uid.is_some(),
        uid,
    })
}
