//! Authentication middleware
//!
//! Runs the whole identity pipeline once per request: extract signals, look
//! up the server session, resolve, reconcile, then gate on the route's
//! capability. Handlers behind it read the outcome from request extensions
//! ([`AuthUser`](huerto_shared::AuthUser) when resolved, [`Resolution`]
//! always) and never look at cookies or parameters themselves.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use time::OffsetDateTime;

use super::credentials;
use super::gate::{self, Capability, Decision, DenyReason};
use super::reconciler::reconcile;
use super::resolver::{FailureReason, IdentityResolver, Resolution};
use super::sessions::{generate_session_id, SessionLookup, SessionManager};
use crate::error::ApiError;

/// Largest urlencoded form body buffered to look for a `uid` field
pub const FORM_BODY_LIMIT: usize = 64 * 1024;

/// Shared authentication state
#[derive(Clone)]
pub struct AuthState {
    pub resolver: Arc<IdentityResolver>,
    pub sessions: SessionManager,
    /// Add `Secure` to every cookie (public URL is https)
    pub secure_cookies: bool,
}

impl AuthState {
    pub fn new(resolver: IdentityResolver, sessions: SessionManager, secure_cookies: bool) -> Self {
        Self {
            resolver: Arc::new(resolver),
            sessions,
            secure_cookies,
        }
    }
}

/// Middleware state: the auth state plus the capability of the routes it
/// guards
#[derive(Clone)]
pub struct AuthGuard {
    pub auth: AuthState,
    pub capability: Capability,
}

/// Put every route of `router` behind the auth middleware with `capability`
pub fn protect<S>(router: Router<S>, auth: &AuthState, capability: Capability) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let guard = AuthGuard {
        auth: auth.clone(),
        capability,
    };
    router.layer(middleware::from_fn_with_state(guard, authenticate))
}

pub async fn authenticate(State(guard): State<AuthGuard>, request: Request, next: Next) -> Response {
    let AuthGuard { auth, capability } = guard;

    // An outer guard already resolved this request: only the gate runs again
    if let Some(resolution) = request.extensions().get::<Resolution>().cloned() {
        return match gate::check(&resolution, capability) {
            Decision::Deny(reason) => deny_response(request.headers(), &reason, &resolution),
            Decision::Allow | Decision::Defer => next.run(request).await,
        };
    }

    let (mut parts, body) = request.into_parts();

    // uid may travel in a form post; the body is buffered and handed back
    let (form, body) = if is_form(&parts.headers) {
        match axum::body::to_bytes(body, FORM_BODY_LIMIT).await {
            Ok(bytes) => (
                Some(String::from_utf8_lossy(&bytes).into_owned()),
                Body::from(bytes),
            ),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to buffer form body");
                return ApiError::BadRequest("Request body too large or unreadable".to_string())
                    .into_response();
            }
        }
    } else {
        (None, body)
    };

    let mut credentials = credentials::extract(&parts.headers, parts.uri.query(), form.as_deref());
    let now = OffsetDateTime::now_utc();

    let presented_id = credentials.session_id().map(str::to_string);
    let lookup = auth.sessions.lookup(presented_id.as_deref(), now).await;
    credentials.attach_server_session(lookup.session().cloned());
    if lookup == SessionLookup::Expired {
        credentials.mark_session_expired();
    }

    let resolution = auth.resolver.resolve(&credentials).await;

    // Reuse the id only for a live session; anything else gets a fresh one
    let session_id = match (presented_id, lookup.session()) {
        (Some(id), Some(_)) => id,
        _ => generate_session_id(),
    };
    let reconciliation = reconcile(&resolution, &lookup, &session_id, now);
    auth.sessions.apply(&session_id, &reconciliation).await;

    let mut response = match gate::check(&resolution, capability) {
        Decision::Allow => {
            if let Some(user) = resolution.auth_user() {
                parts.extensions.insert(user);
            }
            parts.extensions.insert(resolution);
            next.run(Request::from_parts(parts, body)).await
        }
        Decision::Defer => {
            tracing::debug!(path = %parts.uri.path(), "Deferring unauthenticated request");
            parts.extensions.insert(resolution);
            next.run(Request::from_parts(parts, body)).await
        }
        Decision::Deny(reason) => deny_response(&parts.headers, &reason, &resolution),
    };

    reconciliation
        .cookies
        .apply_to(response.headers_mut(), auth.secure_cookies);
    response
}

/// Render a gate denial: JSON for API clients, a redirect for browsers
pub fn deny_response(headers: &HeaderMap, reason: &DenyReason, resolution: &Resolution) -> Response {
    let redirect = reason.redirect();

    if !wants_json(headers) {
        return (StatusCode::FOUND, [(header::LOCATION, redirect)]).into_response();
    }

    let (status, detail) = match reason {
        DenyReason::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            resolution
                .failure_reason()
                .unwrap_or(FailureReason::NoCredential)
                .as_str(),
        ),
        DenyReason::PlanInsufficient { .. } => (StatusCode::FORBIDDEN, reason.code()),
    };

    let body = Json(json!({
        "error": reason.message(),
        "redirect": redirect,
        "reason": detail,
    }));
    (status, body).into_response()
}

/// Whether the client expects JSON rather than a page
pub fn wants_json(headers: &HeaderMap) -> bool {
    let accepts_json = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("application/json"));
    let is_xhr = headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
        .unwrap_or(false);
    accepts_json || is_xhr
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}
