//! API routes

pub mod auth;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{protect, Capability},
    state::AppState,
};

/// Create all routes.
///
/// `app_routes` are the application's own handlers (crops, analytics,
/// exports). They are mounted behind the `Authenticated` gate; routes that
/// need a plan can be wrapped with [`protect`] and `Capability::Plan` before
/// being passed in.
pub fn create_router(state: AppState, app_routes: Router<AppState>) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (infrastructure monitoring, no identity)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Explicit login step: verifies the token itself
    let handshake_api_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/register", post(auth::register))
        .route("/auth/logout", post(auth::logout));

    // Pages that are part of signing in; never denied
    let handshake_pages = protect(
        Router::new()
            .route("/onboarding", get(auth::onboarding))
            .route("/login", get(auth::login_page))
            .route("/register", get(auth::register_page)),
        &auth_state,
        Capability::Handshake,
    );

    let public_routes = protect(
        Router::new().route("/auth/session", get(auth::session)),
        &auth_state,
        Capability::Public,
    );

    let protected_routes = protect(
        Router::new()
            .route("/auth/me", get(auth::me))
            .route("/upgrade", get(auth::upgrade_page))
            .merge(app_routes),
        &auth_state,
        Capability::Authenticated,
    );

    Router::new()
        .merge(health_routes)
        .merge(handshake_api_routes)
        .merge(handshake_pages)
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
