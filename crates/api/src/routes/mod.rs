//! API routes

pub mod billing;
pub mod credits;
pub mod generate;
pub mod health;
pub mod referrals;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1
    let mut public_api_routes = Router::new();

    if state.webhooks.is_some() {
        public_api_routes = public_api_routes.route("/billing/webhook", post(billing::webhook));
    }

    // Protected API routes (auth required) - under /api/v1
    let mut protected_api_routes = Router::new()
        // Subscription mirror
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/ensure", post(billing::ensure_subscription))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/grant", post(credits::grant_credits))
        .route("/credits/consume", post(credits::consume_credits))
        // Referrals
        .route("/referrals/code", get(referrals::get_code))
        .route("/referrals/claim", post(referrals::claim))
        // Generation
        .route("/generate", post(generate::generate));

    if state.billing.is_some() {
        protected_api_routes = protected_api_routes
            .route("/subscription/upgrade", post(billing::upgrade_subscription))
            .route("/billing/checkout", post(billing::create_checkout))
            .route("/billing/checkout/finalize", post(billing::finalize_checkout))
            .route("/billing/portal", post(billing::create_portal));
    }

    let protected_api_routes = protected_api_routes
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
