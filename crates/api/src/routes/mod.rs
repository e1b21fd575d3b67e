//! API routes

pub mod checkout;
pub mod health;
pub mod notifications;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks (root level for infrastructure monitoring)
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Gateway notification intake
        .route("/ipn/paypal", post(notifications::paypal_ipn))
        .route("/webhooks/stripe", post(notifications::stripe_webhook))
        // Checkout
        .route("/checkout", post(checkout::start_checkout))
        .route("/checkout/paypal/return", get(checkout::paypal_return))
        .route("/checkout/cancelled", get(checkout::checkout_cancelled))
        .route("/checkout/stripe/success", get(checkout::stripe_success))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
