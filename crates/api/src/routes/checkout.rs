//! Checkout endpoints

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use sitebill_billing::{CheckoutCompletion, CheckoutRedirect, StartCheckout};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// POST /checkout
///
/// Creates a checkout intent and returns the provider redirect URL.
pub async fn start_checkout(
    State(state): State<AppState>,
    Json(req): Json<StartCheckout>,
) -> ApiResult<Json<CheckoutRedirect>> {
    let redirect = state.billing.checkout.start(&req).await?;
    Ok(Json(redirect))
}

#[derive(Debug, Deserialize)]
pub struct PayPalReturnParams {
    pub intent: Uuid,
    /// PayPal appends the payer on approval
    #[serde(rename = "PayerID")]
    pub payer_id: Option<String>,
}

/// GET /checkout/paypal/return
///
/// PayPal sends the customer back here after approving the checkout; this
/// is where the charge is captured and the recurring profile created.
pub async fn paypal_return(
    State(state): State<AppState>,
    Query(params): Query<PayPalReturnParams>,
) -> ApiResult<Json<CheckoutCompletion>> {
    let completion = state
        .billing
        .checkout
        .complete_paypal_return(params.intent, params.payer_id.as_deref())
        .await?;
    Ok(Json(completion))
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub intent: Uuid,
}

/// GET /checkout/cancelled
///
/// Provider cancel URL; closes the intent if the charge never happened.
pub async fn checkout_cancelled(
    State(state): State<AppState>,
    Query(params): Query<CancelParams>,
) -> ApiResult<Json<CheckoutCompletion>> {
    let completion = state.billing.checkout.cancel(params.intent).await?;
    Ok(Json(completion))
}

#[derive(Debug, Deserialize)]
pub struct StripeSuccessParams {
    pub intent: Uuid,
}

/// GET /checkout/stripe/success
///
/// Confirms the session paid; tenant state itself is driven by webhooks.
pub async fn stripe_success(
    State(state): State<AppState>,
    Query(params): Query<StripeSuccessParams>,
) -> ApiResult<Json<CheckoutCompletion>> {
    let completion = state
        .billing
        .checkout
        .confirm_stripe_success(params.intent)
        .await?;
    Ok(Json(completion))
}
