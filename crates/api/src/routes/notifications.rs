//! Gateway notification intake
//!
//! PayPal IPN posts and Stripe webhooks land here, get verified against the
//! gateway, and flow through normalization into the reconciliation engine.
//!
//! Status codes drive provider retry behavior: 200 acknowledges (including
//! events we understand but ignore), 401 rejects a failed verification, and
//! 503 asks for redelivery when verification itself was unreachable.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sitebill_billing::gateway::stripe::verify_webhook_signature;
use sitebill_billing::normalize;
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IpnParams {
    /// Shared secret from the notify URL, checked before verification
    pub pass: Option<String>,
}

/// POST /ipn/paypal
///
/// Body is the raw IPN form post. It is echoed back to PayPal for
/// verification before anything is parsed out of it.
pub async fn paypal_ipn(
    State(state): State<AppState>,
    Query(params): Query<IpnParams>,
    body: String,
) -> ApiResult<StatusCode> {
    let billing = &state.billing;

    if let Some(expected) = &state.config.paypal_ipn_password {
        if params.pass.as_deref() != Some(expected.as_str()) {
            tracing::warn!("IPN post with missing or wrong notify-URL password");
            return Err(ApiError::Unauthorized);
        }
    }

    let Some(paypal) = &billing.paypal else {
        return Err(ApiError::BadRequest("PayPal is not configured".to_string()));
    };
    paypal.verify_ipn(&body).await?;

    let fields = normalize::paypal::parse_ipn_body(&body);
    let payload = serde_json::to_value(&fields).unwrap_or_else(|_| json!({}));

    // Record the verified payload before touching it: a processing failure
    // must not lose the notification, only leave it at "received" for the
    // provider's redelivery to complete.
    let note_id = billing
        .store
        .log_notification("paypal", &payload, "received")
        .await?;

    let Some(event) = normalize::paypal::normalize(&fields, OffsetDateTime::now_utc()) else {
        tracing::debug!(
            txn_type = fields.get("txn_type").map(String::as_str),
            payment_status = fields.get("payment_status").map(String::as_str),
            "IPN carries nothing actionable"
        );
        billing.store.set_notification_outcome(note_id, "ignored").await?;
        return Ok(StatusCode::OK);
    };

    let outcome = billing.engine.process(&event).await?;
    billing
        .store
        .set_notification_outcome(note_id, outcome.as_str())
        .await?;

    Ok(StatusCode::OK)
}

/// POST /webhooks/stripe
///
/// Signature is verified over the raw body before JSON parsing.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = &state.billing;

    let Some(secret) = &billing.stripe_webhook_secret else {
        return Err(ApiError::BadRequest("Stripe is not configured".to_string()));
    };
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    verify_webhook_signature(&body, signature, secret, OffsetDateTime::now_utc())?;

    let payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook JSON: {e}")))?;

    // Durably record before processing; see paypal_ipn
    let note_id = billing
        .store
        .log_notification("stripe", &payload, "received")
        .await?;

    let Some(event) = normalize::stripe::normalize(&payload) else {
        tracing::debug!(
            event_type = payload.get("type").and_then(|t| t.as_str()),
            "Webhook event type not handled"
        );
        billing.store.set_notification_outcome(note_id, "ignored").await?;
        return Ok(Json(json!({ "received": true })));
    };

    let outcome = billing.engine.process(&event).await?;
    billing
        .store
        .set_notification_outcome(note_id, outcome.as_str())
        .await?;

    Ok(Json(json!({ "received": true })))
}
