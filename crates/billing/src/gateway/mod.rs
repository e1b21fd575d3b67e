//! Payment gateway adapters
//!
//! Each provider implements [`Gateway`]; everything above this module works
//! in terms of the trait and canonical types. Adapters are registered in a
//! [`GatewayRegistry`] keyed by slug.

pub mod paypal;
pub mod stripe;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitebill_shared::TenantId;
use thiserror::Error;
use time::OffsetDateTime;

pub use paypal::PayPalGateway;
pub use stripe::StripeGateway;

/// Classification of gateway failures, used to decide retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayErrorCode {
    /// Credentials rejected by the provider
    Authentication,
    /// Network / 5xx / timeout; safe to retry
    Transient,
    /// The charge was declined
    Declined,
    /// Request was understood but rejected (bad params, state conflict)
    Validation,
    /// Response did not match the provider's documented shape
    Protocol,
}

/// Error returned by gateway adapters
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct GatewayError {
    pub code: GatewayErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl GatewayError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            code: GatewayErrorCode::Authentication,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: GatewayErrorCode::Transient,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            code: GatewayErrorCode::Declined,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: GatewayErrorCode::Validation,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: GatewayErrorCode::Protocol,
            message: message.into(),
            retryable: false,
        }
    }
}

/// How a checkout begins on the provider side
#[derive(Debug, Clone)]
pub enum CheckoutStart {
    /// Redirect the customer to the provider's hosted page. `token`
    /// identifies the provider-side session for the completion step.
    Redirect { url: String, token: String },
}

/// A settled (or attempted) charge
#[derive(Debug, Clone)]
pub struct ChargeResult {
    pub txn_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub payer_ref: Option<String>,
    /// Set by providers that create the subscription during checkout
    /// (Stripe Checkout); None when a separate profile-creation call is
    /// needed (PayPal)
    pub subscription_id: Option<String>,
    /// Raw provider payload, logged for audit
    pub raw: serde_json::Value,
}

/// A created recurring profile / subscription
#[derive(Debug, Clone)]
pub struct ProfileResult {
    pub subscription_id: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Active,
    Suspended,
    Cancelled,
    Unknown,
}

/// Provider-side view of a recurring profile, used by the reconciliation
/// sweep to repair divergence
#[derive(Debug, Clone)]
pub struct ProfileStatus {
    pub state: ProfileState,
    pub next_billing_at: Option<OffsetDateTime>,
    pub last_payment_cents: Option<i64>,
}

/// Parameters for starting a checkout
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub intent_id: uuid::Uuid,
    /// Known tenant, when this is a renewal/upgrade checkout
    pub tenant_id: Option<TenantId>,
    pub activation_key: String,
    pub plan_name: String,
    pub level: i32,
    pub term_months: i32,
    pub amount_cents: i64,
    pub currency: String,
    /// Existing provider customer, when the tenant already has one
    pub customer_id: Option<String>,
    /// Whether the checkout sets up recurring billing or collects a
    /// one-time payment for the term
    pub recurring: bool,
}

/// Parameters for creating a recurring profile after a completed checkout
#[derive(Debug, Clone)]
pub struct RecurringProfileRequest {
    pub activation_key: String,
    pub plan_name: String,
    pub level: i32,
    pub term_months: i32,
    pub amount_cents: i64,
    pub currency: String,
    /// Provider checkout token / payer reference from the completed checkout
    pub checkout_token: Option<String>,
    pub payer_ref: Option<String>,
    pub customer_id: Option<String>,
    /// First recurring charge date; the initial term was already paid by
    /// the checkout charge
    pub start_at: OffsetDateTime,
    /// Free trial length before the first recurring charge; 0 disables
    pub trial_days: i32,
    /// One-time setup fee collected with the profile; 0 disables
    pub setup_fee_cents: i64,
}

/// A payment provider adapter
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Stable identifier ("paypal", "stripe") used in storage and routing
    fn slug(&self) -> &'static str;

    /// Begin a checkout on the provider side
    async fn start_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutStart, GatewayError>;

    /// Capture the charge for a checkout the customer approved
    async fn complete_checkout(
        &self,
        token: &str,
        payer_ref: Option<&str>,
        amount_cents: i64,
        currency: &str,
    ) -> Result<ChargeResult, GatewayError>;

    /// Create the recurring profile that bills future terms
    async fn create_recurring_profile(
        &self,
        req: &RecurringProfileRequest,
    ) -> Result<ProfileResult, GatewayError>;

    /// Cancel a recurring profile. Used when a new profile supersedes an
    /// old one and when a tenant cancels.
    async fn cancel_profile(&self, subscription_id: &str, note: &str)
        -> Result<(), GatewayError>;

    /// Refund a settled charge, fully (None) or partially
    async fn refund_charge(
        &self,
        txn_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<(), GatewayError>;

    /// Fetch the provider-side state of a recurring profile
    async fn fetch_profile_status(
        &self,
        subscription_id: &str,
    ) -> Result<ProfileStatus, GatewayError>;
}

/// Registry of configured gateway adapters, keyed by slug
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<&'static str, Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn Gateway>) {
        let slug = gateway.slug();
        if self.gateways.insert(slug, gateway).is_some() {
            tracing::warn!(gateway = slug, "Gateway registered twice, replacing");
        }
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn Gateway>> {
        self.gateways.get(slug).cloned()
    }

    pub fn slugs(&self) -> Vec<&'static str> {
        self.gateways.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors_set_retryable() {
        assert!(GatewayError::transient("timeout").retryable);
        assert!(!GatewayError::declined("card declined").retryable);
        assert!(!GatewayError::authentication("bad key").retryable);
    }

    #[test]
    fn test_registry_lookup_by_slug() {
        let registry = GatewayRegistry::new();
        assert!(registry.get("paypal").is_none());
        assert!(registry.slugs().is_empty());
    }
}
