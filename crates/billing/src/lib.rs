//! Sitebill Billing Library
//!
//! Subscription billing core: gateway adapters (PayPal NVP, Stripe),
//! notification normalization, the reconciliation engine that folds billing
//! events into tenant state, checkout orchestration, refunds, and
//! consistency checks.

pub mod audit;
pub mod checkout;
pub mod config;
pub mod email;
pub mod engine;
pub mod error;
pub mod event;
pub mod gateway;
pub mod invariants;
pub mod normalize;
pub mod refund;
pub mod store;

pub use checkout::{CheckoutCompletion, CheckoutRedirect, CheckoutService, StartCheckout};
pub use config::BillingConfig;
pub use engine::{decide, Outcome, ReconcileEngine};
pub use error::{BillingError, BillingResult};
pub use event::{BillingEvent, EventKind, TenantRef};
pub use gateway::{Gateway, GatewayRegistry, PayPalGateway, StripeGateway};
pub use store::SubscriptionStore;

use std::sync::Arc;

use sqlx::PgPool;

use audit::BillingEventLog;
use email::BillingEmailService;
use gateway::{paypal::PayPalConfig, stripe::StripeConfig};
use refund::RefundService;

/// Everything the API server and worker need to process billing, built once
/// at startup
#[derive(Clone)]
pub struct BillingService {
    pub config: BillingConfig,
    pub store: SubscriptionStore,
    pub registry: GatewayRegistry,
    pub engine: ReconcileEngine,
    pub checkout: CheckoutService,
    pub refunds: RefundService,
    pub email: BillingEmailService,
    /// Concrete PayPal adapter, kept for IPN verification (not part of the
    /// [`Gateway`] trait)
    pub paypal: Option<Arc<PayPalGateway>>,
    /// Stripe webhook signing secret, kept for signature verification
    pub stripe_webhook_secret: Option<String>,
}

impl BillingService {
    /// Build the service from environment variables. Gateways are
    /// registered when their credentials are present; at least one must be.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let store = SubscriptionStore::new(pool.clone());
        let email = BillingEmailService::from_env();
        let audit = BillingEventLog::new(pool);

        let mut registry = GatewayRegistry::new();

        let paypal = if std::env::var("PAYPAL_API_USER").is_ok() {
            let gw = Arc::new(PayPalGateway::new(PayPalConfig::from_env()?)?);
            registry.register(gw.clone());
            Some(gw)
        } else {
            None
        };

        let stripe_webhook_secret = if std::env::var("STRIPE_SECRET_KEY").is_ok() {
            let stripe_config = StripeConfig::from_env()?;
            let secret = stripe_config.webhook_secret.clone();
            registry.register(Arc::new(StripeGateway::new(stripe_config)));
            Some(secret)
        } else {
            None
        };

        if registry.slugs().is_empty() {
            return Err(BillingError::Config(
                "no payment gateway configured (set PAYPAL_API_* or STRIPE_SECRET_KEY)"
                    .to_string(),
            ));
        }
        tracing::info!(gateways = ?registry.slugs(), "Billing gateways registered");

        let engine = ReconcileEngine::new(
            store.clone(),
            registry.clone(),
            email.clone(),
            audit,
            config.clone(),
        );
        let checkout = CheckoutService::new(
            store.clone(),
            registry.clone(),
            email.clone(),
            config.clone(),
        );
        let refunds = RefundService::new(store.clone(), registry.clone(), config.clone());

        Ok(Self {
            config,
            store,
            registry,
            engine,
            checkout,
            refunds,
            email,
            paypal,
            stripe_webhook_secret,
        })
    }
}
