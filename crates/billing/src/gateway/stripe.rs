//! Stripe gateway adapter
//!
//! Checkout uses hosted Checkout Sessions in subscription mode with inline
//! price data, so plan levels don't need pre-created Stripe prices. Webhook
//! signatures are verified manually (HMAC-SHA256 over `t.payload`) to stay
//! independent of async-stripe's pinned API version.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, CreateRefund, CreateSubscription,
    CreateSubscriptionItems, CustomerId, Refund, Subscription, SubscriptionStatus,
};
use time::OffsetDateTime;

use super::{
    ChargeResult, CheckoutRequest, CheckoutStart, Gateway, GatewayError, ProfileResult,
    ProfileState, ProfileStatus, RecurringProfileRequest,
};
use crate::error::{BillingError, BillingResult};

/// Accepted clock skew between Stripe's signature timestamp and ours
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Configuration for the Stripe gateway
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Product id used when creating subscriptions directly (outside
    /// Checkout, e.g. the reconciliation sweep)
    pub product_id: String,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            product_id: std::env::var("STRIPE_PRODUCT_ID")
                .map_err(|_| BillingError::Config("STRIPE_PRODUCT_ID not set".to_string()))?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }
}

/// Stripe gateway adapter
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    config: StripeConfig,
}

fn map_stripe_error(err: stripe::StripeError) -> GatewayError {
    match err {
        stripe::StripeError::Stripe(e) => {
            let message = e
                .message
                .clone()
                .unwrap_or_else(|| format!("{:?}", e.error_type));
            match e.http_status {
                401 | 403 => GatewayError::authentication(message),
                402 => GatewayError::declined(message),
                429 => GatewayError::transient(message),
                s if s >= 500 => GatewayError::transient(message),
                _ => GatewayError::validation(message),
            }
        }
        stripe::StripeError::Timeout => GatewayError::transient("request timed out"),
        stripe::StripeError::ClientError(msg) => GatewayError::transient(msg),
        other => GatewayError::protocol(other.to_string()),
    }
}

fn map_subscription_state(status: SubscriptionStatus) -> ProfileState {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => ProfileState::Active,
        SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid => ProfileState::Suspended,
        SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired => {
            ProfileState::Cancelled
        }
        _ => ProfileState::Unknown,
    }
}

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// Header format: `t=<unix ts>,v1=<hex hmac>[,v1=...]`. The signed message
/// is `{t}.{body}` keyed with the webhook secret (leading `whsec_` stripped).
pub fn verify_webhook_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::SignatureInvalid);
    }

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::SignatureInvalid);
    }

    let secret = webhook_secret.strip_prefix("whsec_").unwrap_or(webhook_secret);
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if signatures.iter().any(|s| *s == expected) {
        Ok(())
    } else {
        Err(BillingError::SignatureInvalid)
    }
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(&config.secret_key);
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    fn currency(code: &str) -> Result<stripe::Currency, GatewayError> {
        code.to_lowercase()
            .parse()
            .map_err(|_| GatewayError::validation(format!("unsupported currency '{code}'")))
    }

    /// Inline price data for a direct subscription: the configured product
    /// billed every `term_months` months.
    fn subscription_price_data(
        &self,
        req: &RecurringProfileRequest,
    ) -> Result<stripe::SubscriptionPriceData, GatewayError> {
        Ok(stripe::SubscriptionPriceData {
            currency: Self::currency(&req.currency)?,
            product: self.config.product_id.clone(),
            recurring: stripe::SubscriptionPriceDataRecurring {
                interval: stripe::SubscriptionInterval::Month,
                interval_count: Some(req.term_months.max(1) as u64),
            },
            tax_behavior: None,
            unit_amount: Some(req.amount_cents),
            unit_amount_decimal: None,
        })
    }
}

#[async_trait]
impl Gateway for StripeGateway {
    fn slug(&self) -> &'static str {
        "stripe"
    }

    async fn start_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutStart, GatewayError> {
        let success_url = format!(
            "{}/checkout/stripe/success?intent={}",
            self.config.app_base_url, req.intent_id
        );
        let cancel_url = format!(
            "{}/checkout/cancelled?intent={}",
            self.config.app_base_url, req.intent_id
        );

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("activation_key".to_string(), req.activation_key.clone());
        metadata.insert("level".to_string(), req.level.to_string());
        metadata.insert("term_months".to_string(), req.term_months.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Self::currency(&req.currency)?,
                unit_amount: Some(req.amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: format!("{} plan", req.plan_name),
                    ..Default::default()
                }),
                recurring: req.recurring.then(|| {
                    CreateCheckoutSessionLineItemsPriceDataRecurring {
                        interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                        interval_count: Some(req.term_months.max(1) as u64),
                    }
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        let customer = match &req.customer_id {
            Some(id) => Some(
                id.parse::<CustomerId>()
                    .map_err(|e| GatewayError::validation(format!("bad customer id: {e}")))?,
            ),
            None => None,
        };

        let params = CreateCheckoutSession {
            customer,
            mode: Some(if req.recurring {
                CheckoutSessionMode::Subscription
            } else {
                CheckoutSessionMode::Payment
            }),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            client_reference_id: Some(&req.activation_key),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client, params)
            .await
            .map_err(map_stripe_error)?;

        let url = session
            .url
            .clone()
            .ok_or_else(|| GatewayError::protocol("checkout session carried no URL"))?;

        tracing::info!(
            session_id = %session.id,
            level = req.level,
            term_months = req.term_months,
            "Created Stripe checkout session"
        );

        Ok(CheckoutStart::Redirect {
            url,
            token: session.id.to_string(),
        })
    }

    /// Confirm a completed Checkout Session. Stripe settles the charge and
    /// creates the subscription itself, so this only verifies payment and
    /// reports back the identifiers; the webhook stream is authoritative.
    async fn complete_checkout(
        &self,
        token: &str,
        _payer_ref: Option<&str>,
        _amount_cents: i64,
        currency: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let session_id = token
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| GatewayError::validation(format!("bad session id: {e}")))?;

        let session = CheckoutSession::retrieve(&self.client, &session_id, &[])
            .await
            .map_err(map_stripe_error)?;

        if session.payment_status != stripe::CheckoutSessionPaymentStatus::Paid {
            return Err(GatewayError::declined(format!(
                "checkout session not paid (status {:?})",
                session.payment_status
            )));
        }

        let txn_id = session
            .payment_intent
            .as_ref()
            .map(|pi| pi.id().to_string())
            .unwrap_or_else(|| session.id.to_string());
        let raw = serde_json::to_value(&session).unwrap_or(serde_json::Value::Null);

        Ok(ChargeResult {
            txn_id,
            amount_cents: session.amount_total.unwrap_or(0),
            currency: currency.to_string(),
            payer_ref: session.customer.as_ref().map(|c| c.id().to_string()),
            subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
            raw,
        })
    }

    /// Create a subscription directly (reconciliation path). Requires an
    /// existing customer with a default payment method; hosted checkout is
    /// the normal signup path.
    async fn create_recurring_profile(
        &self,
        req: &RecurringProfileRequest,
    ) -> Result<ProfileResult, GatewayError> {
        let customer_id = req
            .customer_id
            .as_deref()
            .ok_or_else(|| {
                GatewayError::validation("stripe subscription requires an existing customer")
            })?
            .parse::<CustomerId>()
            .map_err(|e| GatewayError::validation(format!("bad customer id: {e}")))?;

        let mut params = CreateSubscription::new(customer_id.clone());
        params.items = Some(vec![CreateSubscriptionItems {
            price_data: Some(self.subscription_price_data(req)?),
            ..Default::default()
        }]);
        // The initial term was paid by the checkout charge; first recurring
        // invoice lands when that term ends.
        params.trial_end = Some(stripe::Scheduled::at(req.start_at.unix_timestamp()));

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("activation_key".to_string(), req.activation_key.clone());
        metadata.insert("level".to_string(), req.level.to_string());
        metadata.insert("term_months".to_string(), req.term_months.to_string());
        params.metadata = Some(metadata);

        let subscription = Subscription::create(&self.client, params)
            .await
            .map_err(map_stripe_error)?;

        Ok(ProfileResult {
            subscription_id: subscription.id.to_string(),
            customer_id: Some(customer_id.to_string()),
        })
    }

    async fn cancel_profile(
        &self,
        subscription_id: &str,
        note: &str,
    ) -> Result<(), GatewayError> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| GatewayError::validation(format!("bad subscription id: {e}")))?;

        Subscription::cancel(&self.client, &id, CancelSubscription::default())
            .await
            .map_err(map_stripe_error)?;

        tracing::info!(subscription_id = %subscription_id, note = %note, "Cancelled Stripe subscription");
        Ok(())
    }

    async fn refund_charge(
        &self,
        txn_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<(), GatewayError> {
        let mut params = CreateRefund::default();
        params.amount = amount_cents;
        if txn_id.starts_with("pi_") {
            params.payment_intent = Some(
                txn_id
                    .parse()
                    .map_err(|_| GatewayError::validation("bad payment intent id"))?,
            );
        } else {
            params.charge = Some(
                txn_id
                    .parse()
                    .map_err(|_| GatewayError::validation("bad charge id"))?,
            );
        }

        Refund::create(&self.client, params)
            .await
            .map_err(map_stripe_error)?;
        Ok(())
    }

    async fn fetch_profile_status(
        &self,
        subscription_id: &str,
    ) -> Result<ProfileStatus, GatewayError> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| GatewayError::validation(format!("bad subscription id: {e}")))?;

        let subscription = Subscription::retrieve(&self.client, &id, &[])
            .await
            .map_err(map_stripe_error)?;

        Ok(ProfileStatus {
            state: map_subscription_state(subscription.status),
            next_billing_at: OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .ok(),
            last_payment_cents: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    const NOW_TS: i64 = 1748772000; // 2025-06-01 10:00 UTC
    const NOW: OffsetDateTime = datetime!(2025-06-01 10:00 UTC);

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign("{\"id\":\"evt_1\"}", "secret", NOW_TS);
        assert!(verify_webhook_signature("{\"id\":\"evt_1\"}", &header, "secret", NOW).is_ok());
    }

    #[test]
    fn test_whsec_prefix_is_stripped() {
        let header = sign("payload", "secret", NOW_TS);
        assert!(verify_webhook_signature("payload", &header, "whsec_secret", NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign("payload", "secret", NOW_TS);
        assert!(matches!(
            verify_webhook_signature("tampered", &header, "secret", NOW),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign("payload", "secret", NOW_TS);
        assert!(verify_webhook_signature("payload", &header, "other", NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = sign("payload", "secret", NOW_TS - SIGNATURE_TOLERANCE_SECS - 1);
        assert!(verify_webhook_signature("payload", &header, "secret", NOW).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_webhook_signature("payload", "garbage", "secret", NOW).is_err());
        assert!(verify_webhook_signature("payload", "t=abc,v1=00", "secret", NOW).is_err());
        assert!(verify_webhook_signature("payload", "t=123", "secret", NOW).is_err());
    }

    #[test]
    fn test_subscription_price_data_bills_per_term() {
        let gateway = StripeGateway::new(StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            product_id: "prod_123".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
        });
        let price = gateway
            .subscription_price_data(&RecurringProfileRequest {
                activation_key: "key".to_string(),
                plan_name: "Pro".to_string(),
                level: 2,
                term_months: 3,
                amount_cents: 7500,
                currency: "USD".to_string(),
                checkout_token: None,
                payer_ref: None,
                customer_id: Some("cus_1".to_string()),
                start_at: NOW,
                trial_days: 0,
                setup_fee_cents: 0,
            })
            .unwrap();

        assert_eq!(price.product, "prod_123");
        assert_eq!(price.unit_amount, Some(7500));
        assert_eq!(price.recurring.interval, stripe::SubscriptionInterval::Month);
        assert_eq!(price.recurring.interval_count, Some(3));
    }

    #[test]
    fn test_subscription_state_mapping() {
        assert_eq!(
            map_subscription_state(SubscriptionStatus::Active),
            ProfileState::Active
        );
        assert_eq!(
            map_subscription_state(SubscriptionStatus::Trialing),
            ProfileState::Active
        );
        assert_eq!(
            map_subscription_state(SubscriptionStatus::PastDue),
            ProfileState::Suspended
        );
        assert_eq!(
            map_subscription_state(SubscriptionStatus::Canceled),
            ProfileState::Cancelled
        );
    }
}
