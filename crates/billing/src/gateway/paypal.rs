//! PayPal Express Checkout adapter (classic NVP API)
//!
//! Talks to the name-value-pair endpoint with signature credentials.
//! Checkout is the three-step SetExpressCheckout / GetExpressCheckoutDetails /
//! DoExpressCheckoutPayment dance; recurring billing uses
//! CreateRecurringPaymentsProfile against the same checkout token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sitebill_shared::money::{cents_from_decimal, decimal_from_cents};
use time::format_description::well_known::Rfc3339;
use url::form_urlencoded;

use super::{
    ChargeResult, CheckoutRequest, CheckoutStart, Gateway, GatewayError, ProfileResult,
    ProfileState, ProfileStatus, RecurringProfileRequest,
};
use crate::error::{BillingError, BillingResult};

const NVP_VERSION: &str = "63.0";
const NVP_LIVE: &str = "https://api-3t.paypal.com/nvp";
const NVP_SANDBOX: &str = "https://api-3t.sandbox.paypal.com/nvp";
const WEBSCR_LIVE: &str = "https://www.paypal.com/cgi-bin/webscr";
const WEBSCR_SANDBOX: &str = "https://www.sandbox.paypal.com/cgi-bin/webscr";

/// Configuration for the PayPal gateway
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub api_user: String,
    pub api_password: String,
    pub api_signature: String,
    pub sandbox: bool,
    /// Base URL for checkout return/cancel redirects
    pub app_base_url: String,
}

impl PayPalConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_user: std::env::var("PAYPAL_API_USER")
                .map_err(|_| BillingError::Config("PAYPAL_API_USER not set".to_string()))?,
            api_password: std::env::var("PAYPAL_API_PASSWORD")
                .map_err(|_| BillingError::Config("PAYPAL_API_PASSWORD not set".to_string()))?,
            api_signature: std::env::var("PAYPAL_API_SIGNATURE")
                .map_err(|_| BillingError::Config("PAYPAL_API_SIGNATURE not set".to_string()))?,
            sandbox: std::env::var("PAYPAL_SANDBOX")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    fn nvp_endpoint(&self) -> &'static str {
        if self.sandbox {
            NVP_SANDBOX
        } else {
            NVP_LIVE
        }
    }

    fn webscr_endpoint(&self) -> &'static str {
        if self.sandbox {
            WEBSCR_SANDBOX
        } else {
            WEBSCR_LIVE
        }
    }
}

/// PayPal Express Checkout gateway adapter
#[derive(Clone)]
pub struct PayPalGateway {
    config: PayPalConfig,
    client: reqwest::Client,
}

/// Parse an NVP response body into a field map
fn parse_nvp(body: &str) -> HashMap<String, String> {
    form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Join the numbered long-message error fields PayPal returns on failure
fn join_errors(fields: &HashMap<String, String>) -> String {
    let mut messages = Vec::new();
    for i in 0..10 {
        if let Some(msg) = fields.get(&format!("L_LONGMESSAGE{i}")) {
            messages.push(msg.clone());
        }
    }
    if messages.is_empty() {
        if let Some(short) = fields.get("L_SHORTMESSAGE0") {
            messages.push(short.clone());
        }
    }
    if messages.is_empty() {
        "PayPal returned a failure without an error message".to_string()
    } else {
        messages.join("; ")
    }
}

fn map_profile_state(status: &str) -> ProfileState {
    match status {
        "Active" => ProfileState::Active,
        "Suspended" => ProfileState::Suspended,
        "Cancelled" | "Expired" => ProfileState::Cancelled,
        _ => ProfileState::Unknown,
    }
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BillingError::Config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(PayPalConfig::from_env()?)
    }

    /// Encode a signed NVP request body. The serializer is not Sync, so it
    /// must be finished before the request future is built.
    fn nvp_body(&self, method: &str, params: &[(&str, String)]) -> String {
        let mut body = form_urlencoded::Serializer::new(String::new());
        body.append_pair("USER", &self.config.api_user)
            .append_pair("PWD", &self.config.api_password)
            .append_pair("SIGNATURE", &self.config.api_signature)
            .append_pair("VERSION", NVP_VERSION)
            .append_pair("METHOD", method);
        for (k, v) in params {
            body.append_pair(k, v);
        }
        body.finish()
    }

    /// Call an NVP API method and return the parsed response fields.
    /// Network failures and 5xx responses are transient; an ACK other than
    /// Success/SuccessWithWarning is mapped from the numbered error fields.
    async fn api_call(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<HashMap<String, String>, GatewayError> {
        let body = self.nvp_body(method, params);

        let response = self
            .client
            .post(self.config.nvp_endpoint())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::transient(format!("{method}: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::transient(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::transient(format!("{method}: {e}")))?;
        let fields = parse_nvp(&text);

        match fields.get("ACK").map(String::as_str) {
            Some("Success") | Some("SuccessWithWarning") => Ok(fields),
            Some(_) => {
                let message = join_errors(&fields);
                // 10002 is "security header is not valid" - bad credentials
                if fields.get("L_ERRORCODE0").map(String::as_str) == Some("10002") {
                    Err(GatewayError::authentication(message))
                } else {
                    Err(GatewayError::validation(format!("{method}: {message}")))
                }
            }
            None => Err(GatewayError::protocol(format!(
                "{method}: response carried no ACK"
            ))),
        }
    }

    fn require<'a>(
        fields: &'a HashMap<String, String>,
        key: &str,
        method: &str,
    ) -> Result<&'a str, GatewayError> {
        fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| GatewayError::protocol(format!("{method}: missing {key}")))
    }

    /// Validate a raw IPN body by echoing it back to PayPal.
    ///
    /// Transient failures surface as [`BillingError::VerificationUnavailable`]
    /// so the intake endpoint can answer 503 and let PayPal redeliver; a
    /// definitive INVALID is a hard rejection.
    pub async fn verify_ipn(&self, raw_body: &str) -> BillingResult<()> {
        let body = format!("cmd=_notify-validate&{raw_body}");
        let response = self
            .client
            .post(self.config.webscr_endpoint())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| BillingError::VerificationUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::VerificationUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let verdict = response
            .text()
            .await
            .map_err(|e| BillingError::VerificationUnavailable(e.to_string()))?;

        match verdict.trim() {
            "VERIFIED" => Ok(()),
            "INVALID" => Err(BillingError::SignatureInvalid),
            other => Err(BillingError::VerificationUnavailable(format!(
                "unexpected validation verdict '{other}'"
            ))),
        }
    }

    fn checkout_redirect_url(&self, token: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
        format!(
            "{}?cmd=_express-checkout&useraction=commit&token={}",
            self.config.webscr_endpoint(),
            encoded
        )
    }

    fn billing_description(plan_name: &str, term_months: i32) -> String {
        format!("{plan_name} subscription, billed every {term_months} month(s)")
    }

    /// The `custom` passthrough IPNs echo back, letting the normalizer
    /// resolve the tenant and plan without a provider lookup:
    /// `pre:tenant_id:activation_key:level:term:amount:currency:timestamp`
    fn custom_passthrough(req: &CheckoutRequest, at: time::OffsetDateTime) -> String {
        format!(
            "pre:{}:{}:{}:{}:{}:{}:{}",
            req.tenant_id.map(|t| t.0).unwrap_or(0),
            req.activation_key,
            req.level,
            req.term_months,
            decimal_from_cents(req.amount_cents),
            req.currency,
            at.unix_timestamp()
        )
    }
}

#[async_trait]
impl Gateway for PayPalGateway {
    fn slug(&self) -> &'static str {
        "paypal"
    }

    async fn start_checkout(&self, req: &CheckoutRequest) -> Result<CheckoutStart, GatewayError> {
        let amount = decimal_from_cents(req.amount_cents);
        let desc = Self::billing_description(&req.plan_name, req.term_months);
        let return_url = format!(
            "{}/checkout/paypal/return?intent={}",
            self.config.app_base_url, req.intent_id
        );
        let cancel_url = format!(
            "{}/checkout/cancelled?intent={}",
            self.config.app_base_url, req.intent_id
        );

        let custom = Self::custom_passthrough(req, time::OffsetDateTime::now_utc());
        let mut params = vec![
            ("PAYMENTREQUEST_0_AMT", amount),
            ("PAYMENTREQUEST_0_CURRENCYCODE", req.currency.clone()),
            ("PAYMENTREQUEST_0_PAYMENTACTION", "Sale".to_string()),
            ("PAYMENTREQUEST_0_CUSTOM", custom),
            ("RETURNURL", return_url),
            ("CANCELURL", cancel_url),
        ];
        // The billing agreement is what lets the checkout token create a
        // recurring profile afterwards
        if req.recurring {
            params.push(("L_BILLINGTYPE0", "RecurringPayments".to_string()));
            params.push(("L_BILLINGAGREEMENTDESCRIPTION0", desc));
        }

        let fields = self.api_call("SetExpressCheckout", &params).await?;

        let token = Self::require(&fields, "TOKEN", "SetExpressCheckout")?.to_string();
        Ok(CheckoutStart::Redirect {
            url: self.checkout_redirect_url(&token),
            token,
        })
    }

    async fn complete_checkout(
        &self,
        token: &str,
        payer_ref: Option<&str>,
        amount_cents: i64,
        currency: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let payer_id = match payer_ref {
            Some(id) => id.to_string(),
            None => {
                let details = self
                    .api_call(
                        "GetExpressCheckoutDetails",
                        &[("TOKEN", token.to_string())],
                    )
                    .await?;
                Self::require(&details, "PAYERID", "GetExpressCheckoutDetails")?.to_string()
            }
        };

        let fields = self
            .api_call(
                "DoExpressCheckoutPayment",
                &[
                    ("TOKEN", token.to_string()),
                    ("PAYERID", payer_id.clone()),
                    ("PAYMENTREQUEST_0_AMT", decimal_from_cents(amount_cents)),
                    ("PAYMENTREQUEST_0_CURRENCYCODE", currency.to_string()),
                    ("PAYMENTREQUEST_0_PAYMENTACTION", "Sale".to_string()),
                ],
            )
            .await?;

        let txn_id =
            Self::require(&fields, "PAYMENTINFO_0_TRANSACTIONID", "DoExpressCheckoutPayment")?
                .to_string();
        let settled_cents = fields
            .get("PAYMENTINFO_0_AMT")
            .and_then(|v| cents_from_decimal(v))
            .unwrap_or(amount_cents);

        let raw = serde_json::json!(fields);
        Ok(ChargeResult {
            txn_id,
            amount_cents: settled_cents,
            currency: currency.to_string(),
            payer_ref: Some(payer_id),
            subscription_id: None,
            raw,
        })
    }

    async fn create_recurring_profile(
        &self,
        req: &RecurringProfileRequest,
    ) -> Result<ProfileResult, GatewayError> {
        let token = req.checkout_token.as_deref().ok_or_else(|| {
            GatewayError::validation("recurring profile requires the express checkout token")
        })?;
        let start = req
            .start_at
            .format(&Rfc3339)
            .map_err(|e| GatewayError::validation(format!("bad profile start date: {e}")))?;
        // DESC must match the billing agreement description from checkout
        let desc = Self::billing_description(&req.plan_name, req.term_months);

        let mut params = vec![
            ("TOKEN", token.to_string()),
            ("PROFILESTARTDATE", start),
            ("DESC", desc),
            ("BILLINGPERIOD", "Month".to_string()),
            ("BILLINGFREQUENCY", req.term_months.to_string()),
            ("AMT", decimal_from_cents(req.amount_cents)),
            ("CURRENCYCODE", req.currency.clone()),
            ("MAXFAILEDPAYMENTS", "1".to_string()),
            ("PROFILEREFERENCE", req.activation_key.clone()),
        ];
        if req.trial_days > 0 {
            params.push(("TRIALBILLINGPERIOD", "Day".to_string()));
            params.push(("TRIALBILLINGFREQUENCY", req.trial_days.to_string()));
            params.push(("TRIALTOTALBILLINGCYCLES", "1".to_string()));
            params.push(("TRIALAMT", decimal_from_cents(0)));
        }
        if req.setup_fee_cents > 0 {
            params.push(("INITAMT", decimal_from_cents(req.setup_fee_cents)));
            params.push(("FAILEDINITAMTACTION", "CancelOnFailure".to_string()));
        }

        let fields = self
            .api_call("CreateRecurringPaymentsProfile", &params)
            .await?;

        let profile_id =
            Self::require(&fields, "PROFILEID", "CreateRecurringPaymentsProfile")?.to_string();
        Ok(ProfileResult {
            subscription_id: profile_id,
            customer_id: req.payer_ref.clone(),
        })
    }

    async fn cancel_profile(
        &self,
        subscription_id: &str,
        note: &str,
    ) -> Result<(), GatewayError> {
        self.api_call(
            "ManageRecurringPaymentsProfileStatus",
            &[
                ("PROFILEID", subscription_id.to_string()),
                ("ACTION", "Cancel".to_string()),
                ("NOTE", note.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn refund_charge(
        &self,
        txn_id: &str,
        amount_cents: Option<i64>,
    ) -> Result<(), GatewayError> {
        let mut params = vec![("TRANSACTIONID", txn_id.to_string())];
        match amount_cents {
            Some(cents) => {
                params.push(("REFUNDTYPE", "Partial".to_string()));
                params.push(("AMT", decimal_from_cents(cents)));
            }
            None => params.push(("REFUNDTYPE", "Full".to_string())),
        }
        self.api_call("RefundTransaction", &params).await?;
        Ok(())
    }

    async fn fetch_profile_status(
        &self,
        subscription_id: &str,
    ) -> Result<ProfileStatus, GatewayError> {
        let fields = self
            .api_call(
                "GetRecurringPaymentsProfileDetails",
                &[("PROFILEID", subscription_id.to_string())],
            )
            .await?;

        let status = Self::require(&fields, "STATUS", "GetRecurringPaymentsProfileDetails")?;
        let next_billing_at = fields
            .get("NEXTBILLINGDATE")
            .and_then(|v| time::OffsetDateTime::parse(v, &Rfc3339).ok());
        let last_payment_cents = fields
            .get("LASTPAYMENTAMT")
            .and_then(|v| cents_from_decimal(v));

        Ok(ProfileStatus {
            state: map_profile_state(status),
            next_billing_at,
            last_payment_cents,
        })
    }
}
