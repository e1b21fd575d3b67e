//! Server-side checkout orchestration
//!
//! A checkout is tracked as an intent row through its states:
//! started -> charged -> completed, with pending_profile as the detour when
//! the charge settled but the recurring profile could not be created. The
//! reconciliation sweep retries pending_profile intents.
//!
//! PayPal completes on our return URL (capture + profile creation happen
//! here); Stripe completes via webhooks and the success handler only
//! confirms the session.

use sitebill_shared::{add_months, TenantId, NEVER_EXPIRES};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::event::EventKind;
use crate::gateway::{
    CheckoutRequest, CheckoutStart, GatewayRegistry, RecurringProfileRequest,
};
use crate::store::{CheckoutIntent, SubscriptionStore, Tenant};

const MAX_TERM_MONTHS: i32 = 36;

/// Parameters for starting a checkout
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StartCheckout {
    pub activation_key: String,
    pub gateway: String,
    pub level: i32,
    pub term_months: i32,
}

/// Where to send the customer after an intent was created
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutRedirect {
    pub intent_id: Uuid,
    pub redirect_url: String,
}

/// Result of completing (or confirming) a checkout
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutCompletion {
    /// Charge settled and the recurring profile is in place
    Completed {
        tenant_id: TenantId,
        #[serde(with = "time::serde::rfc3339")]
        paid_through: OffsetDateTime,
    },
    /// Charge settled; profile creation failed and was handed to the
    /// reconciliation sweep. The customer has paid-through access.
    PendingProfile { tenant_id: TenantId },
    /// Session confirmed; state changes arrive via webhooks
    Confirmed,
    /// Customer backed out at the provider before paying
    Cancelled,
    /// Return URL replayed after the intent already finished
    AlreadyCompleted,
}

/// The paid-through date a checkout charge buys: term months past the later
/// of now and the current expiry. A never-expires tenant is left alone.
fn next_paid_through(
    current: Option<OffsetDateTime>,
    term_months: i32,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if current == Some(NEVER_EXPIRES) {
        return None;
    }
    let anchor = match current {
        Some(expires) if expires > now => expires,
        _ => now,
    };
    Some(add_months(anchor, term_months.max(1)))
}

/// Orchestrates checkouts across gateways
#[derive(Clone)]
pub struct CheckoutService {
    store: SubscriptionStore,
    registry: GatewayRegistry,
    email: BillingEmailService,
    config: BillingConfig,
}

impl CheckoutService {
    pub fn new(
        store: SubscriptionStore,
        registry: GatewayRegistry,
        email: BillingEmailService,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            registry,
            email,
            config,
        }
    }

    /// Create an intent and start the provider-side checkout
    pub async fn start(&self, req: &StartCheckout) -> BillingResult<CheckoutRedirect> {
        if req.activation_key.trim().is_empty() {
            return Err(BillingError::MalformedPayload(
                "activation_key is required".to_string(),
            ));
        }
        if req.term_months < 1 || req.term_months > MAX_TERM_MONTHS {
            return Err(BillingError::InvalidAmount(format!(
                "term_months must be between 1 and {MAX_TERM_MONTHS}"
            )));
        }
        let plan = self
            .config
            .plans
            .get(req.level)
            .ok_or(BillingError::InvalidLevel(req.level))?;
        let amount_cents = self
            .config
            .plans
            .price_cents(req.level, req.term_months)
            .ok_or(BillingError::InvalidLevel(req.level))?;
        let gateway = self
            .registry
            .get(&req.gateway)
            .ok_or_else(|| BillingError::UnknownGateway(req.gateway.clone()))?;

        // Reuse the provider customer when the tenant already checked out
        // with this gateway before
        let existing = self
            .store
            .find_tenant_by_activation_key(&req.activation_key)
            .await?;
        let customer_id = match &existing {
            Some(t) => self
                .store
                .find_active_link(t.id, &req.gateway)
                .await?
                .and_then(|l| l.customer_id),
            None => None,
        };

        let intent = self
            .store
            .create_intent(
                existing.as_ref().map(|t| t.id),
                &req.activation_key,
                &req.gateway,
                req.level,
                req.term_months,
                amount_cents,
                &self.config.currency,
            )
            .await?;

        let start = gateway
            .start_checkout(&CheckoutRequest {
                intent_id: intent.id,
                tenant_id: existing.as_ref().map(|t| t.id),
                activation_key: req.activation_key.clone(),
                plan_name: plan.name.clone(),
                level: req.level,
                term_months: req.term_months,
                amount_cents,
                currency: self.config.currency.clone(),
                customer_id,
                recurring: self.config.recurring_billing,
            })
            .await;

        let CheckoutStart::Redirect { url, token } = match start {
            Ok(s) => s,
            Err(e) => {
                self.store.mark_intent_failed(intent.id, &e.message).await?;
                return Err(e.into());
            }
        };
        self.store.set_intent_token(intent.id, &token).await?;

        tracing::info!(
            intent_id = %intent.id,
            gateway = %req.gateway,
            level = req.level,
            term_months = req.term_months,
            amount_cents,
            "Checkout started"
        );

        Ok(CheckoutRedirect {
            intent_id: intent.id,
            redirect_url: url,
        })
    }

    /// PayPal return URL: capture the approved charge, apply it to the
    /// tenant, then create the recurring profile. Profile failure never
    /// loses the settled charge; the intent parks in pending_profile for
    /// the reconciliation sweep.
    pub async fn complete_paypal_return(
        &self,
        intent_id: Uuid,
        payer_id: Option<&str>,
    ) -> BillingResult<CheckoutCompletion> {
        let intent = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| BillingError::IntentNotFound(intent_id.to_string()))?;

        match intent.status.as_str() {
            "completed" => return Ok(CheckoutCompletion::AlreadyCompleted),
            "failed" => {
                return Err(BillingError::MalformedPayload(
                    "checkout already failed".to_string(),
                ))
            }
            _ => {}
        }

        let gateway = self
            .registry
            .get(&intent.gateway)
            .ok_or_else(|| BillingError::UnknownGateway(intent.gateway.clone()))?;
        let token = intent
            .gateway_token
            .clone()
            .ok_or_else(|| BillingError::Internal("intent has no checkout token".to_string()))?;

        // Replayed return URLs skip the capture and resume where they left off
        let (txn_id, payer_ref) = match &intent.charge_txn_id {
            Some(txn) => (txn.clone(), payer_id.map(str::to_string)),
            None => {
                let charge = match gateway
                    .complete_checkout(&token, payer_id, intent.amount_cents, &intent.currency)
                    .await
                {
                    Ok(c) => c,
                    Err(e) if !e.retryable => {
                        self.store.mark_intent_failed(intent.id, &e.message).await?;
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                };
                self.store.mark_intent_charged(intent.id, &charge.txn_id).await?;
                (charge.txn_id, charge.payer_ref)
            }
        };

        let (tenant, paid_through) = self.apply_checkout_charge(&intent, &txn_id).await?;

        // One-time mode: the term is paid, nothing to set up at the provider
        if !self.config.recurring_billing {
            self.store.mark_intent_completed(intent.id, None).await?;
            let _ = self
                .email
                .send_receipt(
                    &tenant.email,
                    self.config.plans.name(intent.level),
                    intent.amount_cents,
                    paid_through,
                )
                .await;
            return Ok(CheckoutCompletion::Completed {
                tenant_id: tenant.id,
                paid_through,
            });
        }

        let profile = gateway
            .create_recurring_profile(&RecurringProfileRequest {
                activation_key: tenant.activation_key.clone().unwrap_or_default(),
                plan_name: self.config.plans.name(intent.level).to_string(),
                level: intent.level,
                term_months: intent.term_months,
                amount_cents: intent.amount_cents,
                currency: intent.currency.clone(),
                checkout_token: Some(token),
                payer_ref,
                customer_id: None,
                start_at: paid_through,
                trial_days: self.config.trial_days,
                setup_fee_cents: self.config.setup_fee_cents,
            })
            .await;

        match profile {
            Ok(p) => {
                let mut tx = self.store.pool().begin().await?;
                SubscriptionStore::supersede_link(
                    &mut tx,
                    tenant.id,
                    &intent.gateway,
                    p.customer_id.as_deref(),
                    &p.subscription_id,
                )
                .await?;
                SubscriptionStore::set_pending_reconciliation(&mut tx, tenant.id, false).await?;
                tx.commit().await?;
                self.store
                    .mark_intent_completed(intent.id, Some(&p.subscription_id))
                    .await?;

                tracing::info!(
                    intent_id = %intent.id,
                    tenant_id = %tenant.id,
                    subscription_id = %p.subscription_id,
                    "Checkout completed with recurring profile"
                );

                let _ = self
                    .email
                    .send_receipt(
                        &tenant.email,
                        self.config.plans.name(intent.level),
                        intent.amount_cents,
                        paid_through,
                    )
                    .await;

                Ok(CheckoutCompletion::Completed {
                    tenant_id: tenant.id,
                    paid_through,
                })
            }
            Err(e) => {
                // Charge settled, profile did not: park for the sweep
                let mut conn = self.store.pool().acquire().await?;
                SubscriptionStore::set_pending_reconciliation(&mut conn, tenant.id, true).await?;
                drop(conn);
                self.store
                    .mark_intent_pending_profile(intent.id, &e.message)
                    .await?;

                tracing::warn!(
                    intent_id = %intent.id,
                    tenant_id = %tenant.id,
                    error = %e,
                    "Charge settled but recurring profile creation failed"
                );

                Ok(CheckoutCompletion::PendingProfile {
                    tenant_id: tenant.id,
                })
            }
        }
    }

    /// Stripe success URL: confirm the session paid and close the intent.
    /// Tenant state is driven by the webhook stream, never from here.
    pub async fn confirm_stripe_success(
        &self,
        intent_id: Uuid,
    ) -> BillingResult<CheckoutCompletion> {
        let intent = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| BillingError::IntentNotFound(intent_id.to_string()))?;
        if intent.status == "completed" {
            return Ok(CheckoutCompletion::AlreadyCompleted);
        }

        let gateway = self
            .registry
            .get(&intent.gateway)
            .ok_or_else(|| BillingError::UnknownGateway(intent.gateway.clone()))?;
        let token = intent
            .gateway_token
            .clone()
            .ok_or_else(|| BillingError::Internal("intent has no checkout token".to_string()))?;

        let charge = gateway
            .complete_checkout(&token, None, intent.amount_cents, &intent.currency)
            .await?;
        self.store.mark_intent_charged(intent.id, &charge.txn_id).await?;
        self.store
            .mark_intent_completed(intent.id, charge.subscription_id.as_deref())
            .await?;

        tracing::info!(intent_id = %intent.id, "Stripe checkout session confirmed");
        Ok(CheckoutCompletion::Confirmed)
    }

    /// Cancel URL: the customer backed out at the provider. Only an
    /// unfinished intent is closed; a late or replayed cancel redirect
    /// must not touch one that already charged.
    pub async fn cancel(&self, intent_id: Uuid) -> BillingResult<CheckoutCompletion> {
        let intent = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| BillingError::IntentNotFound(intent_id.to_string()))?;
        if intent.status != "started" {
            return Ok(CheckoutCompletion::AlreadyCompleted);
        }
        self.store
            .mark_intent_failed(intent.id, "cancelled by payer")
            .await?;
        tracing::info!(intent_id = %intent.id, "Checkout cancelled by payer");
        Ok(CheckoutCompletion::Cancelled)
    }

    /// Apply a settled checkout charge to the tenant in one transaction:
    /// provision, set the plan, record the transaction, extend expiry.
    /// Claims the same idempotency key the payment notification maps to, so
    /// whichever of the two arrives second becomes a no-op.
    async fn apply_checkout_charge(
        &self,
        intent: &CheckoutIntent,
        txn_id: &str,
    ) -> BillingResult<(Tenant, OffsetDateTime)> {
        let now = OffsetDateTime::now_utc();
        let activation_key = intent
            .activation_key
            .clone()
            .ok_or_else(|| BillingError::Internal("intent has no activation key".to_string()))?;

        let mut tx = self.store.pool().begin().await?;

        // Claim before locking the tenant: the engine acquires in the same
        // order, so a racing payment notification cannot deadlock us
        let dedup_key = format!(
            "{}:txn:{}:{}",
            intent.gateway,
            txn_id,
            EventKind::PaymentSucceeded
        );
        let claimed =
            SubscriptionStore::claim_event_key(&mut tx, &dedup_key, intent.tenant_id).await?;

        let tenant = SubscriptionStore::provision_tenant(
            &mut tx,
            &activation_key,
            intent.level,
            intent.term_months,
            &intent.gateway,
        )
        .await?;

        if !claimed {
            // The payment notification raced us and already applied this
            // charge; nothing left to do.
            tx.commit().await?;
            return Ok((tenant.clone(), tenant.expires_at));
        }

        SubscriptionStore::set_plan(
            &mut tx,
            tenant.id,
            intent.level,
            intent.term_months,
            &intent.gateway,
        )
        .await?;
        SubscriptionStore::record_transaction(
            &mut tx,
            tenant.id,
            &intent.gateway,
            txn_id,
            intent.amount_cents,
            &intent.currency,
            now,
        )
        .await?;

        let paid_through =
            match next_paid_through(Some(tenant.expires_at), intent.term_months, now) {
                Some(new_expires) => {
                    // Same digest a payment notification for this charge
                    // would carry, so a double-fire inside the window is
                    // absorbed
                    let extension_key = format!(
                        ":{}:{}:{}",
                        intent.level, intent.term_months, intent.amount_cents
                    );
                    SubscriptionStore::extend_expiry(
                        &mut tx,
                        tenant.id,
                        new_expires,
                        &extension_key,
                    )
                    .await?;
                    new_expires
                }
                None => tenant.expires_at,
            };

        let stat = if intent.tenant_id.is_none() {
            "signup"
        } else {
            "renewal"
        };
        SubscriptionStore::record_stat(&mut tx, tenant.id, stat, &intent.gateway).await?;

        tx.commit().await?;
        Ok((tenant, paid_through))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-06-01 10:00 UTC);

    #[test]
    fn test_paid_through_extends_future_expiry() {
        let current = datetime!(2025-07-15 00:00 UTC);
        assert_eq!(
            next_paid_through(Some(current), 3, NOW),
            Some(datetime!(2025-10-15 00:00 UTC))
        );
    }

    #[test]
    fn test_paid_through_anchors_lapsed_tenant_at_now() {
        let current = datetime!(2025-01-01 00:00 UTC);
        assert_eq!(
            next_paid_through(Some(current), 1, NOW),
            Some(datetime!(2025-07-01 10:00 UTC))
        );
    }

    #[test]
    fn test_paid_through_leaves_comped_tenant_alone() {
        assert_eq!(next_paid_through(Some(NEVER_EXPIRES), 12, NOW), None);
    }

    #[test]
    fn test_paid_through_clamps_zero_term() {
        assert_eq!(
            next_paid_through(None, 0, NOW),
            Some(datetime!(2025-07-01 10:00 UTC))
        );
    }
}
