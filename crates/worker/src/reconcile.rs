//! Pending-profile reconciliation sweep
//!
//! A checkout charge can settle while the recurring-profile creation fails
//! (Scenario: the customer paid, nothing will bill the next term). Those
//! intents park in `pending_profile`; this sweep retries them, and alerts a
//! human once the retry budget is spent.

use std::sync::Arc;
use std::time::Duration;

use sitebill_billing::gateway::RecurringProfileRequest;
use sitebill_billing::store::{CheckoutIntent, SubscriptionStore};
use sitebill_billing::{BillingError, BillingResult, BillingService};
use sitebill_billing::gateway::GatewayError;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

/// Attempts across sweep runs before an intent needs a human
pub const MAX_PROFILE_ATTEMPTS: i32 = 5;

/// In-run retries against the gateway per attempt
const GATEWAY_RETRIES: usize = 3;

/// Outcome counts for one sweep run
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub recovered: usize,
    pub retried: usize,
    pub exhausted: usize,
}

pub struct ProfileSweep {
    billing: Arc<BillingService>,
}

impl ProfileSweep {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }

    /// Work the pending_profile queue until it is drained. Each intent is
    /// claimed and resolved in its own transaction so a crash mid-sweep
    /// loses at most the in-flight intent's attempt.
    pub async fn run(&self) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        loop {
            let mut tx = self.billing.store.pool().begin().await?;
            let Some(intent) =
                SubscriptionStore::claim_one_pending_profile_intent(&mut tx, MAX_PROFILE_ATTEMPTS)
                    .await?
            else {
                tx.commit().await?;
                break;
            };

            match self.create_profile(&intent).await {
                Ok((subscription_id, customer_id, tenant_id)) => {
                    SubscriptionStore::supersede_link(
                        &mut tx,
                        tenant_id,
                        &intent.gateway,
                        customer_id.as_deref(),
                        &subscription_id,
                    )
                    .await?;
                    SubscriptionStore::set_pending_reconciliation(&mut tx, tenant_id, false)
                        .await?;
                    SubscriptionStore::complete_intent(&mut tx, intent.id, &subscription_id)
                        .await?;
                    tx.commit().await?;

                    info!(
                        intent_id = %intent.id,
                        tenant_id = %tenant_id,
                        subscription_id = %subscription_id,
                        "Recovered recurring profile for settled charge"
                    );
                    summary.recovered += 1;
                }
                Err(e) => {
                    let attempts =
                        SubscriptionStore::record_profile_attempt(&mut tx, intent.id, &e.to_string())
                            .await?;
                    tx.commit().await?;

                    if attempts >= MAX_PROFILE_ATTEMPTS {
                        error!(
                            intent_id = %intent.id,
                            attempts,
                            error = %e,
                            "Profile creation retry budget exhausted, alerting"
                        );
                        let _ = self
                            .billing
                            .email
                            .send_reconciliation_alert(
                                &self.billing.config.alerts_email,
                                intent.tenant_id.map(|t| t.0).unwrap_or(0),
                                &intent.id.to_string(),
                                &e.to_string(),
                            )
                            .await;
                        summary.exhausted += 1;
                    } else {
                        warn!(
                            intent_id = %intent.id,
                            attempts,
                            error = %e,
                            "Profile creation failed again, will retry next sweep"
                        );
                        summary.retried += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// One attempt (with in-run backoff) at creating the recurring profile
    /// for a parked intent.
    async fn create_profile(
        &self,
        intent: &CheckoutIntent,
    ) -> BillingResult<(String, Option<String>, sitebill_shared::TenantId)> {
        let gateway = self
            .billing
            .registry
            .get(&intent.gateway)
            .ok_or_else(|| BillingError::UnknownGateway(intent.gateway.clone()))?;

        let activation_key = intent
            .activation_key
            .clone()
            .ok_or_else(|| BillingError::Internal("intent has no activation key".to_string()))?;
        let tenant = self
            .billing
            .store
            .find_tenant_by_activation_key(&activation_key)
            .await?
            .ok_or_else(|| BillingError::TenantNotFound(activation_key.clone()))?;
        let customer_id = self
            .billing
            .store
            .find_active_link(tenant.id, &intent.gateway)
            .await?
            .and_then(|l| l.customer_id);

        let request = RecurringProfileRequest {
            activation_key,
            plan_name: self.billing.config.plans.name(intent.level).to_string(),
            level: intent.level,
            term_months: intent.term_months,
            amount_cents: intent.amount_cents,
            currency: intent.currency.clone(),
            checkout_token: intent.gateway_token.clone(),
            payer_ref: None,
            customer_id,
            // The settled charge already covers the current term
            start_at: tenant.expires_at,
            trial_days: self.billing.config.trial_days,
            setup_fee_cents: self.billing.config.setup_fee_cents,
        };

        let strategy = ExponentialBackoff::from_millis(500)
            .max_delay(Duration::from_secs(8))
            .map(jitter)
            .take(GATEWAY_RETRIES);

        let profile = RetryIf::spawn(
            strategy,
            || gateway.create_recurring_profile(&request),
            |e: &GatewayError| e.retryable,
        )
        .await?;

        Ok((profile.subscription_id, profile.customer_id, tenant.id))
    }
}
