//! Reconciliation engine
//!
//! Folds normalized billing events into tenant state. The decision logic is
//! a pure function over a locked snapshot ([`decide`]); the surrounding
//! [`ReconcileEngine`] owns the transaction, the idempotency claim, and the
//! post-commit side effects.
//!
//! Ordering guarantees are deliberately weak: providers redeliver, reorder,
//! and double-fire notifications. Every rule here is written to be safe
//! under replay (dedup ledger + transaction uniqueness) and out-of-order
//! delivery (monotonic expiry, cancellation preserving the paid period).

use sitebill_shared::{add_months, TenantId, NEVER_EXPIRES};
use time::OffsetDateTime;

use crate::audit::BillingEventLog;
use crate::config::BillingConfig;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::event::{BillingEvent, EventKind, TenantRef};
use crate::gateway::GatewayRegistry;
use crate::store::{SubscriptionStore, TenantSnapshot, TransactionRecord};

/// Lifecycle counters recorded in `tenant_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Signup,
    Renewal,
    Upgrade,
    Modify,
    Cancel,
    Refund,
    Chargeback,
}

impl StatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Signup => "signup",
            StatKind::Renewal => "renewal",
            StatKind::Upgrade => "upgrade",
            StatKind::Modify => "modify",
            StatKind::Cancel => "cancel",
            StatKind::Refund => "refund",
            StatKind::Chargeback => "chargeback",
        }
    }
}

/// State changes the engine may order, applied inside one transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create (or adopt) the tenant for an activation key
    Provision {
        activation_key: String,
        level: i32,
        term_months: i32,
    },
    SetPlan {
        level: i32,
        term_months: i32,
    },
    /// Install a provider link, retiring any different active one
    AdoptLink {
        customer_id: Option<String>,
        subscription_id: String,
    },
    RecordTransaction {
        txn_id: String,
        amount_cents: i64,
        currency: String,
        occurred_at: OffsetDateTime,
    },
    ExtendExpiry {
        new_expires_at: OffsetDateTime,
        extension_key: String,
    },
    ApplyRefund {
        txn_id: String,
        delta_cents: i64,
    },
    MarkCancelled,
    /// Chargeback: cut access now, regardless of paid-through
    RevokeAccess {
        at: OffsetDateTime,
    },
    ClearPendingReconciliation,
    RecordStat(StatKind),
}

/// Post-commit effects. None of these may fail the event.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    SendReceipt {
        amount_cents: i64,
    },
    SendPaymentFailed {
        amount_cents: i64,
    },
    SendCancelled,
    /// Best-effort cancel of a superseded profile at the provider
    CancelProviderProfile {
        subscription_id: String,
    },
}

/// Verdict for a processed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Already processed (ledger claim, recorded transaction, or extension
    /// window); a replayed delivery lands here
    Duplicate,
    /// Understood but intentionally not acted on
    Ignored(&'static str),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Duplicate => "duplicate",
            Outcome::Ignored(_) => "ignored",
        }
    }
}

/// What the engine decided for one event
#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub mutations: Vec<Mutation>,
    pub effects: Vec<SideEffect>,
}

impl Decision {
    fn ignored(reason: &'static str) -> Self {
        Self {
            outcome: Outcome::Ignored(reason),
            mutations: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn duplicate() -> Self {
        Self {
            outcome: Outcome::Duplicate,
            mutations: Vec::new(),
            effects: Vec::new(),
        }
    }
}

/// Everything [`decide`] may look at, gathered under the tenant row lock
#[derive(Debug)]
pub struct EventContext<'a> {
    pub snapshot: Option<&'a TenantSnapshot>,
    /// The event's transaction id is already recorded
    pub txn_already_recorded: bool,
    /// The charge a refund/chargeback refers to
    pub refund_target: Option<&'a TransactionRecord>,
    pub now: OffsetDateTime,
    /// Seconds within which an identical extension is a double-fire
    pub extension_window_secs: i64,
}

/// True when the event names a subscription that is not the tenant's
/// active link: the link was superseded and the event is stale.
fn is_superseded(event: &BillingEvent, snapshot: &TenantSnapshot) -> bool {
    match (&event.subscription_id, &snapshot.active_link) {
        (Some(sub), Some(link)) => *sub != link.subscription_id,
        _ => false,
    }
}

/// The expiry a successful payment extends to: term months past the later
/// of now and the current paid-through date
fn extended_expiry(
    snapshot: Option<&TenantSnapshot>,
    event: &BillingEvent,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    let current = snapshot.map(|s| s.tenant.expires_at);
    if current == Some(NEVER_EXPIRES) {
        return None; // comped tenant, nothing to extend
    }
    let term = event
        .term_months
        .or(snapshot.map(|s| s.tenant.term_months))
        .unwrap_or(1)
        .max(1);
    let anchor = match current {
        Some(expires) if expires > now => expires,
        _ => now,
    };
    Some(add_months(anchor, term))
}

/// A checkout-time extension records its digest before any profile id
/// exists; when either side lacks the subscription segment, the plan/amount
/// portion alone identifies the cycle.
fn same_extension_digest(stored: &str, event_key: &str) -> bool {
    if stored == event_key {
        return true;
    }
    match (stored.split_once(':'), event_key.split_once(':')) {
        (Some((stored_sub, stored_rest)), Some((event_sub, event_rest))) => {
            (stored_sub.is_empty() || event_sub.is_empty()) && stored_rest == event_rest
        }
        _ => false,
    }
}

/// Events that would apply the exact same extension within the window are
/// the same notification fired twice (checkout completion + webhook, or an
/// IPN retry racing its original).
fn within_extension_window(
    event: &BillingEvent,
    snapshot: &TenantSnapshot,
    ctx: &EventContext,
) -> bool {
    match (
        &snapshot.tenant.last_extension_key,
        snapshot.tenant.last_extended_at,
    ) {
        (Some(key), Some(at)) => {
            same_extension_digest(key, &event.extension_key())
                && (ctx.now - at).whole_seconds().abs() < ctx.extension_window_secs
        }
        _ => false,
    }
}

fn decide_payment_succeeded(event: &BillingEvent, ctx: &EventContext) -> Decision {
    if ctx.txn_already_recorded {
        return Decision::duplicate();
    }
    let Some(txn_id) = event.txn_id.clone() else {
        return Decision::ignored("payment without transaction id");
    };

    let mut mutations = Vec::new();
    let mut stat = StatKind::Renewal;

    match ctx.snapshot {
        Some(snapshot) => {
            if is_superseded(event, snapshot) {
                return Decision::ignored("superseded provider link");
            }
            if within_extension_window(event, snapshot, ctx) {
                return Decision::duplicate();
            }
            if let (Some(level), Some(term)) = (event.level, event.term_months) {
                if level != snapshot.tenant.level || term != snapshot.tenant.term_months {
                    mutations.push(Mutation::SetPlan {
                        level,
                        term_months: term,
                    });
                }
            }
            if snapshot.active_link.is_none() {
                if let Some(sub) = &event.subscription_id {
                    mutations.push(Mutation::AdoptLink {
                        customer_id: event.customer_id.clone(),
                        subscription_id: sub.clone(),
                    });
                }
            }
            if snapshot.tenant.pending_reconciliation {
                mutations.push(Mutation::ClearPendingReconciliation);
            }
        }
        None => {
            // A payment for a tenant we have never seen: provision from the
            // activation key if the event carries one, otherwise drop it.
            let Some(TenantRef::ActivationKey(key)) = &event.tenant_ref else {
                return Decision::ignored("unknown tenant");
            };
            mutations.push(Mutation::Provision {
                activation_key: key.clone(),
                level: event.level.unwrap_or(1),
                term_months: event.term_months.unwrap_or(1),
            });
            if let Some(sub) = &event.subscription_id {
                mutations.push(Mutation::AdoptLink {
                    customer_id: event.customer_id.clone(),
                    subscription_id: sub.clone(),
                });
            }
            stat = StatKind::Signup;
        }
    }

    mutations.push(Mutation::RecordTransaction {
        txn_id,
        amount_cents: event.amount_cents,
        currency: event.currency.clone(),
        occurred_at: event.occurred_at,
    });
    if let Some(new_expires_at) = extended_expiry(ctx.snapshot, event, ctx.now) {
        mutations.push(Mutation::ExtendExpiry {
            new_expires_at,
            extension_key: event.extension_key(),
        });
    }
    mutations.push(Mutation::RecordStat(stat));

    Decision {
        outcome: Outcome::Applied,
        mutations,
        effects: vec![SideEffect::SendReceipt {
            amount_cents: event.amount_cents,
        }],
    }
}

fn decide_subscription_created(event: &BillingEvent, ctx: &EventContext) -> Decision {
    let Some(sub) = event.subscription_id.clone() else {
        return Decision::ignored("subscription event without id");
    };

    let mut mutations = Vec::new();
    let mut effects = Vec::new();

    match ctx.snapshot {
        Some(snapshot) => {
            if let Some(link) = &snapshot.active_link {
                if link.subscription_id == sub {
                    return Decision::duplicate();
                }
                // Replacement checkout: the old profile keeps billing unless
                // cancelled at the provider. Best effort, after commit.
                effects.push(SideEffect::CancelProviderProfile {
                    subscription_id: link.subscription_id.clone(),
                });
                mutations.push(Mutation::RecordStat(StatKind::Modify));
            } else {
                mutations.push(Mutation::RecordStat(StatKind::Signup));
            }
            if let (Some(level), Some(term)) = (event.level, event.term_months) {
                if level != snapshot.tenant.level || term != snapshot.tenant.term_months {
                    mutations.insert(
                        0,
                        Mutation::SetPlan {
                            level,
                            term_months: term,
                        },
                    );
                }
            }
        }
        None => {
            let Some(TenantRef::ActivationKey(key)) = &event.tenant_ref else {
                return Decision::ignored("unknown tenant");
            };
            mutations.push(Mutation::Provision {
                activation_key: key.clone(),
                level: event.level.unwrap_or(1),
                term_months: event.term_months.unwrap_or(1),
            });
            mutations.push(Mutation::RecordStat(StatKind::Signup));
        }
    }

    mutations.push(Mutation::AdoptLink {
        customer_id: event.customer_id.clone(),
        subscription_id: sub,
    });

    // Paid access starts with the profile. A trial profile's first real
    // charge arrives as its own payment event, and an extension the checkout
    // already applied must not run twice.
    let is_trial = ctx.snapshot.map(|s| s.tenant.is_trial).unwrap_or(false);
    let double_fired = ctx
        .snapshot
        .map(|s| within_extension_window(event, s, ctx))
        .unwrap_or(false);
    if !is_trial && !double_fired {
        if let Some(new_expires_at) = extended_expiry(ctx.snapshot, event, ctx.now) {
            mutations.push(Mutation::ExtendExpiry {
                new_expires_at,
                extension_key: event.extension_key(),
            });
        }
    }

    Decision {
        outcome: Outcome::Applied,
        mutations,
        effects,
    }
}

fn decide_subscription_updated(event: &BillingEvent, ctx: &EventContext) -> Decision {
    let Some(snapshot) = ctx.snapshot else {
        return Decision::ignored("unknown tenant");
    };
    if is_superseded(event, snapshot) {
        return Decision::ignored("superseded provider link");
    }

    let (Some(level), Some(term)) = (
        event.level.or(Some(snapshot.tenant.level)),
        event.term_months.or(Some(snapshot.tenant.term_months)),
    ) else {
        return Decision::ignored("no plan change");
    };

    if level == snapshot.tenant.level && term == snapshot.tenant.term_months {
        return Decision::ignored("no plan change");
    }

    let stat = if level > snapshot.tenant.level {
        StatKind::Upgrade
    } else {
        StatKind::Modify
    };

    let mut mutations = vec![
        Mutation::SetPlan {
            level,
            term_months: term,
        },
        Mutation::RecordStat(stat),
    ];
    // The plan change re-buys the term: extend under the new term, anchored
    // the same way a renewal is
    if !within_extension_window(event, snapshot, ctx) {
        if let Some(new_expires_at) = extended_expiry(ctx.snapshot, event, ctx.now) {
            mutations.push(Mutation::ExtendExpiry {
                new_expires_at,
                extension_key: event.extension_key(),
            });
        }
    }

    Decision {
        outcome: Outcome::Applied,
        mutations,
        effects: Vec::new(),
    }
}

fn decide_subscription_cancelled(event: &BillingEvent, ctx: &EventContext) -> Decision {
    let Some(snapshot) = ctx.snapshot else {
        return Decision::ignored("unknown tenant");
    };
    if is_superseded(event, snapshot) {
        return Decision::ignored("superseded provider link");
    }
    if snapshot.tenant.is_cancelled {
        return Decision::duplicate();
    }

    // Paid-through access is preserved: expiry is not touched.
    Decision {
        outcome: Outcome::Applied,
        mutations: vec![
            Mutation::MarkCancelled,
            Mutation::RecordStat(StatKind::Cancel),
        ],
        effects: vec![SideEffect::SendCancelled],
    }
}

fn decide_payment_failed(event: &BillingEvent, ctx: &EventContext) -> Decision {
    let Some(snapshot) = ctx.snapshot else {
        return Decision::ignored("unknown tenant");
    };
    if is_superseded(event, snapshot) {
        return Decision::ignored("superseded provider link");
    }
    // No state change: the provider retries on its own schedule and a
    // suspension arrives as its own notification.
    Decision {
        outcome: Outcome::Applied,
        mutations: Vec::new(),
        effects: vec![SideEffect::SendPaymentFailed {
            amount_cents: event.amount_cents,
        }],
    }
}

fn decide_refund(event: &BillingEvent, ctx: &EventContext) -> Decision {
    let Some(target) = ctx.refund_target else {
        return Decision::ignored("refund for unknown transaction");
    };
    let refundable = target.amount_cents - target.refunded_cents;
    if refundable <= 0 {
        return Decision::duplicate();
    }
    // A refund event without an amount means the full remainder
    let delta = if event.amount_cents > 0 {
        event.amount_cents.min(refundable)
    } else {
        refundable
    };

    Decision {
        outcome: Outcome::Applied,
        mutations: vec![
            Mutation::ApplyRefund {
                txn_id: target.txn_id.clone(),
                delta_cents: delta,
            },
            Mutation::RecordStat(StatKind::Refund),
        ],
        effects: Vec::new(),
    }
}

fn decide_chargeback(event: &BillingEvent, ctx: &EventContext) -> Decision {
    if ctx.snapshot.is_none() && ctx.refund_target.is_none() {
        return Decision::ignored("chargeback for unknown transaction");
    }

    let mut mutations = Vec::new();
    if let Some(target) = ctx.refund_target {
        let refundable = target.amount_cents - target.refunded_cents;
        if refundable > 0 {
            let delta = if event.amount_cents > 0 {
                event.amount_cents.min(refundable)
            } else {
                refundable
            };
            mutations.push(Mutation::ApplyRefund {
                txn_id: target.txn_id.clone(),
                delta_cents: delta,
            });
        }
    }
    // Funds were taken back: access ends now, not at paid-through.
    mutations.push(Mutation::RevokeAccess { at: ctx.now });
    mutations.push(Mutation::RecordStat(StatKind::Chargeback));

    Decision {
        outcome: Outcome::Applied,
        mutations,
        effects: Vec::new(),
    }
}

/// Pure decision function: no I/O, fully deterministic in its inputs
pub fn decide(event: &BillingEvent, ctx: &EventContext) -> Decision {
    match event.kind {
        EventKind::PaymentSucceeded => decide_payment_succeeded(event, ctx),
        EventKind::PaymentFailed => decide_payment_failed(event, ctx),
        EventKind::PaymentPending => Decision::ignored("payment pending"),
        EventKind::SubscriptionCreated => decide_subscription_created(event, ctx),
        EventKind::SubscriptionUpdated => decide_subscription_updated(event, ctx),
        EventKind::SubscriptionCancelled => decide_subscription_cancelled(event, ctx),
        EventKind::Refunded | EventKind::PartiallyRefunded => decide_refund(event, ctx),
        EventKind::ChargebackReversed => decide_chargeback(event, ctx),
    }
}

/// Applies decisions transactionally and runs post-commit effects
#[derive(Clone)]
pub struct ReconcileEngine {
    store: SubscriptionStore,
    registry: GatewayRegistry,
    email: BillingEmailService,
    audit: BillingEventLog,
    config: BillingConfig,
}

impl ReconcileEngine {
    pub fn new(
        store: SubscriptionStore,
        registry: GatewayRegistry,
        email: BillingEmailService,
        audit: BillingEventLog,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            registry,
            email,
            audit,
            config,
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    /// Process one normalized event end to end: claim the idempotency key,
    /// lock the tenant, decide, apply, commit, then side effects.
    pub async fn process(&self, event: &BillingEvent) -> BillingResult<Outcome> {
        let now = OffsetDateTime::now_utc();
        let resolved = self.store.resolve_tenant(event).await?;

        let mut tx = self.store.pool().begin().await?;

        let claimed =
            SubscriptionStore::claim_event_key(&mut tx, &event.dedup_key(), resolved).await?;
        if !claimed {
            tx.commit().await?;
            tracing::info!(
                gateway = %event.gateway,
                event_type = %event.kind,
                dedup_key = %event.dedup_key(),
                "Duplicate delivery, already processed"
            );
            self.audit.record(event, resolved, &Outcome::Duplicate).await;
            return Ok(Outcome::Duplicate);
        }

        let snapshot = match resolved {
            Some(id) => SubscriptionStore::load_snapshot(&mut tx, id, &event.gateway).await?,
            None => None,
        };

        let refund_target = match (&event.kind, &event.txn_id) {
            (
                EventKind::Refunded | EventKind::PartiallyRefunded | EventKind::ChargebackReversed,
                Some(txn),
            ) => SubscriptionStore::transaction_record(&mut tx, &event.gateway, txn).await?,
            _ => None,
        };

        let txn_already_recorded = match (&event.kind, &event.txn_id) {
            (EventKind::PaymentSucceeded, Some(txn)) => {
                SubscriptionStore::transaction_record(&mut tx, &event.gateway, txn)
                    .await?
                    .is_some()
            }
            _ => false,
        };

        let ctx = EventContext {
            snapshot: snapshot.as_ref(),
            txn_already_recorded,
            refund_target: refund_target.as_ref(),
            now,
            extension_window_secs: self.config.extension_dedup_window_secs,
        };
        let decision = decide(event, &ctx);

        let mut tenant_id = snapshot
            .as_ref()
            .map(|s| s.tenant.id)
            .or(refund_target.as_ref().map(|t| t.tenant_id));
        for mutation in &decision.mutations {
            tenant_id = self
                .apply_mutation(&mut tx, tenant_id, event, mutation)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            gateway = %event.gateway,
            event_type = %event.kind,
            tenant_id = ?tenant_id,
            outcome = decision.outcome.as_str(),
            "Processed billing event"
        );

        self.audit.record(event, tenant_id, &decision.outcome).await;
        self.run_effects(event, tenant_id, &decision.effects).await;

        Ok(decision.outcome)
    }

    async fn apply_mutation(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tenant_id: Option<TenantId>,
        event: &BillingEvent,
        mutation: &Mutation,
    ) -> BillingResult<Option<TenantId>> {
        if let Mutation::Provision {
            activation_key,
            level,
            term_months,
        } = mutation
        {
            let tenant = SubscriptionStore::provision_tenant(
                tx,
                activation_key,
                *level,
                *term_months,
                &event.gateway,
            )
            .await?;
            return Ok(Some(tenant.id));
        }

        let id = tenant_id.ok_or_else(|| {
            BillingError::Internal("mutation ordered without a tenant".to_string())
        })?;

        match mutation {
            Mutation::Provision { .. } => unreachable!("handled above"),
            Mutation::SetPlan { level, term_months } => {
                SubscriptionStore::set_plan(tx, id, *level, *term_months, &event.gateway).await?;
            }
            Mutation::AdoptLink {
                customer_id,
                subscription_id,
            } => {
                SubscriptionStore::supersede_link(
                    tx,
                    id,
                    &event.gateway,
                    customer_id.as_deref(),
                    subscription_id,
                )
                .await?;
            }
            Mutation::RecordTransaction {
                txn_id,
                amount_cents,
                currency,
                occurred_at,
            } => {
                SubscriptionStore::record_transaction(
                    tx,
                    id,
                    &event.gateway,
                    txn_id,
                    *amount_cents,
                    currency,
                    *occurred_at,
                )
                .await?;
            }
            Mutation::ExtendExpiry {
                new_expires_at,
                extension_key,
            } => {
                SubscriptionStore::extend_expiry(tx, id, *new_expires_at, extension_key).await?;
            }
            Mutation::ApplyRefund {
                txn_id,
                delta_cents,
            } => {
                SubscriptionStore::apply_refund(tx, &event.gateway, txn_id, *delta_cents).await?;
            }
            Mutation::MarkCancelled => {
                SubscriptionStore::mark_cancelled(tx, id).await?;
            }
            Mutation::RevokeAccess { at } => {
                SubscriptionStore::revoke_access(tx, id, *at).await?;
            }
            Mutation::ClearPendingReconciliation => {
                SubscriptionStore::set_pending_reconciliation(tx, id, false).await?;
            }
            Mutation::RecordStat(stat) => {
                SubscriptionStore::record_stat(tx, id, stat.as_str(), &event.gateway).await?;
            }
        }
        Ok(Some(id))
    }

    async fn run_effects(
        &self,
        event: &BillingEvent,
        tenant_id: Option<TenantId>,
        effects: &[SideEffect],
    ) {
        if effects.is_empty() {
            return;
        }

        let tenant = match tenant_id {
            Some(id) => self.store.find_tenant(id).await.ok().flatten(),
            None => None,
        };

        for effect in effects {
            match effect {
                SideEffect::SendReceipt { amount_cents } => {
                    if let Some(t) = &tenant {
                        let plan = self.config.plans.name(t.level).to_string();
                        let _ = self
                            .email
                            .send_receipt(&t.email, &plan, *amount_cents, t.expires_at)
                            .await;
                    }
                }
                SideEffect::SendPaymentFailed { amount_cents } => {
                    if let Some(t) = &tenant {
                        let _ = self.email.send_payment_failed(&t.email, *amount_cents).await;
                    }
                }
                SideEffect::SendCancelled => {
                    if let Some(t) = &tenant {
                        let _ = self.email.send_cancelled(&t.email, t.expires_at).await;
                    }
                }
                SideEffect::CancelProviderProfile { subscription_id } => {
                    let Some(gateway) = self.registry.get(&event.gateway) else {
                        continue;
                    };
                    if let Err(e) = gateway
                        .cancel_profile(subscription_id, "superseded by a new subscription")
                        .await
                    {
                        // Log-not-fail: the link is already retired locally
                        tracing::warn!(
                            gateway = %event.gateway,
                            subscription_id = %subscription_id,
                            error = %e,
                            "Failed to cancel superseded provider profile"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{ProviderLink, Tenant};
    use time::macros::datetime;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2025-06-01 10:00 UTC);

    fn tenant(level: i32, term: i32, expires_at: OffsetDateTime) -> Tenant {
        Tenant {
            id: TenantId(42),
            activation_key: Some("abc".to_string()),
            email: "owner@example.com".to_string(),
            display_name: "Example".to_string(),
            level,
            term_months: term,
            expires_at,
            is_trial: false,
            is_cancelled: false,
            pending_reconciliation: false,
            gateway: Some("paypal".to_string()),
            last_extension_key: None,
            last_extended_at: None,
        }
    }

    fn link(sub: &str) -> ProviderLink {
        ProviderLink {
            id: Uuid::nil(),
            tenant_id: TenantId(42),
            gateway: "paypal".to_string(),
            customer_id: Some("PAYER1".to_string()),
            subscription_id: sub.to_string(),
            is_active: true,
        }
    }

    fn snapshot(t: Tenant, l: Option<ProviderLink>) -> TenantSnapshot {
        TenantSnapshot {
            tenant: t,
            active_link: l,
        }
    }

    fn payment(sub: &str, txn: &str) -> BillingEvent {
        BillingEvent {
            gateway: "paypal".to_string(),
            kind: EventKind::PaymentSucceeded,
            tenant_ref: Some(TenantRef::Id(TenantId(42))),
            subscription_id: Some(sub.to_string()),
            customer_id: Some("PAYER1".to_string()),
            txn_id: Some(txn.to_string()),
            level: Some(2),
            term_months: Some(3),
            amount_cents: 7500,
            currency: "USD".to_string(),
            occurred_at: NOW,
            provider_event_id: None,
        }
    }

    fn ctx<'a>(snapshot: Option<&'a TenantSnapshot>) -> EventContext<'a> {
        EventContext {
            snapshot,
            txn_already_recorded: false,
            refund_target: None,
            now: NOW,
            extension_window_secs: 300,
        }
    }

    #[test]
    fn test_renewal_extends_from_future_expiry() {
        let expires = datetime!(2025-07-01 00:00 UTC);
        let snap = snapshot(tenant(2, 3, expires), Some(link("I-1")));
        let d = decide(&payment("I-1", "TXN-1"), &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::ExtendExpiry {
            new_expires_at: datetime!(2025-10-01 00:00 UTC),
            extension_key: "I-1:2:3:7500".to_string(),
        }));
        assert!(d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::RecordTransaction { .. })));
        assert!(d
            .effects
            .contains(&SideEffect::SendReceipt { amount_cents: 7500 }));
    }

    #[test]
    fn test_lapsed_tenant_extends_from_now() {
        let snap = snapshot(
            tenant(2, 3, datetime!(2025-01-01 00:00 UTC)),
            Some(link("I-1")),
        );
        let d = decide(&payment("I-1", "TXN-1"), &ctx(Some(&snap)));
        assert!(d.mutations.contains(&Mutation::ExtendExpiry {
            new_expires_at: datetime!(2025-09-01 10:00 UTC),
            extension_key: "I-1:2:3:7500".to_string(),
        }));
    }

    #[test]
    fn test_same_txn_is_duplicate() {
        // Same charge delivered under a second notification id
        let snap = snapshot(tenant(2, 3, NOW), Some(link("I-1")));
        let mut c = ctx(Some(&snap));
        c.txn_already_recorded = true;
        let d = decide(&payment("I-1", "TXN-1"), &c);
        assert_eq!(d.outcome, Outcome::Duplicate);
        assert!(d.mutations.is_empty());
    }

    #[test]
    fn test_double_fired_extension_is_duplicate() {
        let mut t = tenant(2, 3, datetime!(2025-09-01 00:00 UTC));
        t.last_extension_key = Some("I-1:2:3:7500".to_string());
        t.last_extended_at = Some(NOW - time::Duration::seconds(60));
        let snap = snapshot(t, Some(link("I-1")));
        let d = decide(&payment("I-1", "TXN-2"), &ctx(Some(&snap)));
        assert_eq!(d.outcome, Outcome::Duplicate);
    }

    #[test]
    fn test_extension_outside_window_applies() {
        let mut t = tenant(2, 3, datetime!(2025-09-01 00:00 UTC));
        t.last_extension_key = Some("I-1:2:3:7500".to_string());
        t.last_extended_at = Some(NOW - time::Duration::seconds(301));
        let snap = snapshot(t, Some(link("I-1")));
        let d = decide(&payment("I-1", "TXN-2"), &ctx(Some(&snap)));
        assert_eq!(d.outcome, Outcome::Applied);
    }

    #[test]
    fn test_superseded_link_payment_ignored() {
        // Tenant re-subscribed as I-2; a late payment for I-1 must not apply
        let snap = snapshot(tenant(2, 3, NOW), Some(link("I-2")));
        let d = decide(&payment("I-1", "TXN-9"), &ctx(Some(&snap)));
        assert_eq!(d.outcome, Outcome::Ignored("superseded provider link"));
    }

    #[test]
    fn test_payment_for_unknown_tenant_provisions_from_activation_key() {
        let mut e = payment("I-1", "TXN-1");
        e.tenant_ref = Some(TenantRef::ActivationKey("fresh-key".to_string()));
        let d = decide(&e, &ctx(None));
        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::Provision {
            activation_key: "fresh-key".to_string(),
            level: 2,
            term_months: 3,
        }));
        assert!(d.mutations.contains(&Mutation::RecordStat(StatKind::Signup)));
    }

    #[test]
    fn test_payment_for_unresolvable_tenant_ignored() {
        let mut e = payment("I-1", "TXN-1");
        e.tenant_ref = Some(TenantRef::ProviderCustomer("cus_x".to_string()));
        let d = decide(&e, &ctx(None));
        assert_eq!(d.outcome, Outcome::Ignored("unknown tenant"));
    }

    #[test]
    fn test_cancellation_preserves_paid_period() {
        let expires = datetime!(2025-09-01 00:00 UTC);
        let snap = snapshot(tenant(2, 3, expires), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionCancelled;
        e.txn_id = None;
        let d = decide(&e, &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::MarkCancelled));
        // No expiry mutation: access runs until paid-through
        assert!(!d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::ExtendExpiry { .. } | Mutation::RevokeAccess { .. })));
    }

    #[test]
    fn test_final_payment_after_cancellation_still_applies() {
        // Cancellation arrived first; the already-settled final charge
        // still records and extends, and the tenant stays cancelled.
        let mut t = tenant(2, 3, datetime!(2025-07-01 00:00 UTC));
        t.is_cancelled = true;
        let snap = snapshot(t, Some(link("I-1")));
        let d = decide(&payment("I-1", "TXN-F"), &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::ExtendExpiry { .. })));
        // Nothing revokes or resets the cancelled flag
        assert!(!d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::RevokeAccess { .. })));
    }

    #[test]
    fn test_repeat_cancellation_is_duplicate() {
        let mut t = tenant(2, 3, NOW);
        t.is_cancelled = true;
        let snap = snapshot(t, Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionCancelled;
        e.txn_id = None;
        assert_eq!(decide(&e, &ctx(Some(&snap))).outcome, Outcome::Duplicate);
    }

    #[test]
    fn test_resubscribe_supersedes_and_cancels_old_profile() {
        let snap = snapshot(tenant(2, 3, NOW), Some(link("I-OLD")));
        let mut e = payment("I-NEW", "TXN-1");
        e.kind = EventKind::SubscriptionCreated;
        e.txn_id = None;
        let d = decide(&e, &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::AdoptLink {
            customer_id: Some("PAYER1".to_string()),
            subscription_id: "I-NEW".to_string(),
        }));
        assert!(d.effects.contains(&SideEffect::CancelProviderProfile {
            subscription_id: "I-OLD".to_string(),
        }));
    }

    #[test]
    fn test_profile_created_provisions_with_paid_term() {
        // A recurring profile for a brand-new tenant buys the first term:
        // access runs term months from now, not zero.
        let mut e = payment("I-NEW", "unused");
        e.kind = EventKind::SubscriptionCreated;
        e.txn_id = None;
        e.tenant_ref = Some(TenantRef::ActivationKey("fresh-key".to_string()));
        e.level = Some(3);
        e.term_months = Some(12);
        let d = decide(&e, &ctx(None));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::Provision {
            activation_key: "fresh-key".to_string(),
            level: 3,
            term_months: 12,
        }));
        assert!(d.mutations.contains(&Mutation::ExtendExpiry {
            new_expires_at: datetime!(2026-06-01 10:00 UTC),
            extension_key: "I-NEW:3:12:7500".to_string(),
        }));
    }

    #[test]
    fn test_trial_profile_does_not_extend() {
        // A trial's first real charge arrives as its own payment event
        let mut t = tenant(2, 3, datetime!(2025-06-15 00:00 UTC));
        t.is_trial = true;
        let snap = snapshot(t, None);
        let mut e = payment("I-NEW", "unused");
        e.kind = EventKind::SubscriptionCreated;
        e.txn_id = None;
        let d = decide(&e, &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(!d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::ExtendExpiry { .. })));
    }

    #[test]
    fn test_profile_created_after_checkout_does_not_extend_twice() {
        // Checkout already extended minutes ago; its digest carries no
        // profile id. The profile-created IPN adopts the link but must not
        // re-buy the term.
        let mut t = tenant(2, 3, datetime!(2025-09-01 00:00 UTC));
        t.last_extension_key = Some(":2:3:7500".to_string());
        t.last_extended_at = Some(NOW - time::Duration::seconds(90));
        let snap = snapshot(t, None);
        let mut e = payment("I-NEW", "unused");
        e.kind = EventKind::SubscriptionCreated;
        e.txn_id = None;
        let d = decide(&e, &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::AdoptLink {
            customer_id: Some("PAYER1".to_string()),
            subscription_id: "I-NEW".to_string(),
        }));
        assert!(!d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::ExtendExpiry { .. })));
    }

    #[test]
    fn test_subscription_created_replay_is_duplicate() {
        let snap = snapshot(tenant(2, 3, NOW), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionCreated;
        assert_eq!(decide(&e, &ctx(Some(&snap))).outcome, Outcome::Duplicate);
    }

    #[test]
    fn test_level_increase_is_upgrade_stat() {
        let snap = snapshot(tenant(1, 3, NOW), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionUpdated;
        e.level = Some(2);
        let d = decide(&e, &ctx(Some(&snap)));
        assert!(d.mutations.contains(&Mutation::RecordStat(StatKind::Upgrade)));
    }

    #[test]
    fn test_term_change_is_modify_stat() {
        let snap = snapshot(tenant(2, 1, NOW), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionUpdated;
        e.level = Some(2);
        e.term_months = Some(12);
        let d = decide(&e, &ctx(Some(&snap)));
        assert!(d.mutations.contains(&Mutation::RecordStat(StatKind::Modify)));
    }

    #[test]
    fn test_plan_change_reextends_under_new_term() {
        // Upgrade mid-cycle: the new term is bought on top of the time
        // already paid for, anchored like a renewal
        let expires = datetime!(2025-07-01 00:00 UTC);
        let snap = snapshot(tenant(1, 3, expires), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::SubscriptionUpdated;
        e.txn_id = None;
        e.level = Some(2);
        e.term_months = Some(12);
        let d = decide(&e, &ctx(Some(&snap)));

        assert_eq!(d.outcome, Outcome::Applied);
        assert!(d.mutations.contains(&Mutation::SetPlan {
            level: 2,
            term_months: 12,
        }));
        assert!(d.mutations.contains(&Mutation::ExtendExpiry {
            new_expires_at: datetime!(2026-07-01 00:00 UTC),
            extension_key: "I-1:2:12:7500".to_string(),
        }));
    }

    #[test]
    fn test_refund_clamped_to_remaining() {
        let target = TransactionRecord {
            id: Uuid::nil(),
            tenant_id: TenantId(42),
            gateway: "stripe".to_string(),
            txn_id: "ch_1".to_string(),
            amount_cents: 7500,
            refunded_cents: 6000,
            currency: "USD".to_string(),
            occurred_at: NOW,
        };
        let mut e = payment("I-1", "ch_1");
        e.kind = EventKind::PartiallyRefunded;
        e.amount_cents = 5000;
        let mut c = ctx(None);
        c.refund_target = Some(&target);
        let d = decide(&e, &c);
        assert!(d.mutations.contains(&Mutation::ApplyRefund {
            txn_id: "ch_1".to_string(),
            delta_cents: 1500,
        }));
    }

    #[test]
    fn test_fully_refunded_charge_is_duplicate() {
        let target = TransactionRecord {
            id: Uuid::nil(),
            tenant_id: TenantId(42),
            gateway: "stripe".to_string(),
            txn_id: "ch_1".to_string(),
            amount_cents: 7500,
            refunded_cents: 7500,
            currency: "USD".to_string(),
            occurred_at: NOW,
        };
        let mut e = payment("I-1", "ch_1");
        e.kind = EventKind::Refunded;
        let mut c = ctx(None);
        c.refund_target = Some(&target);
        assert_eq!(decide(&e, &c).outcome, Outcome::Duplicate);
    }

    #[test]
    fn test_chargeback_revokes_access_immediately() {
        let target = TransactionRecord {
            id: Uuid::nil(),
            tenant_id: TenantId(42),
            gateway: "paypal".to_string(),
            txn_id: "TXN-1".to_string(),
            amount_cents: 7500,
            refunded_cents: 0,
            currency: "USD".to_string(),
            occurred_at: NOW,
        };
        let snap = snapshot(tenant(2, 3, datetime!(2025-09-01 00:00 UTC)), Some(link("I-1")));
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::ChargebackReversed;
        let mut c = ctx(Some(&snap));
        c.refund_target = Some(&target);
        let d = decide(&e, &c);

        assert!(d.mutations.contains(&Mutation::RevokeAccess { at: NOW }));
        assert!(d.mutations.contains(&Mutation::ApplyRefund {
            txn_id: "TXN-1".to_string(),
            delta_cents: 7500,
        }));
    }

    #[test]
    fn test_comped_tenant_expiry_untouched() {
        let snap = snapshot(
            tenant(2, 3, sitebill_shared::NEVER_EXPIRES),
            Some(link("I-1")),
        );
        let d = decide(&payment("I-1", "TXN-1"), &ctx(Some(&snap)));
        assert_eq!(d.outcome, Outcome::Applied);
        assert!(!d
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::ExtendExpiry { .. })));
    }

    #[test]
    fn test_payment_clears_pending_reconciliation() {
        let mut t = tenant(2, 3, NOW);
        t.pending_reconciliation = true;
        let snap = snapshot(t, Some(link("I-1")));
        let d = decide(&payment("I-1", "TXN-1"), &ctx(Some(&snap)));
        assert!(d.mutations.contains(&Mutation::ClearPendingReconciliation));
    }

    #[test]
    fn test_payment_pending_is_ignored() {
        let mut e = payment("I-1", "TXN-1");
        e.kind = EventKind::PaymentPending;
        assert_eq!(decide(&e, &ctx(None)).outcome, Outcome::Ignored("payment pending"));
    }
}
