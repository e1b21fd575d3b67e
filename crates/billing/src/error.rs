//! Billing error types

use thiserror::Error;

use crate::gateway::GatewayError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Checkout intent not found: {0}")]
    IntentNotFound(String),

    #[error("Invalid plan level: {0}")]
    InvalidLevel(i32),

    #[error("Notification signature verification failed")]
    SignatureInvalid,

    #[error("Notification could not be verified with the gateway: {0}")]
    VerificationUnavailable(String),

    #[error("Malformed notification payload: {0}")]
    MalformedPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
