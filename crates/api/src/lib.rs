//! Sitebill API Library
//!
//! HTTP surface of the billing system: gateway notification intake
//! (PayPal IPN, Stripe webhooks), checkout endpoints, and health checks.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
