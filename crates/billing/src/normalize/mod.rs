//! Event normalizers
//!
//! One module per provider wire format. Each takes a verified notification
//! payload and produces a canonical [`crate::event::BillingEvent`], or None
//! for notification types the engine does not act on.

pub mod paypal;
pub mod stripe;
