//! Sitebill Shared Types and Utilities
//!
//! This crate contains types and utilities shared across the Sitebill services.

pub mod db;
pub mod money;
pub mod types;

pub use db::*;
pub use money::*;
pub use types::*;
