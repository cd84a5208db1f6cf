//! Tradegate - Request Rate Limiting for the Trading Dashboard
//!
//! This crate implements in-process admission control for dashboard and API
//! calls: per-rule sliding windows with a shared quota, per-client violation
//! tracking, cooldown lockouts, and a call-site guard that turns denials into
//! typed errors.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod report;
pub mod simulate;
