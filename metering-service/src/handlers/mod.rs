//! HTTP handlers for metering-service.

pub mod admin;
pub mod health;
pub mod usage;
pub mod webhooks;
